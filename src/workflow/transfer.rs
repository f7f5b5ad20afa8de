//! Type-transfer matrix
//!
//! Precomputed map from input detailed types to the detailed types they can
//! be converted into, and by which tools. Only tools with exactly one
//! required parameter participate; that keeps the search monotone and
//! bounded by the number of distinct detailed types.

use crate::tools::ToolDocument;
use crate::types::{AppError, AppResult};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Default)]
pub struct TransferMatrix {
    /// input detailed type -> output detailed type -> producing tools
    edges: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl TransferMatrix {
    pub fn build<'a>(documents: impl IntoIterator<Item = &'a ToolDocument>) -> Self {
        let mut edges: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
        for doc in documents {
            if doc.required_parameters.len() != 1 {
                continue;
            }
            let input_type = doc.required_parameters[0].detailed_type.clone();
            for ret in &doc.return_values {
                if ret.detailed_type == input_type {
                    continue;
                }
                edges
                    .entry(input_type.clone())
                    .or_default()
                    .entry(ret.detailed_type.clone())
                    .or_default()
                    .push(doc.tool_name.clone());
            }
        }
        Self { edges }
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// All minimum-length tool chains converting `from` into `to`. Empty
    /// exactly when `to` is unreachable from `from`.
    pub fn find_path(&self, from: &str, to: &str) -> Vec<Vec<String>> {
        if from == to {
            return Vec::new();
        }
        let mut excluded = HashSet::new();
        excluded.insert(from.to_string());
        self.search(from, to, &mut excluded)
    }

    fn search(&self, from: &str, to: &str, excluded: &mut HashSet<String>) -> Vec<Vec<String>> {
        let Some(outgoing) = self.edges.get(from) else {
            return Vec::new();
        };

        let mut found: Vec<Vec<String>> = Vec::new();
        if let Some(tools) = outgoing.get(to) {
            found.extend(tools.iter().map(|t| vec![t.clone()]));
        }

        for (mid, tools) in outgoing {
            if mid == to || excluded.contains(mid) {
                continue;
            }
            excluded.insert(mid.clone());
            let tails = self.search(mid, to, excluded);
            excluded.remove(mid);

            for tail in &tails {
                for tool in tools {
                    let mut path = Vec::with_capacity(1 + tail.len());
                    path.push(tool.clone());
                    path.extend(tail.iter().cloned());
                    found.push(path);
                }
            }
        }

        if let Some(min) = found.iter().map(|p| p.len()).min() {
            found.retain(|p| p.len() == min);
        }
        found
    }

    /// One converter chain producing every missing type from the available
    /// ones. Per missing type the shortest paths are kept; across types the
    /// combination with the fewest distinct tools wins, ties broken at
    /// random, and the winning concatenation is deduplicated preserving
    /// first occurrence.
    pub fn chain_for_missing(
        &self,
        missing_types: &[String],
        available_types: &[String],
    ) -> AppResult<Vec<String>> {
        let mut per_type: Vec<Vec<Vec<String>>> = Vec::new();

        for missing in missing_types {
            if available_types.iter().any(|a| a == missing) {
                continue;
            }
            let mut candidates: Vec<Vec<String>> = available_types
                .iter()
                .filter(|a| *a != missing)
                .flat_map(|a| self.find_path(a, missing))
                .collect();
            if candidates.is_empty() {
                return Err(AppError::Workflow(format!(
                    "No tool chain to produce {}",
                    missing
                )));
            }
            let min = candidates.iter().map(|p| p.len()).min().unwrap_or(0);
            candidates.retain(|p| p.len() == min);
            per_type.push(candidates);
        }

        if per_type.is_empty() {
            return Ok(Vec::new());
        }

        // Cartesian product of per-type shortest paths
        let mut combos: Vec<Vec<String>> = vec![Vec::new()];
        for options in &per_type {
            let mut next = Vec::with_capacity(combos.len() * options.len());
            for base in &combos {
                for path in options {
                    let mut combined = base.clone();
                    combined.extend(path.iter().cloned());
                    next.push(combined);
                }
            }
            combos = next;
        }

        let mut deduped: Vec<Vec<String>> = combos.iter().map(|c| dedup_chain(c)).collect();
        let best = deduped.iter().map(|c| c.len()).min().unwrap_or(0);
        deduped.retain(|c| c.len() == best);

        deduped
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| AppError::Workflow("empty converter chain".to_string()))
    }
}

fn dedup_chain(chain: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    chain
        .iter()
        .filter(|t| seen.insert((*t).clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(name: &str, input_type: &str, output_types: &[&str]) -> ToolDocument {
        serde_json::from_value(json!({
            "category": "conversion",
            "tool_name": name,
            "description": "converter",
            "required_parameters": [
                {"name": "input", "type": "text", "detailed_type": input_type, "description": ""}
            ],
            "return_values": output_types.iter().map(|t| json!(
                {"name": format!("out_{}", t.to_lowercase()), "type": "text",
                 "detailed_type": t, "description": ""}
            )).collect::<Vec<_>>()
        }))
        .unwrap()
    }

    fn multi_input_doc(name: &str) -> ToolDocument {
        serde_json::from_value(json!({
            "category": "conversion",
            "tool_name": name,
            "description": "needs two inputs",
            "required_parameters": [
                {"name": "a", "type": "text", "detailed_type": "GENE_ID", "description": ""},
                {"name": "b", "type": "text", "detailed_type": "UNIPROT_ID", "description": ""}
            ],
            "return_values": [
                {"name": "out", "type": "text", "detailed_type": "PROTEIN_SEQUENCE", "description": ""}
            ]
        }))
        .unwrap()
    }

    fn fixture() -> TransferMatrix {
        let docs = vec![
            doc("uniprot_fetch", "UNIPROT_ID", &["PROTEIN_SEQUENCE", "GENE_NAME"]),
            doc("gene_to_uniprot", "GENE_ID", &["UNIPROT_ID"]),
            doc("esmfold", "PROTEIN_SEQUENCE", &["STRUCTURE_FILE", "PLDDT_SCORE"]),
            multi_input_doc("blast_pair"),
        ];
        TransferMatrix::build(docs.iter())
    }

    #[test]
    fn test_multi_input_tools_excluded() {
        let matrix = fixture();
        // blast_pair would be a GENE_ID -> PROTEIN_SEQUENCE shortcut, but
        // it has two required inputs and must not participate
        let paths = matrix.find_path("GENE_ID", "PROTEIN_SEQUENCE");
        assert!(paths
            .iter()
            .all(|p| !p.contains(&"blast_pair".to_string())));
    }

    #[test]
    fn test_direct_edge() {
        let matrix = fixture();
        let paths = matrix.find_path("UNIPROT_ID", "PROTEIN_SEQUENCE");
        assert_eq!(paths, vec![vec!["uniprot_fetch".to_string()]]);
    }

    #[test]
    fn test_two_hop_path() {
        let matrix = fixture();
        let paths = matrix.find_path("GENE_ID", "STRUCTURE_FILE");
        assert_eq!(
            paths,
            vec![vec![
                "gene_to_uniprot".to_string(),
                "uniprot_fetch".to_string(),
                "esmfold".to_string(),
            ]]
        );
    }

    #[test]
    fn test_only_minimum_length_paths_returned() {
        // Both a direct edge and a longer alternative exist
        let docs = vec![
            doc("direct", "A", &["C"]),
            doc("a_to_b", "A", &["B"]),
            doc("b_to_c", "B", &["C"]),
        ];
        let matrix = TransferMatrix::build(docs.iter());
        let paths = matrix.find_path("A", "C");
        assert_eq!(paths, vec![vec!["direct".to_string()]]);
    }

    #[test]
    fn test_unreachable_is_empty() {
        let matrix = fixture();
        assert!(matrix.find_path("STRUCTURE_FILE", "UNIPROT_ID").is_empty());
        assert!(matrix.find_path("UNKNOWN", "PROTEIN_SEQUENCE").is_empty());
    }

    #[test]
    fn test_same_type_forbidden() {
        let matrix = fixture();
        assert!(matrix.find_path("UNIPROT_ID", "UNIPROT_ID").is_empty());
    }

    #[test]
    fn test_chain_for_missing_single() {
        let matrix = fixture();
        let chain = matrix
            .chain_for_missing(
                &["PROTEIN_SEQUENCE".to_string()],
                &["UNIPROT_ID".to_string()],
            )
            .unwrap();
        assert_eq!(chain, vec!["uniprot_fetch".to_string()]);
    }

    #[test]
    fn test_chain_prefers_fewer_distinct_tools() {
        // One tool covers both missing types; a two-tool combination also
        // exists. The deduplicated single-tool chain must win.
        let docs = vec![
            doc("both", "X", &["P", "Q"]),
            doc("only_p", "X", &["P"]),
            doc("only_q", "X", &["Q"]),
        ];
        let matrix = TransferMatrix::build(docs.iter());
        let chain = matrix
            .chain_for_missing(&["P".to_string(), "Q".to_string()], &["X".to_string()])
            .unwrap();
        assert_eq!(chain, vec!["both".to_string()]);
    }

    #[test]
    fn test_already_available_type_skipped() {
        let matrix = fixture();
        let chain = matrix
            .chain_for_missing(
                &["UNIPROT_ID".to_string()],
                &["UNIPROT_ID".to_string(), "GENE_ID".to_string()],
            )
            .unwrap();
        assert!(chain.is_empty());
    }

    #[test]
    fn test_unproducible_type_is_an_error() {
        let matrix = fixture();
        let err = matrix
            .chain_for_missing(&["ANTIBODY_FILE".to_string()], &["UNIPROT_ID".to_string()])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Workflow error: No tool chain to produce ANTIBODY_FILE"
        );
    }
}
