//! Tool documents
//!
//! A tool document is the single source of truth for what a tool is called,
//! what it consumes and what it produces. Documents are loaded once at
//! process start from JSON configuration files and are immutable afterwards.
//! The same text is rendered for prompt injection and for the retrieval
//! embedding index.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

/// Coarse value type of a parameter or return value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Text,
    Integer,
    Float,
    Boolean,
    Path,
    Selection,
    List,
    Dict,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Text => "text",
            ValueType::Integer => "integer",
            ValueType::Float => "float",
            ValueType::Boolean => "boolean",
            ValueType::Path => "path",
            ValueType::Selection => "selection",
            ValueType::List => "list",
            ValueType::Dict => "dict",
        }
    }
}

/// One declared parameter of a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    /// Domain tag, e.g. PROTEIN_SEQUENCE, STRUCTURE_FILE, UNIPROT_ID
    pub detailed_type: String,
    #[serde(default)]
    pub description: String,
    /// Valid values when `value_type` is `selection`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// One declared return value of a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub detailed_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDocument {
    pub category: String,
    pub tool_name: String,
    pub description: String,
    #[serde(default)]
    pub required_parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub optional_parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub return_values: Vec<ReturnSpec>,
}

impl ToolDocument {
    pub fn all_parameters(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.required_parameters
            .iter()
            .chain(self.optional_parameters.iter())
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.all_parameters().find(|p| p.name == name)
    }

    pub fn return_value(&self, name: &str) -> Option<&ReturnSpec> {
        self.return_values.iter().find(|r| r.name == name)
    }

    /// One-line summary for tool catalogs injected into prompts
    pub fn render_brief(&self) -> String {
        format!("{}/{}: {}", self.category, self.tool_name, self.description)
    }

    /// Full document rendering for prompt injection
    pub fn render_detailed(&self) -> String {
        let mut out = format!(
            "Tool: {}\nCategory: {}\nDescription: {}\n",
            self.tool_name, self.category, self.description
        );

        out.push_str("Required parameters:\n");
        if self.required_parameters.is_empty() {
            out.push_str("  (none)\n");
        }
        for p in &self.required_parameters {
            out.push_str(&render_parameter(p));
        }

        if !self.optional_parameters.is_empty() {
            out.push_str("Optional parameters:\n");
            for p in &self.optional_parameters {
                out.push_str(&render_parameter(p));
            }
        }

        out.push_str("Return values:\n");
        if self.return_values.is_empty() {
            out.push_str("  (none)\n");
        }
        for r in &self.return_values {
            out.push_str(&format!(
                "  - {} ({}, {}): {}\n",
                r.name,
                r.value_type.as_str(),
                r.detailed_type,
                r.description
            ));
        }
        out
    }

    /// Standardized text used to embed this document for semantic retrieval
    pub fn embedding_text(&self) -> String {
        format!("{}. {}. {}", self.category, self.tool_name, self.description)
    }

    /// Check every detailed type against the configured vocabulary.
    pub fn check_vocabulary(&self, vocabulary: &HashSet<String>) -> Result<(), String> {
        for tag in self
            .all_parameters()
            .map(|p| &p.detailed_type)
            .chain(self.return_values.iter().map(|r| &r.detailed_type))
        {
            if !vocabulary.contains(tag) {
                return Err(format!(
                    "tool '{}' uses unknown detailed type '{}'",
                    self.tool_name, tag
                ));
            }
        }
        Ok(())
    }

    /// Validate an argument map against this document.
    ///
    /// Returns human-readable errors for missing required parameters,
    /// surplus parameters, coarse type mismatches, missing `path` arguments
    /// (resolved against `output_root`) and out-of-set `selection` values.
    /// Pure with respect to an unchanged filesystem.
    pub fn validate_args(
        &self,
        args: &serde_json::Map<String, Value>,
        output_root: &Path,
    ) -> Vec<String> {
        let mut errors = Vec::new();

        for p in &self.required_parameters {
            if !args.contains_key(&p.name) {
                errors.push(format!("missing required parameter '{}'", p.name));
            }
        }

        for (name, value) in args {
            let Some(spec) = self.parameter(name) else {
                errors.push(format!("unexpected parameter '{}'", name));
                continue;
            };
            if let Some(err) = check_value(spec, value, output_root) {
                errors.push(err);
            }
        }

        errors
    }
}

fn render_parameter(p: &ParameterSpec) -> String {
    let mut line = format!(
        "  - {} ({}, {}): {}",
        p.name,
        p.value_type.as_str(),
        p.detailed_type,
        p.description
    );
    if !p.choices.is_empty() {
        line.push_str(&format!(" [choices: {}]", p.choices.join(", ")));
    }
    if let Some(default) = &p.default {
        line.push_str(&format!(" [default: {}]", default));
    }
    line.push('\n');
    line
}

fn check_value(spec: &ParameterSpec, value: &Value, output_root: &Path) -> Option<String> {
    match spec.value_type {
        ValueType::Text => {
            if !value.is_string() {
                return Some(type_error(spec, "a string", value));
            }
        }
        ValueType::Integer => {
            if !value.is_i64() && !value.is_u64() {
                return Some(type_error(spec, "an integer", value));
            }
        }
        ValueType::Float => {
            if !value.is_number() {
                return Some(type_error(spec, "a number", value));
            }
        }
        ValueType::Boolean => {
            if !value.is_boolean() {
                return Some(type_error(spec, "a boolean", value));
            }
        }
        ValueType::List => {
            if !value.is_array() {
                return Some(type_error(spec, "a list", value));
            }
        }
        ValueType::Dict => {
            if !value.is_object() {
                return Some(type_error(spec, "an object", value));
            }
        }
        ValueType::Selection => {
            let Some(s) = value.as_str() else {
                return Some(type_error(spec, "a string", value));
            };
            if !spec.choices.iter().any(|c| c == s) {
                return Some(format!(
                    "parameter '{}' must be one of [{}], got '{}'",
                    spec.name,
                    spec.choices.join(", "),
                    s
                ));
            }
        }
        ValueType::Path => {
            let Some(s) = value.as_str() else {
                return Some(type_error(spec, "a path string", value));
            };
            let path = Path::new(s);
            if path.is_absolute() {
                // Tools only ever see paths under their conversation root
                if !path.starts_with(output_root) {
                    return Some(format!(
                        "parameter '{}' points outside the output root: {}",
                        spec.name, s
                    ));
                }
                if !path.exists() {
                    return Some(format!("parameter '{}' path does not exist: {}", spec.name, s));
                }
            } else if !output_root.join(path).exists() {
                return Some(format!("parameter '{}' path does not exist: {}", spec.name, s));
            }
        }
    }
    None
}

fn type_error(spec: &ParameterSpec, expected: &str, got: &Value) -> String {
    format!(
        "parameter '{}' must be {}, got {}",
        spec.name, expected, got
    )
}
