pub mod graph;
pub mod manager;
pub mod node;
pub mod transfer;

pub use graph::{GlobalIo, Workflow};
pub use manager::WorkflowManager;
pub use node::{step_id, step_index, NodeStatus, ParameterOrigin, ToolNode};
pub use transfer::TransferMatrix;
