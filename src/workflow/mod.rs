/// Workflow management layer
///
/// - Type definitions (Workflow, Node, ConnectionRule)
/// - Execution records and the persistence seam they flow through
/// - SQLite persistence with sqlx
/// - Lock-free registry of active workflows using ArcSwap

pub mod types;

pub mod execution;

pub mod storage;

pub mod registry;

pub use execution::{ExecutionRecord, ExecutionStatus, ExecutionStore, InMemoryExecutionStore, TriggerType};
pub use registry::WorkflowRegistry;
pub use storage::WorkflowStorage;
pub use types::{ConnectionGroup, ConnectionRule, Node, NodeType, Workflow};
