/// Relayflow: workflow execution engine
///
/// Runs directed graphs of typed nodes, threading data between them through
/// sandboxed expressions, and fires timer-triggered workflows on a schedule.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by the runtime layers
pub mod error;

// Workflow documents, execution records, storage and registry
pub mod workflow;

// Sandbox, interpolation, node execution, graph runner and scheduler
pub mod runtime;

// Process wiring for the relayflow binary
pub mod daemon;

pub use error::{EvalError, NodeExecutionError, ScheduleError};
pub use runtime::{ExecutionEngine, ExecutionTrace, NodeResult, RecurringScheduler};
pub use workflow::{Node, NodeType, Workflow};
pub use daemon::run_daemon;
