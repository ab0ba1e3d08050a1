/// Runtime execution engine
///
/// - Isolated Lua sandbox shared by expressions and script nodes
/// - Expression evaluation and template interpolation
/// - Node execution per node type
/// - Breadth-first graph runner producing execution traces
/// - Recurring trigger scheduler for timer nodes

pub mod sandbox;

pub mod expression;

pub mod template;

pub mod executor;

// Static petgraph analysis used for run diagnostics
pub mod graph;

pub mod engine;

pub mod recurrence;

pub mod scheduler;

pub use engine::{ExecutionEngine, ExecutionTrace, RunState};
pub use executor::{NodeExecutor, NodeResult, NodeStatus};
pub use expression::{EvalContext, ExpressionEvaluator};
pub use recurrence::Recurrence;
pub use scheduler::{RecurringScheduler, SchedulerStatus};
pub use template::TemplateInterpolator;
