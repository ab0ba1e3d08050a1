/// Error taxonomy for the execution engine
///
/// Each layer owns its error type. None of them is meant to escape a run:
/// evaluation errors are absorbed by the interpolator, node errors become
/// `NodeResult`s and schedule errors leave a workflow unscheduled.

use std::time::Duration;

/// Failure to evaluate a single expression or script inside the sandbox
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    /// Nothing left to evaluate after stripping `=` and whitespace
    #[error("empty expression")]
    Empty,

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    /// The sandbox ran past its deadline and was interrupted
    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),

    /// The sandbox itself could not be set up
    #[error("sandbox error: {0}")]
    Sandbox(String),
}

/// Node-type-specific failure, recorded on the node's result
#[derive(Debug, thiserror::Error)]
pub enum NodeExecutionError {
    #[error("{node_type} node is missing required parameter '{name}'")]
    MissingParameter { node_type: String, name: &'static str },

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// The request never produced a response (DNS, connect, TLS, timeout)
    #[error("HTTP request failed: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("script failed: {0}")]
    Script(#[from] EvalError),

    #[error("node execution timed out after {0:?}")]
    Timeout(Duration),

    /// The blocking task hosting the sandbox panicked or was cancelled
    #[error("sandbox task aborted: {0}")]
    Join(String),
}

/// Invalid or unsupported recurrence on a timer node
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScheduleError {
    #[error("timer node has neither 'cronExpression' nor 'secondsInterval'")]
    MissingSchedule,

    #[error("'secondsInterval' is not a positive number: {0}")]
    InvalidInterval(String),

    /// Sub-minute recurrence cannot be expressed as a cron schedule
    #[error("interval of {seconds}s is below the {minimum}s minimum")]
    BelowMinimumInterval { seconds: u64, minimum: u64 },

    /// Day steps past 31 do not fit the day-of-month field
    #[error("interval of {seconds}s exceeds the {maximum}s maximum")]
    IntervalTooLong { seconds: u64, maximum: u64 },

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// The job scheduler refused the job
    #[error("failed to register job: {0}")]
    Job(String),
}
