//! Fatal engine errors.
//!
//! Everything in here is a structural contract violation: the current
//! operation chain is aborted and the error is surfaced to the driver.
//! Business-level outcomes (a process ending, a task waiting) are never
//! expressed as errors.

use crate::tree::ExecutionId;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{operation}: execution {execution} has no {field}")]
    MissingField {
        execution: ExecutionId,
        field: &'static str,
        operation: &'static str,
    },

    #[error("unknown execution {0}")]
    UnknownExecution(ExecutionId),

    #[error("unknown activity `{activity}` in process definition `{definition}`")]
    UnknownActivity { definition: String, activity: String },

    #[error("process definition `{0}` is not deployed")]
    UnknownDefinition(String),

    #[error("unknown atomic operation `{0}`")]
    UnknownOperation(String),

    #[error("{operation}: no transition set on execution {execution}")]
    NoTransition {
        execution: ExecutionId,
        operation: &'static str,
    },

    #[error("{context}: `{activity}` is not a scope")]
    NotAScope {
        activity: String,
        context: &'static str,
    },

    #[error("execution {execution} at `{activity}` is not waiting for a signal")]
    NotWaiting {
        execution: ExecutionId,
        activity: String,
    },

    #[error("no outgoing transition of `{activity}` can be taken")]
    NoOutgoingTransition { activity: String },

    #[error("cannot map `{activity}` to a scope execution: {reason}")]
    MappingFailed { activity: String, reason: String },

    #[error("tree invariant violated: {0}")]
    InvariantViolated(String),

    #[error("invalid process definition `{key}`:\n{messages}")]
    InvalidDefinition { key: String, messages: String },

    #[error("operation chain exceeded {0} steps")]
    RunawayChain(usize),

    #[error("hook failed at `{activity}` during `{signal}`: {source}")]
    Hook {
        activity: String,
        signal: String,
        #[source]
        source: anyhow::Error,
    },
}

impl EngineError {
    pub fn missing(execution: ExecutionId, field: &'static str, operation: &'static str) -> Self {
        EngineError::MissingField {
            execution,
            field,
            operation,
        }
    }

    /// Wrap a hook failure. Engine errors raised from a re-entrant call are
    /// passed through untouched; anything else gets the activity and signal
    /// attached.
    pub fn from_hook(err: anyhow::Error, activity: &str, signal: &str) -> Self {
        match err.downcast::<EngineError>() {
            Ok(engine) => engine,
            Err(source) => EngineError::Hook {
                activity: activity.to_string(),
                signal: signal.to_string(),
                source,
            },
        }
    }
}
