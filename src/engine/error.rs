use ulid::Ulid;

use crate::model::{ActionKind, BookingStatus};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or out-of-policy input. Never retried.
    Validation(String),
    /// The slot was not available at commit time, or optimistic retries ran out.
    Conflict(Ulid),
    /// The action is not legal from the booking's current state.
    StateTransition {
        from: BookingStatus,
        action: ActionKind,
    },
    NotFound(Ulid),
    LimitExceeded(&'static str),
    /// The durable append failed; nothing was applied.
    Journal(String),
}

impl EngineError {
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::StateTransition { .. } => "state_transition",
            EngineError::NotFound(_) => "not_found",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Journal(_) => "journal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Conflict(id) => write!(f, "conflict: slot {id} is not available"),
            EngineError::StateTransition { from, action } => {
                write!(f, "illegal transition: cannot {} a {from} booking", action.as_str())
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Journal(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Journal(e.to_string())
    }
}
