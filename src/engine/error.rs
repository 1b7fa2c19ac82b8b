use ulid::Ulid;

use crate::model::{Ms, Span};

#[derive(Debug)]
pub enum EngineError {
    /// Start not strictly before end.
    InvalidInterval { start: Ms, end: Ms },
    /// Same resource, same event, identical span already allocated.
    DuplicateAllocation(Ulid),
    /// Overlaps an existing allocation on the same resource.
    Conflict(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A custom allocation span must sit inside its event's span.
    OutsideEvent { allocation: Span, event: Span },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval [{start}, {end}): start must be before end")
            }
            EngineError::DuplicateAllocation(id) => {
                write!(f, "duplicate of allocation: {id}")
            }
            EngineError::Conflict(id) => write!(f, "conflict with allocation: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::OutsideEvent { allocation, event } => write!(
                f,
                "allocation [{}, {}) outside event [{}, {})",
                allocation.start(),
                allocation.end(),
                event.start(),
                event.end()
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval { .. } => "invalid_interval",
            EngineError::DuplicateAllocation(_) => "duplicate",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::OutsideEvent { .. } => "outside_event",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal",
        }
    }
}
