use ulid::Ulid;

use crate::model::Span;
use crate::store::StoreError;

/// Failure taxonomy shared by the engine and the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Empty,
    InvalidOperation,
    Conflict,
    StorageFault,
    UpstreamFault,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Empty => "empty",
            ErrorKind::InvalidOperation => "invalid_operation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::StorageFault => "storage_fault",
            ErrorKind::UpstreamFault => "upstream_fault",
            ErrorKind::Timeout => "timeout",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Ulid },
    #[error("empty result: {0}")]
    Empty(&'static str),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("workspace {workspace_id} already booked by {booking_id} over [{}, {})", .span.start, .span.end)]
    BookingConflict {
        workspace_id: Ulid,
        booking_id: Ulid,
        span: Span,
    },
    #[error("workspace {workspace_id} is assigned and not offered over [{}, {})", .span.start, .span.end)]
    NotOffered { workspace_id: Ulid, span: Span },
    #[error("user {user_id} holds no assignment on workspace {workspace_id} covering the window")]
    NotAssigned { workspace_id: Ulid, user_id: Ulid },
    #[error("overlaps offering {0} by the same user")]
    OfferingOverlap(Ulid),
    #[error("storage fault: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::Empty(_) => ErrorKind::Empty,
            EngineError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            EngineError::BookingConflict { .. }
            | EngineError::NotOffered { .. }
            | EngineError::NotAssigned { .. }
            | EngineError::OfferingOverlap(_) => ErrorKind::Conflict,
            EngineError::Storage(_) => ErrorKind::StorageFault,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => EngineError::NotFound { entity, id },
            StoreError::Empty(what) => EngineError::Empty(what),
            StoreError::InvalidOperation(msg) => EngineError::InvalidOperation(msg),
            StoreError::Fault(msg) => EngineError::Storage(msg),
        }
    }
}
