use thiserror::Error;

/// Errors raised by the document store.
///
/// Structural errors abort the whole transaction they were raised in; the
/// document is left exactly as it was before the call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DocError {
    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("unknown page: {0}")]
    UnknownPage(String),

    #[error("unknown parent page: {0}")]
    UnknownParent(String),

    #[error("unknown block: {0}")]
    UnknownBlock(String),

    #[error("unknown component: {0}")]
    UnknownComponent(String),

    #[error("order {order} already used under parent {parent:?}")]
    OrderConflict { parent: Option<String>, order: f64 },

    #[error("moving page {0} would create a cycle")]
    Cycle(String),

    #[error("page {0} still has child pages")]
    HasChildren(String),

    #[error("text range {index}+{delete} is invalid for component {id}")]
    TextRange { id: String, index: u32, delete: u32 },

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("malformed document structure: {0}")]
    Malformed(String),
}

pub type DocResult<T> = Result<T, DocError>;
