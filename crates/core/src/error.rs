#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Classified failure of a fetch or write. Stored inside view state, so it is
/// plain data: cloneable and serializable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The call itself failed (network, 5xx). Retried only by an explicit refresh.
    #[error("transport: {0}")]
    Transport(String),
    /// Response did not match the expected page/stats/bulk contract.
    #[error("shape: {0}")]
    Shape(String),
    /// Rejected by business rules, ideally before any network call.
    #[error("validation: {0}")]
    Validation(String),
}

impl ErrorKind {
    pub fn transport(msg: impl Into<String>) -> Self { Self::Transport(msg.into()) }
    pub fn shape(msg: impl Into<String>) -> Self { Self::Shape(msg.into()) }
    pub fn validation(msg: impl Into<String>) -> Self { Self::Validation(msg.into()) }

    /// Transport failures are the only ones a plain retry can fix.
    pub fn is_retryable(&self) -> bool { matches!(self, Self::Transport(_)) }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Shape(_) => "shape",
            Self::Validation(_) => "validation",
        }
    }
}
