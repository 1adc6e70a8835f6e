//! Engine error types.

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// A remote session could not be established or validated.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A transfer failed mid-flight. Retryable failures can be resumed when
    /// a snapshot was parked for them.
    #[error("{message}")]
    Transport { message: String, retryable: bool },

    /// The operation is not valid for the transfer's current status.
    /// State errors have no side effects.
    #[error("invalid state: {0}")]
    State(String),

    /// No transfer with the given identifier.
    #[error("transfer not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn transport(message: impl Into<String>, retryable: bool) -> Self {
        Self::Transport {
            message: message.into(),
            retryable,
        }
    }

    /// `true` when retrying or resuming the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { retryable: true, .. })
    }
}
