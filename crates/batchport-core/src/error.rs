//! Error taxonomy shared by the execution path and its host.
//!
//! Everything except `Config` and `BatchFatal` is request-scoped: it is
//! delivered through the failing request's response and never aborts the
//! rest of the batch.

use crate::MemoryPlacement;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The model declares inputs or outputs the backend cannot serve.
    #[error("invalid model configuration: {0}")]
    Config(String),

    #[error("request '{request}' has no input named '{input}'")]
    InputNotFound { request: String, input: String },

    #[error("unsupported transfer from {from} to {to}")]
    UnsupportedTransfer {
        from: MemoryPlacement,
        to: MemoryPlacement,
    },

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("out of memory: failed to allocate {bytes} bytes (tried {tried})")]
    OutOfMemory { bytes: usize, tried: String },

    /// Not a single response could be opened for the batch.
    #[error("batch could not be attempted: {0}")]
    BatchFatal(String),

    #[error("request cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BackendError {
    pub fn is_request_scoped(&self) -> bool {
        !matches!(self, BackendError::Config(_) | BackendError::BatchFatal(_))
    }

    /// Short stable label, used as a structured logging field.
    pub fn code(&self) -> &'static str {
        match self {
            BackendError::Config(_) => "config",
            BackendError::InputNotFound { .. } => "input_not_found",
            BackendError::UnsupportedTransfer { .. } => "unsupported_transfer",
            BackendError::InvalidShape(_) => "invalid_shape",
            BackendError::OutOfMemory { .. } => "out_of_memory",
            BackendError::BatchFatal(_) => "batch_fatal",
            BackendError::Cancelled(_) => "cancelled",
            BackendError::Internal(_) => "internal",
        }
    }
}

pub type Result<T, E = BackendError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_config_and_batch_fatal_escape_the_request() {
        assert!(!BackendError::Config("x".into()).is_request_scoped());
        assert!(!BackendError::BatchFatal("x".into()).is_request_scoped());
        let scoped = [
            BackendError::InputNotFound {
                request: "r0".into(),
                input: "IN0".into(),
            },
            BackendError::UnsupportedTransfer {
                from: MemoryPlacement::device(0),
                to: MemoryPlacement::device(1),
            },
            BackendError::InvalidShape("x".into()),
            BackendError::OutOfMemory {
                bytes: 4,
                tried: "host".into(),
            },
            BackendError::Cancelled("x".into()),
            BackendError::Internal("x".into()),
        ];
        for err in scoped {
            assert!(err.is_request_scoped(), "{}", err.code());
        }
    }
}
