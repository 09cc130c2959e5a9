use thiserror::Error;

/// Result alias for match store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failure of a match store backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend cannot serve requests right now; callers may retry.
    #[error("{backend} store unavailable: {reason}")]
    Unavailable {
        /// Short backend name, e.g. `memory`.
        backend: &'static str,
        /// What went wrong, as reported by the backend.
        reason: String,
    },
}

impl StorageError {
    /// Shorthand for [`StorageError::Unavailable`].
    pub fn unavailable(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            backend,
            reason: reason.into(),
        }
    }
}
