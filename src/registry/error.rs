//! Registry error types

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No room for another source
    #[error("source limit of {limit} reached")]
    SourceLimitReached { limit: usize },
}
