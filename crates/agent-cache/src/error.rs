//! Agent cache errors

use thiserror::Error;

/// Errors that can occur when reading typed values from the cache
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The stored value does not have the type the caller asked for
    #[error("invalid cache format for the cacheKey: {key}")]
    InvalidFormat {
        /// Key whose value had an unexpected type
        key: String,
    },
}
