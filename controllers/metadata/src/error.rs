//! Controller-specific error types.
//!
//! This module defines error types specific to the Metadata Controller
//! that are not covered by upstream library errors.

use agent_cache::CacheError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the Metadata Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reconciliation key could not be split into namespace and name
    #[error("Invalid reconciliation key: {0}")]
    InvalidKey(String),

    /// Local store lookup failed for a reason other than not-found
    ///
    /// Reflector stores answer from memory and never fail; listers backed by
    /// a fallible source report through this variant.
    #[error("Lister error: {0}")]
    #[allow(dead_code)] // Not raised by the reflector-backed listers
    Lister(String),

    /// Cached value had an unexpected shape
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metadata API server failed
    #[error("API server error: {0}")]
    Api(String),
}
