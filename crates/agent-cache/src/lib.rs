//! Agent Cache
//!
//! A process-wide, in-memory key/value store with absolute per-entry expiry.
//!
//! Values are stored type-erased so that unrelated features can share one
//! cache instance. Readers that expect a specific shape use [`Cache::get_as`],
//! which reports a value of the wrong type as [`CacheError::InvalidFormat`]
//! rather than silently treating it as absent.
//!
//! # Example
//!
//! ```
//! use agent_cache::{build_key, Cache};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let cache = Cache::new();
//! let key = build_key("KubernetesMetadataMapping", "node1");
//! cache.set(key.clone(), Arc::new(42_u32), Duration::from_secs(60));
//!
//! let value = cache.get_as::<u32>(&key).unwrap();
//! assert_eq!(value.as_deref(), Some(&42));
//! ```

pub mod cache;
pub mod error;
pub mod key;

pub use cache::{Cache, CacheValue};
pub use error::CacheError;
pub use key::{build_key, KEY_SEPARATOR};
