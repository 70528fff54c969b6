//! Controller configuration.
//!
//! All settings come from environment variables. Missing variables fall back
//! to defaults; present but unparsable values are rejected with
//! [`ControllerError::InvalidConfig`] rather than silently ignored.

use crate::error::ControllerError;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Number of concurrent reconciliation workers
pub const DEFAULT_WORKERS: usize = 2;
/// Failed reconciliations of one key before the key is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 15;
/// Lifetime of a node bundle that is not refreshed
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(2 * 60);
/// Listen address of the metadata API
pub const DEFAULT_API_ADDR: &str = "0.0.0.0:5005";
/// Per-key retry delay after the first failure
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(5);
/// Upper bound of the per-key retry delay
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(1000);

/// Runtime configuration of the Metadata Controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Worker pool size (`METADATA_WORKERS`)
    pub workers: usize,
    /// Retry ceiling per key (`METADATA_MAX_RETRIES`)
    pub max_retries: u32,
    /// Bundle TTL (`METADATA_CACHE_TTL_SECS`)
    pub cache_ttl: Duration,
    /// Metadata API listen address (`METADATA_API_ADDR`)
    pub api_addr: SocketAddr,
    /// Namespace to watch endpoints in, all namespaces if unset (`WATCH_NAMESPACE`)
    pub namespace: Option<String>,
    /// Retry delay after the first failure (`METADATA_BACKOFF_BASE_MS`)
    pub backoff_base: Duration,
    /// Retry delay cap (`METADATA_BACKOFF_MAX_SECS`)
    pub backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            cache_ttl: DEFAULT_CACHE_TTL,
            api_addr: SocketAddr::from(([0, 0, 0, 0], 5005)),
            namespace: None,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let workers = parse_or(&lookup, "METADATA_WORKERS", DEFAULT_WORKERS)?;
        if workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "METADATA_WORKERS must be at least 1".to_string(),
            ));
        }

        let cache_ttl_secs = parse_or(&lookup, "METADATA_CACHE_TTL_SECS", DEFAULT_CACHE_TTL.as_secs())?;
        if cache_ttl_secs < 2 {
            return Err(ControllerError::InvalidConfig(
                "METADATA_CACHE_TTL_SECS must be at least 2".to_string(),
            ));
        }

        let backoff_base_ms = parse_or(
            &lookup,
            "METADATA_BACKOFF_BASE_MS",
            u64::try_from(DEFAULT_BACKOFF_BASE.as_millis()).unwrap_or(5),
        )?;
        let backoff_max_secs = parse_or(&lookup, "METADATA_BACKOFF_MAX_SECS", DEFAULT_BACKOFF_MAX.as_secs())?;
        let backoff_base = Duration::from_millis(backoff_base_ms);
        let backoff_max = Duration::from_secs(backoff_max_secs);
        if backoff_base.is_zero() || backoff_base > backoff_max {
            return Err(ControllerError::InvalidConfig(format!(
                "retry backoff base {backoff_base:?} must be non-zero and not exceed max {backoff_max:?}"
            )));
        }

        let api_addr = lookup("METADATA_API_ADDR").unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let api_addr = api_addr.parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("METADATA_API_ADDR {api_addr:?} is not a socket address: {e}"))
        })?;

        Ok(Self {
            workers,
            max_retries: parse_or(&lookup, "METADATA_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            cache_ttl: Duration::from_secs(cache_ttl_secs),
            api_addr,
            namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
            backoff_base,
            backoff_max,
        })
    }

    /// Interval at which every known endpoints object is redelivered.
    ///
    /// Half the cache TTL, so a bundle whose mapping did not change is
    /// rewritten before it expires.
    #[must_use]
    pub fn resync_period(&self) -> Duration {
        self.cache_ttl / 2
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{name} has invalid value {raw:?}: {e}"))
        }),
    }
}
