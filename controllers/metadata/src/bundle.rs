//! Per-node metadata bundles and their cache.
//!
//! Each node gets one [`MetadataMapperBundle`] stored in the shared
//! [`Cache`] under `<prefix>/<node>`. A bundle carries its own lock, so
//! writers and readers of different nodes never contend; the cache index is
//! only locked for the duration of a get or set.

use crate::mapper::ServicesMapper;
use agent_cache::{build_key, Cache, CacheError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

/// Cache key prefix of node bundles
pub const METADATA_MAPPER_CACHE_PREFIX: &str = "agent/KubernetesMetadataMapping";

/// Prefix of every service entry returned to metadata API callers
pub const SERVICE_TAG_PREFIX: &str = "kube_service:";

/// Cluster metadata cached for one node.
#[derive(Debug, Default)]
pub struct MetadataMapperBundle {
    services: Mutex<ServicesMapper>,
}

impl MetadataMapperBundle {
    /// Create an empty bundle
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the bundle's services mapper.
    ///
    /// A poisoned lock is recovered: every mapper mutation leaves the map
    /// structurally valid, at worst missing one update that the next resync
    /// restores.
    pub fn lock(&self) -> MutexGuard<'_, ServicesMapper> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Services backed by `pod_name` in `namespace`, sorted by name.
    #[must_use]
    pub fn services_for_pod(&self, namespace: &str, pod_name: &str) -> Option<Vec<String>> {
        self.lock().services_for_pod(namespace, pod_name)
    }
}

/// Typed view over the shared cache holding one bundle per node.
#[derive(Debug, Clone)]
pub struct BundleCache {
    cache: Arc<Cache>,
    ttl: Duration,
}

impl BundleCache {
    /// Wrap `cache`, writing bundles with the given TTL
    #[must_use]
    pub fn new(cache: Arc<Cache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// Cache key of the bundle for `node_name`
    #[must_use]
    pub fn cache_key(node_name: &str) -> String {
        build_key(METADATA_MAPPER_CACHE_PREFIX, node_name)
    }

    /// TTL applied on every write
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The underlying shared cache
    #[must_use]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Bundle of `node_name`, if one is cached.
    pub fn get(&self, node_name: &str) -> Result<Option<Arc<MetadataMapperBundle>>, CacheError> {
        self.cache.get_as::<MetadataMapperBundle>(&Self::cache_key(node_name))
    }

    /// Bundle of `node_name`, creating an empty one if none is cached.
    ///
    /// A value of the wrong shape under the node's key is discarded and
    /// replaced by a fresh bundle.
    pub fn get_or_create(&self, node_name: &str) -> Arc<MetadataMapperBundle> {
        let key = Self::cache_key(node_name);
        match self.cache.get_or_insert_with(&key, self.ttl, MetadataMapperBundle::new) {
            Ok(bundle) => bundle,
            Err(e) => {
                debug!("Replacing unusable cache entry for node {}: {}", node_name, e);
                let bundle = Arc::new(MetadataMapperBundle::new());
                self.set(node_name, Arc::clone(&bundle));
                bundle
            }
        }
    }

    /// Store `bundle` for `node_name`, refreshing its TTL.
    pub fn set(&self, node_name: &str, bundle: Arc<MetadataMapperBundle>) {
        self.cache.set(Self::cache_key(node_name), bundle, self.ttl);
    }

    /// Services known for a pod.
    ///
    /// `Ok(None)` means no data: the node has no bundle yet (startup, TTL
    /// expiry) or the pod is not in it. Only a corrupted cache entry is an
    /// error.
    pub fn lookup_services(
        &self,
        node_name: &str,
        namespace: &str,
        pod_name: &str,
    ) -> Result<Option<Vec<String>>, CacheError> {
        let Some(bundle) = self.get(node_name)? else {
            trace!("no metadata was found for the pod {} on node {}", pod_name, node_name);
            return Ok(None);
        };
        let services = bundle.services_for_pod(namespace, pod_name);
        if services.is_none() {
            trace!("no cached services list found for the pod {} on the node {}", pod_name, node_name);
        }
        Ok(services)
    }

    /// Metadata tags of a pod, one `kube_service:<name>` per service.
    pub fn pod_metadata_names(
        &self,
        node_name: &str,
        namespace: &str,
        pod_name: &str,
    ) -> Result<Option<Vec<String>>, CacheError> {
        let Some(services) = self.lookup_services(node_name, namespace, pod_name)? else {
            return Ok(None);
        };
        debug!(
            "CacheKey: {}, with {} services",
            Self::cache_key(node_name),
            services.len()
        );
        Ok(Some(
            services
                .into_iter()
                .map(|service| format!("{SERVICE_TAG_PREFIX}{service}"))
                .collect(),
        ))
    }
}
