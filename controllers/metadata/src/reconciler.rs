//! Reconciliation logic for Endpoints.
//!
//! This module turns one endpoints object into per-node pod → service
//! entries in the bundle cache, and removes a deleted service from every
//! node's bundle.

use crate::bundle::BundleCache;
use crate::error::ControllerError;
use crate::handlers::split_meta_namespace_key;
use crate::listers::{EndpointsLister, NodeLister};
use k8s_openapi::api::core::v1::{EndpointAddress, Endpoints};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Kind of endpoint targets that carry node affinity
const POD_KIND: &str = "Pod";

/// Pods per namespace for every node referenced by one endpoints object
pub type NodePods = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

/// Reconciles endpoints objects into the bundle cache.
pub struct Reconciler {
    endpoints: Arc<dyn EndpointsLister>,
    nodes: Arc<dyn NodeLister>,
    bundles: BundleCache,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("bundles", &self.bundles)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(endpoints: Arc<dyn EndpointsLister>, nodes: Arc<dyn NodeLister>, bundles: BundleCache) -> Self {
        Self {
            endpoints,
            nodes,
            bundles,
        }
    }

    /// Reconciles the endpoints object identified by `key`.
    ///
    /// A missing object means it was deleted and triggers cleanup. Store
    /// errors and node listing errors are returned for retry.
    pub fn reconcile(&self, key: &str) -> Result<(), ControllerError> {
        let (namespace, name) = split_meta_namespace_key(key)?;

        match self.endpoints.get(&namespace, &name) {
            Ok(Some(endpoints)) => {
                self.map_service(&endpoints);
                Ok(())
            }
            Ok(None) => {
                // Absence in the store means the watch saw the deletion
                trace!("Endpoints has been deleted {}. Attempting to cleanup metadata map", key);
                self.cleanup_deleted_service(&namespace, &name)
            }
            Err(e) => {
                debug!("Unable to retrieve endpoints {} from store: {}", key, e);
                Err(e)
            }
        }
    }

    /// Merges the pods behind `endpoints` into the bundles of their nodes.
    pub fn map_service(&self, endpoints: &Endpoints) {
        let Some(service) = endpoints.metadata.name.as_deref() else {
            trace!("Skipping endpoints without a name");
            return;
        };

        for (node_name, namespaces) in node_to_pods(endpoints) {
            let bundle = self.bundles.get_or_create(&node_name);
            {
                let mut services = bundle.lock();
                for (namespace, pods) in &namespaces {
                    for pod_name in pods {
                        services.set(namespace, pod_name, service);
                    }
                }
                trace!("Bundle of node {} maps {} pods", node_name, services.pod_count());
            }
            self.bundles.set(&node_name, bundle);
        }
    }

    /// Removes `service` in `namespace` from the bundle of every node.
    ///
    /// Nodes without a bundle have nothing to clean and are skipped.
    pub fn cleanup_deleted_service(&self, namespace: &str, service: &str) -> Result<(), ControllerError> {
        let nodes = self.nodes.list_node_names()?;
        for node_name in nodes {
            let bundle = match self.bundles.get(&node_name) {
                Ok(Some(bundle)) => bundle,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Skipping cleanup of node {}: {}", node_name, e);
                    continue;
                }
            };

            {
                let mut services = bundle.lock();
                services.delete(namespace, service);
                if services.is_empty() {
                    trace!("Bundle of node {} no longer maps any pod", node_name);
                }
            }
            self.bundles.set(&node_name, bundle);
        }
        Ok(())
    }
}

/// Groups the valid addresses of `endpoints` by node and pod namespace.
///
/// Every pod is kept, so several pods of one namespace on one node all get
/// the service. Addresses without a node, without a pod target, with a
/// non-pod target or with an empty pod namespace or name are skipped.
#[must_use]
pub fn node_to_pods(endpoints: &Endpoints) -> NodePods {
    let mut node_pods = NodePods::new();

    let addresses = endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten());

    for address in addresses {
        let Some((node_name, namespace, pod_name)) = pod_address(address) else {
            continue;
        };
        node_pods
            .entry(node_name.to_string())
            .or_default()
            .entry(namespace.to_string())
            .or_default()
            .insert(pod_name.to_string());
    }

    node_pods
}

fn pod_address(address: &EndpointAddress) -> Option<(&str, &str, &str)> {
    let target = address.target_ref.as_ref()?;
    if target.kind.as_deref() != Some(POD_KIND) {
        return None;
    }
    let namespace = target.namespace.as_deref().filter(|ns| !ns.is_empty())?;
    let pod_name = target.name.as_deref().filter(|name| !name.is_empty())?;
    let node_name = address.node_name.as_deref().filter(|node| !node.is_empty())?;
    Some((node_name, namespace, pod_name))
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;
