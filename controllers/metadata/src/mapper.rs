//! Pod to service mapping.

use std::collections::{BTreeSet, HashMap};

/// Maps pod namespace → pod name → names of the services the pod backs.
///
/// A pod entry never holds an empty service set: removing the last service
/// removes the pod, and removing the last pod removes the namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicesMapper(HashMap<String, HashMap<String, BTreeSet<String>>>);

impl ServicesMapper {
    /// Create an empty mapper
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `pod_name` in `namespace` backs `service`.
    ///
    /// Merges with services already recorded for the pod.
    pub fn set(&mut self, namespace: &str, pod_name: &str, service: &str) {
        self.0
            .entry(namespace.to_string())
            .or_default()
            .entry(pod_name.to_string())
            .or_default()
            .insert(service.to_string());
    }

    /// Remove `service` from every pod in `namespace`, pruning pods left
    /// without services.
    pub fn delete(&mut self, namespace: &str, service: &str) {
        let Some(pods) = self.0.get_mut(namespace) else {
            return;
        };
        pods.retain(|_, services| {
            services.remove(service);
            !services.is_empty()
        });
        if pods.is_empty() {
            self.0.remove(namespace);
        }
    }

    /// Services backed by `pod_name` in `namespace`, sorted by name.
    #[must_use]
    pub fn services_for_pod(&self, namespace: &str, pod_name: &str) -> Option<Vec<String>> {
        self.0
            .get(namespace)?
            .get(pod_name)
            .map(|services| services.iter().cloned().collect())
    }

    /// Number of pods with at least one service
    #[must_use]
    pub fn pod_count(&self) -> usize {
        self.0.values().map(HashMap::len).sum()
    }

    /// Whether no pod is mapped
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
