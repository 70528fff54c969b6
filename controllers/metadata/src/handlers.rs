//! Endpoints event handlers.
//!
//! Every notification from the change feed is reduced to at most one
//! reconciliation key (`namespace/name`) which is pushed onto the work
//! queue. The key functions are pure; [`EventHandler`] only adds the enqueue.

use crate::error::ControllerError;
use crate::queue::WorkQueue;
use k8s_openapi::api::core::v1::Endpoints;
use std::sync::Arc;
use tracing::{debug, trace};

/// Payload of an endpoints delete notification.
#[derive(Debug, Clone)]
pub enum DeletedEndpoints {
    /// The final state of the deleted object
    Final(Endpoints),
    /// The object disappeared while the watch was not looking; only its key
    /// and possibly its last observed state are known
    Tombstone(Tombstone),
}

/// Placeholder for an object deleted without a final state.
#[derive(Debug, Clone, Default)]
pub struct Tombstone {
    /// Key the object was stored under
    pub key: String,
    /// Last state observed before the object vanished
    pub last_known: Option<Endpoints>,
}

/// Key of a namespaced object: `namespace/name`, or `name` without namespace.
///
/// Returns `None` for objects without a name.
#[must_use]
pub fn meta_namespace_key(namespace: Option<&str>, name: Option<&str>) -> Option<String> {
    let name = name.filter(|n| !n.is_empty())?;
    match namespace.filter(|ns| !ns.is_empty()) {
        Some(namespace) => Some(format!("{namespace}/{name}")),
        None => Some(name.to_string()),
    }
}

/// Split a key produced by [`meta_namespace_key`] into `(namespace, name)`.
///
/// The namespace is empty for cluster-scoped keys.
pub fn split_meta_namespace_key(key: &str) -> Result<(String, String), ControllerError> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((String::new(), (*name).to_string())),
        [namespace, name] if !name.is_empty() => Ok(((*namespace).to_string(), (*name).to_string())),
        _ => Err(ControllerError::InvalidKey(format!("unexpected key format: {key:?}"))),
    }
}

/// Reconciliation key of an endpoints object
#[must_use]
pub fn endpoints_key(endpoints: &Endpoints) -> Option<String> {
    meta_namespace_key(
        endpoints.metadata.namespace.as_deref(),
        endpoints.metadata.name.as_deref(),
    )
}

/// Key to enqueue for an added object
#[must_use]
pub fn key_on_add(endpoints: &Endpoints) -> Option<String> {
    endpoints_key(endpoints)
}

/// Key to enqueue for an updated object; only the new state matters.
#[must_use]
pub fn key_on_update(_old: &Endpoints, new: &Endpoints) -> Option<String> {
    endpoints_key(new)
}

/// Key to enqueue for a deleted object.
///
/// Tombstones are resolved by their stored key first and the last known
/// object second.
#[must_use]
pub fn key_on_delete(deleted: &DeletedEndpoints) -> Option<String> {
    match deleted {
        DeletedEndpoints::Final(endpoints) => endpoints_key(endpoints),
        DeletedEndpoints::Tombstone(tombstone) => {
            if split_meta_namespace_key(&tombstone.key).is_ok() {
                return Some(tombstone.key.clone());
            }
            tombstone.last_known.as_ref().and_then(endpoints_key)
        }
    }
}

/// Turns change feed notifications into work queue keys.
#[derive(Debug, Clone)]
pub struct EventHandler {
    queue: Arc<WorkQueue>,
}

impl EventHandler {
    /// Create a handler feeding `queue`
    #[must_use]
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }

    /// Handle an added endpoints object
    pub fn on_add(&self, endpoints: &Endpoints) {
        match key_on_add(endpoints) {
            Some(key) => {
                trace!("Adding endpoints {}", key);
                self.queue.enqueue(&key);
            }
            None => debug!("Couldn't get key for added endpoints {:?}", endpoints.metadata),
        }
    }

    /// Handle an updated endpoints object
    pub fn on_update(&self, old: &Endpoints, new: &Endpoints) {
        match key_on_update(old, new) {
            Some(key) => {
                trace!("Updating endpoints {}", key);
                self.queue.enqueue(&key);
            }
            None => debug!("Couldn't get key for updated endpoints {:?}", new.metadata),
        }
    }

    /// Handle a deleted endpoints object or tombstone
    pub fn on_delete(&self, deleted: &DeletedEndpoints) {
        match key_on_delete(deleted) {
            Some(key) => {
                trace!("Deleting endpoints {}", key);
                self.queue.enqueue(&key);
            }
            None => debug!("Couldn't get object key from deleted endpoints {:?}", deleted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::test_utils::create_test_endpoints;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_meta_namespace_key() {
        assert_eq!(meta_namespace_key(Some("default"), Some("svc1")).as_deref(), Some("default/svc1"));
        assert_eq!(meta_namespace_key(None, Some("node1")).as_deref(), Some("node1"));
        assert_eq!(meta_namespace_key(Some(""), Some("node1")).as_deref(), Some("node1"));
        assert_eq!(meta_namespace_key(Some("default"), None), None);
        assert_eq!(meta_namespace_key(Some("default"), Some("")), None);
    }

    #[test]
    fn test_split_meta_namespace_key() {
        assert_eq!(
            split_meta_namespace_key("default/svc1").unwrap(),
            ("default".to_string(), "svc1".to_string())
        );
        assert_eq!(
            split_meta_namespace_key("svc1").unwrap(),
            (String::new(), "svc1".to_string())
        );
        assert!(split_meta_namespace_key("a/b/c").is_err());
        assert!(split_meta_namespace_key("default/").is_err());
        assert!(split_meta_namespace_key("").is_err());
    }

    #[test]
    fn test_add_and_update_use_object_key() {
        let old = create_test_endpoints("default", "svc1", &[]);
        let new = create_test_endpoints("default", "svc1", &[("node1", "default", "pod1")]);

        assert_eq!(key_on_add(&new).as_deref(), Some("default/svc1"));
        assert_eq!(key_on_update(&old, &new).as_deref(), Some("default/svc1"));
    }

    #[test]
    fn test_delete_final_object() {
        let endpoints = create_test_endpoints("default", "svc1", &[]);
        assert_eq!(
            key_on_delete(&DeletedEndpoints::Final(endpoints)).as_deref(),
            Some("default/svc1")
        );
    }

    #[test]
    fn test_delete_tombstone_uses_stored_key() {
        let tombstone = Tombstone {
            key: "default/svc1".to_string(),
            last_known: None,
        };
        assert_eq!(
            key_on_delete(&DeletedEndpoints::Tombstone(tombstone)).as_deref(),
            Some("default/svc1")
        );
    }

    #[test]
    fn test_delete_tombstone_falls_back_to_last_known() {
        let tombstone = Tombstone {
            key: String::new(),
            last_known: Some(create_test_endpoints("default", "svc1", &[])),
        };
        assert_eq!(
            key_on_delete(&DeletedEndpoints::Tombstone(tombstone)).as_deref(),
            Some("default/svc1")
        );
    }

    #[test]
    fn test_delete_tombstone_without_identity_is_dropped() {
        let tombstone = Tombstone {
            key: "not/a/key".to_string(),
            last_known: Some(Endpoints {
                metadata: ObjectMeta::default(),
                ..Default::default()
            }),
        };
        assert_eq!(key_on_delete(&DeletedEndpoints::Tombstone(tombstone)), None);
    }

    #[tokio::test]
    async fn test_handler_enqueues_and_coalesces() {
        let queue = Arc::new(WorkQueue::new(ExponentialBackoff::default()));
        let handler = EventHandler::new(Arc::clone(&queue));
        let endpoints = create_test_endpoints("default", "svc1", &[]);

        handler.on_add(&endpoints);
        handler.on_update(&endpoints, &endpoints);
        handler.on_delete(&DeletedEndpoints::Final(endpoints));
        handler.on_add(&Endpoints::default());

        assert_eq!(queue.len(), 1, "Notifications for one object should coalesce");
        assert_eq!(queue.dequeue().await.as_deref(), Some("default/svc1"));
    }
}
