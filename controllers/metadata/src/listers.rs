//! Read access to the change feed's local stores.
//!
//! The reconciler only sees these traits, so tests can substitute in-memory
//! or failing implementations for the reflector stores.

use crate::error::ControllerError;
use k8s_openapi::api::core::v1::{Endpoints, Node};
use kube_runtime::reflector::{ObjectRef, Store};
use std::sync::Arc;

/// Lookup of endpoints objects by namespace and name.
pub trait EndpointsLister: Send + Sync {
    /// Current state of the object, `Ok(None)` if it does not exist.
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Endpoints>>, ControllerError>;
}

/// Enumeration of cluster nodes.
pub trait NodeLister: Send + Sync {
    /// Names of every known node
    fn list_node_names(&self) -> Result<Vec<String>, ControllerError>;
}

impl EndpointsLister for Store<Endpoints> {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Endpoints>>, ControllerError> {
        let mut object_ref = ObjectRef::<Endpoints>::new(name);
        if !namespace.is_empty() {
            object_ref = object_ref.within(namespace);
        }
        Ok(Store::get(self, &object_ref))
    }
}

impl NodeLister for Store<Node> {
    fn list_node_names(&self) -> Result<Vec<String>, ControllerError> {
        Ok(self
            .state()
            .iter()
            .filter_map(|node| node.metadata.name.clone())
            .collect())
    }
}
