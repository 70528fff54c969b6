//! Test utilities for unit testing the controller
//!
//! This module provides helpers for creating test data and setting up test scenarios.

#[cfg(test)]
use crate::error::ControllerError;
#[cfg(test)]
use crate::listers::{EndpointsLister, NodeLister};
#[cfg(test)]
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints, Node, ObjectReference};
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
#[cfg(test)]
use std::sync::{Arc, Mutex};

/// Helper to create an endpoint address targeting a pod on a node
#[cfg(test)]
pub fn create_test_address(node_name: Option<&str>, pod_namespace: &str, pod_name: &str) -> EndpointAddress {
    EndpointAddress {
        ip: "10.0.0.1".to_string(),
        node_name: node_name.map(str::to_string),
        target_ref: Some(ObjectReference {
            kind: Some("Pod".to_string()),
            namespace: Some(pod_namespace.to_string()),
            name: Some(pod_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Helper to create an Endpoints object with one subset
///
/// Each address is `(node, pod namespace, pod name)`.
#[cfg(test)]
pub fn create_test_endpoints(namespace: &str, name: &str, addresses: &[(&str, &str, &str)]) -> Endpoints {
    create_test_endpoints_with(
        namespace,
        name,
        addresses
            .iter()
            .map(|(node, pod_ns, pod)| create_test_address(Some(node), pod_ns, pod))
            .collect(),
    )
}

/// Helper to create an Endpoints object from prepared addresses
#[cfg(test)]
pub fn create_test_endpoints_with(namespace: &str, name: &str, addresses: Vec<EndpointAddress>) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(addresses),
            ..Default::default()
        }]),
    }
}

/// Helper to create a Node
#[cfg(test)]
pub fn create_test_node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// In-memory endpoints lister
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct MockEndpointsLister {
    objects: Arc<Mutex<HashMap<(String, String), Arc<Endpoints>>>>,
}

#[cfg(test)]
impl MockEndpointsLister {
    /// Store or replace an object
    pub fn insert(&self, endpoints: Endpoints) {
        let key = (
            endpoints.metadata.namespace.clone().unwrap_or_default(),
            endpoints.metadata.name.clone().unwrap_or_default(),
        );
        self.objects.lock().unwrap().insert(key, Arc::new(endpoints));
    }

    /// Remove an object
    pub fn remove(&self, namespace: &str, name: &str) {
        self.objects
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

#[cfg(test)]
impl EndpointsLister for MockEndpointsLister {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Endpoints>>, ControllerError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

/// Endpoints lister whose every lookup fails, counting attempts
#[cfg(test)]
#[derive(Debug, Default)]
pub struct FailingEndpointsLister {
    pub calls: AtomicUsize,
}

#[cfg(test)]
impl EndpointsLister for FailingEndpointsLister {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Endpoints>>, ControllerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ControllerError::Lister(format!("store unavailable for {namespace}/{name}")))
    }
}

/// Fixed node list
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct MockNodeLister {
    pub nodes: Vec<String>,
}

#[cfg(test)]
impl MockNodeLister {
    pub fn new(nodes: &[&str]) -> Self {
        Self {
            nodes: nodes.iter().map(|n| (*n).to_string()).collect(),
        }
    }
}

#[cfg(test)]
impl NodeLister for MockNodeLister {
    fn list_node_names(&self) -> Result<Vec<String>, ControllerError> {
        Ok(self.nodes.clone())
    }
}

/// Node lister that always fails
#[cfg(test)]
#[derive(Debug, Default)]
pub struct FailingNodeLister;

#[cfg(test)]
impl NodeLister for FailingNodeLister {
    fn list_node_names(&self) -> Result<Vec<String>, ControllerError> {
        Err(ControllerError::Lister("node store unavailable".to_string()))
    }
}
