//! Cluster operations the injector depends on.

use async_trait::async_trait;
use skiff_core::error::Result;

use super::objects::{ConfigMap, Pod, Service};

/// The slice of the Kubernetes API used for bootstrapping.
///
/// Deletes of objects that do not exist succeed.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Pods in phase `Running` across all namespaces.
    async fn list_running_pods(&self) -> Result<Vec<Pod>>;

    /// Create a configmap, replacing an existing one with the same name.
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete every configmap in `namespace` carrying `key=value`.
    async fn delete_config_maps_by_label(&self, namespace: &str, key: &str, value: &str) -> Result<()>;

    /// Create a service and return the node port assigned to its first port.
    async fn create_service(&self, service: &Service) -> Result<u16>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_pod(&self, pod: &Pod) -> Result<()>;

    /// Request immediate deletion. The pod may linger while it terminates.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Whether a pod with this name still exists, terminating or not.
    async fn pod_exists(&self, namespace: &str, name: &str) -> Result<bool>;
}
