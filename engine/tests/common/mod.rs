//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use skiff_core::config::{InjectorConfig, TransferConfig};
use skiff_core::error::{Result, SkiffError};
use skiff_engine::cluster::objects::{ConfigMap, Container, ObjectMeta, Pod, PodSpec, PodStatus, Service};
use skiff_engine::cluster::{ClusterClient, RegistryProbe};
use skiff_engine::oci::{ImageReference, MemoryRegistry, OciLayout};
use skiff_engine::transfer::source::SourceResolver;
use skiff_engine::ImagePuller;

// ============================================================================
// Transfer fixtures
// ============================================================================

pub fn fast_transfer_config() -> TransferConfig {
    TransferConfig {
        retry_backoff_secs: 0,
        ..Default::default()
    }
}

pub fn puller(root: &Path, registry: Arc<MemoryRegistry>) -> ImagePuller {
    let config = fast_transfer_config();
    let layout = Arc::new(OciLayout::open(root).unwrap());
    let resolver = SourceResolver::new(registry, &config)
        .unwrap()
        .with_daemon(None);
    ImagePuller::new(layout, resolver, &config)
}

pub fn cached_puller(root: &Path, cache_root: &Path, registry: Arc<MemoryRegistry>) -> ImagePuller {
    let cache = Arc::new(OciLayout::open(cache_root).unwrap());
    puller(root, registry).with_layer_cache(cache)
}

pub fn reference(s: &str) -> ImageReference {
    ImageReference::parse(s).unwrap()
}

/// Every file under `root` with its contents, keyed by relative path.
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if entry.file_type().unwrap().is_dir() {
                walk(base, &path, out);
            } else {
                let relative = path.strip_prefix(base).unwrap().to_path_buf();
                out.insert(relative, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

// ============================================================================
// Cluster fixtures
// ============================================================================

#[derive(Default)]
struct ClusterState {
    running: Vec<Pod>,
    config_maps: BTreeMap<String, ConfigMap>,
    services: BTreeMap<String, Service>,
    pod: Option<Pod>,
    /// Deleted pod and the existence checks it still answers
    terminating: Option<(Pod, u32)>,
    linger_polls: u32,
    created_pods: Vec<Pod>,
    events: Vec<String>,
    failing_pod_images: BTreeSet<String>,
    fail_services: bool,
}

/// In-process stand-in for the Kubernetes API.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a running pod on `node` with the given container images.
    pub fn add_running_pod(&self, node: &str, images: &[&str]) {
        let containers = images
            .iter()
            .enumerate()
            .map(|(i, image)| Container {
                name: format!("c{}", i),
                image: image.to_string(),
                ..Default::default()
            })
            .collect();
        let mut pod = Pod::new(
            ObjectMeta::named(format!("workload-{}", node), "default"),
            PodSpec {
                node_name: Some(node.to_string()),
                containers,
                ..Default::default()
            },
        );
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
        });
        self.state.lock().running.push(pod);
    }

    /// Pod creation fails for `image`.
    pub fn reject_pods_with_image(&self, image: &str) {
        self.state.lock().failing_pod_images.insert(image.to_string());
    }

    /// Deleted pods keep answering existence checks `polls` times before
    /// they are gone, like a pod in `Terminating`.
    pub fn linger_deleted_pods(&self, polls: u32) {
        self.state.lock().linger_polls = polls;
    }

    /// Whether a deleted pod is still terminating.
    pub fn pod_terminating(&self) -> bool {
        self.state.lock().terminating.is_some()
    }

    pub fn fail_services(&self) {
        self.state.lock().fail_services = true;
    }

    pub fn config_map_names(&self) -> Vec<String> {
        self.state.lock().config_maps.keys().cloned().collect()
    }

    pub fn config_map(&self, name: &str) -> Option<ConfigMap> {
        self.state.lock().config_maps.get(name).cloned()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.state.lock().services.keys().cloned().collect()
    }

    /// The injector pod currently present.
    pub fn current_pod(&self) -> Option<Pod> {
        self.state.lock().pod.clone()
    }

    pub fn created_pods(&self) -> Vec<Pod> {
        self.state.lock().created_pods.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_running_pods(&self) -> Result<Vec<Pod>> {
        let mut state = self.state.lock();
        state.events.push("list pods".to_string());
        Ok(state.running.clone())
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let mut state = self.state.lock();
        state
            .events
            .push(format!("create configmap {}", config_map.metadata.name));
        state
            .config_maps
            .insert(config_map.metadata.name.clone(), config_map.clone());
        Ok(())
    }

    async fn delete_config_map(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(format!("delete configmap {}", name));
        state.config_maps.remove(name);
        Ok(())
    }

    async fn delete_config_maps_by_label(&self, _namespace: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(format!("delete configmaps {}={}", key, value));
        state
            .config_maps
            .retain(|_, cm| cm.metadata.labels.get(key).map(String::as_str) != Some(value));
        Ok(())
    }

    async fn create_service(&self, service: &Service) -> Result<u16> {
        let mut state = self.state.lock();
        if state.fail_services {
            return Err(SkiffError::ClusterError("service quota exceeded".to_string()));
        }
        state
            .events
            .push(format!("create service {}", service.metadata.name));
        state
            .services
            .insert(service.metadata.name.clone(), service.clone());
        Ok(31999)
    }

    async fn delete_service(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(format!("delete service {}", name));
        state.services.remove(name);
        Ok(())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        let mut state = self.state.lock();
        let name = &pod.metadata.name;
        let exists = state.pod.as_ref().map(|p| &p.metadata.name) == Some(name)
            || state.terminating.as_ref().map(|(p, _)| &p.metadata.name) == Some(name);
        if exists {
            state.events.push(format!("conflict pod {}", name));
            return Err(SkiffError::ClusterError(format!(
                "create pod {} returned 409 Conflict: already exists",
                name
            )));
        }

        let image = pod
            .spec
            .containers
            .first()
            .map(|c| c.image.clone())
            .unwrap_or_default();
        state.created_pods.push(pod.clone());
        if state.failing_pod_images.contains(&image) {
            return Err(SkiffError::ClusterError(format!("admission denied {}", image)));
        }
        state.events.push(format!("create pod {}", image));
        state.pod = Some(pod.clone());
        Ok(())
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(format!("delete pod {}", name));
        if let Some(pod) = state.pod.take() {
            if state.linger_polls > 0 {
                let polls = state.linger_polls;
                state.terminating = Some((pod, polls));
            }
        }
        Ok(())
    }

    async fn pod_exists(&self, _namespace: &str, name: &str) -> Result<bool> {
        let mut state = self.state.lock();
        state.events.push(format!("get pod {}", name));
        if state.pod.as_ref().is_some_and(|p| &p.metadata.name == name) {
            return Ok(true);
        }
        let lingering = match state.terminating.as_mut() {
            Some((pod, remaining)) if &pod.metadata.name == name => {
                if *remaining > 0 {
                    *remaining -= 1;
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if !lingering
            && state
                .terminating
                .as_ref()
                .is_some_and(|(pod, _)| &pod.metadata.name == name)
        {
            state.terminating = None;
        }
        Ok(lingering)
    }
}

/// Reports the seed registry ready when the current pod runs a working image.
pub struct FakeProbe {
    cluster: Arc<FakeCluster>,
    working_images: BTreeSet<String>,
}

impl FakeProbe {
    pub fn new(cluster: Arc<FakeCluster>, working_images: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            working_images: working_images.iter().map(|s| s.to_string()).collect(),
        })
    }
}

#[async_trait]
impl RegistryProbe for FakeProbe {
    async fn serves(&self, _images: &[ImageReference]) -> Result<bool> {
        Ok(self
            .cluster
            .current_pod()
            .and_then(|pod| pod.spec.containers.first().map(|c| c.image.clone()))
            .is_some_and(|image| self.working_images.contains(&image)))
    }
}

pub fn fast_injector_config() -> InjectorConfig {
    InjectorConfig {
        write_delay_ms: 0,
        readiness_interval_secs: 0,
        readiness_failure_threshold: 2,
        pod_deletion_poll_ms: 0,
        ..Default::default()
    }
}
