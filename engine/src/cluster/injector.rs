//! Seed registry injector.
//!
//! Stands up a registry inside a cluster that cannot pull images yet. A
//! small helper binary and the seed layout (as chunked payload ConfigMaps)
//! are mounted into a pod built from an image some node already has, and
//! the helper serves the layout as a registry on port 5000.
//!
//! ```text
//! enumerate ─► payload ConfigMaps ─► binary ConfigMap + Service ─► trial loop
//!                                                                   │
//!                      for each (image, node): pod ─► poll /v2/ ────┤
//!                                                                   ▼
//!                                                     ready | Exhaustion
//! ```
//!
//! Trials run one at a time because the pod name and Service are singletons.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use skiff_core::config::InjectorConfig;
use skiff_core::descriptor::{
    DOCKER_MANIFEST_LIST_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE, OCI_INDEX_MEDIA_TYPE,
    OCI_MANIFEST_MEDIA_TYPE,
};
use skiff_core::error::{Result, SkiffError};

use crate::oci::ImageReference;
use crate::transfer::CancelToken;

use super::client::ClusterClient;
use super::objects::{
    ConfigMap, Container, HttpGetAction, ObjectMeta, Pod, PodSpec, Probe, ResourceRequirements,
    Service, Volume, VolumeMount,
};
use super::payload::{create_payload_archive, split_file};
use super::tunnel::Tunnel;

/// Label marking payload ConfigMaps, used for teardown by selector.
pub const PAYLOAD_LABEL_KEY: &str = "skiff-injector";
pub const PAYLOAD_LABEL_VALUE: &str = "payload";

/// Label telling the admission agent to leave a pod's images alone.
pub const AGENT_LABEL_KEY: &str = "skiff.dev/agent";
pub const AGENT_LABEL_VALUE: &str = "ignore";

const PAYLOAD_ARCHIVE: &str = "payload.tgz";
const NODE_HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// An image already resident on a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CandidateNodeImage {
    pub image_reference: String,
    pub node_name: String,
}

/// Inputs for one bootstrap attempt.
#[derive(Debug, Clone)]
pub struct InjectorRequest {
    /// OCI layout holding the seed images
    pub seed_dir: PathBuf,
    /// Images the seed registry must serve before it counts as ready
    pub seed_images: Vec<ImageReference>,
    /// Statically linked helper binary
    pub injector_binary: PathBuf,
    /// Scratch directory for the payload tarball
    pub work_dir: PathBuf,
}

/// A running seed registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectorReady {
    pub candidate: CandidateNodeImage,
    /// Node port of the injector Service
    pub node_port: u16,
    /// SHA-256 hex of the payload tarball
    pub payload_checksum: String,
    pub payload_chunks: usize,
}

impl InjectorReady {
    /// Address nodes use to pull from the seed registry.
    pub fn registry_address(&self) -> String {
        format!("127.0.0.1:{}", self.node_port)
    }
}

// ============================================================================
// Readiness
// ============================================================================

/// Checks whether the seed registry serves the seed images.
#[async_trait]
pub trait RegistryProbe: Send + Sync {
    async fn serves(&self, images: &[ImageReference]) -> Result<bool>;
}

/// Probes `GET /v2/<path>/manifests/<tag>` through a tunnel.
pub struct HttpRegistryProbe {
    tunnel: Arc<dyn Tunnel>,
    http: reqwest::Client,
}

impl HttpRegistryProbe {
    pub fn new(tunnel: Arc<dyn Tunnel>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SkiffError::Other(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { tunnel, http })
    }
}

#[async_trait]
impl RegistryProbe for HttpRegistryProbe {
    async fn serves(&self, images: &[ImageReference]) -> Result<bool> {
        let handle = self.tunnel.connect().await?;
        let base = handle.http_endpoint();
        let accept = [
            OCI_MANIFEST_MEDIA_TYPE,
            DOCKER_MANIFEST_MEDIA_TYPE,
            OCI_INDEX_MEDIA_TYPE,
            DOCKER_MANIFEST_LIST_MEDIA_TYPE,
        ]
        .join(", ");

        let mut ready = true;
        for image in images {
            let url = format!("{}/v2/{}/manifests/{}", base, image.path, manifest_tag(image));
            let status = match self
                .http
                .get(&url)
                .header(reqwest::header::ACCEPT, accept.as_str())
                .send()
                .await
            {
                Ok(response) => response.status(),
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "Seed registry not reachable");
                    ready = false;
                    break;
                }
            };
            if status != reqwest::StatusCode::OK {
                tracing::debug!(url = %url, status = %status, "Seed image not served yet");
                ready = false;
                break;
            }
        }

        handle.close().await;
        Ok(ready)
    }
}

fn manifest_tag(image: &ImageReference) -> &str {
    image
        .digest
        .as_deref()
        .or(image.tag.as_deref())
        .unwrap_or("latest")
}

// ============================================================================
// Injector
// ============================================================================

/// Drives one seed registry bootstrap.
pub struct Injector {
    client: Arc<dyn ClusterClient>,
    probe: Arc<dyn RegistryProbe>,
    config: InjectorConfig,
    cancel: CancelToken,
}

impl Injector {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        probe: Arc<dyn RegistryProbe>,
        config: InjectorConfig,
    ) -> Self {
        Self {
            client,
            probe,
            config,
            cancel: CancelToken::never(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &InjectorConfig {
        &self.config
    }

    /// Distinct `(image, node)` pairs from running pods, sorted.
    pub async fn enumerate_candidates(&self) -> Result<Vec<CandidateNodeImage>> {
        let pods = tokio::time::timeout(
            self.config.enumeration_timeout(),
            self.client.list_running_pods(),
        )
        .await
        .map_err(|_| {
            SkiffError::ClusterError(format!(
                "Timed out listing pods after {:?}",
                self.config.enumeration_timeout()
            ))
        })??;
        Ok(candidates_from_pods(&pods, &self.config.seed_exclusion_prefix))
    }

    /// Bootstrap the seed registry.
    ///
    /// Leaves the registry running on success; call [`Injector::stop`] once
    /// it has been replaced. Every other outcome tears down what was created.
    pub async fn start(&self, request: &InjectorRequest) -> Result<InjectorReady> {
        let candidates = self.enumerate_candidates().await?;
        if candidates.is_empty() {
            return Err(SkiffError::Exhaustion(
                "no running pod offers an image to host the seed registry".to_string(),
            ));
        }
        tracing::info!(candidates = candidates.len(), "Enumerated candidate node images");

        let prepared = match self.prepare(request).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.stop().await;
                return Err(e);
            }
        };

        match self.run_trials(&candidates, &prepared, request).await {
            Ok(ready) => Ok(ready),
            Err(e) => {
                self.stop().await;
                Err(e)
            }
        }
    }

    async fn prepare(&self, request: &InjectorRequest) -> Result<Prepared> {
        let ns = &self.config.namespace;

        tokio::fs::create_dir_all(&request.work_dir).await?;
        let archive = request.work_dir.join(PAYLOAD_ARCHIVE);
        create_payload_archive(&request.seed_dir, &archive).await?;
        let (chunks, checksum) = split_file(&archive, self.config.chunk_size).await?;
        tracing::info!(
            chunks = chunks.len(),
            checksum = %checksum,
            "Writing seed payload"
        );

        let mut payload = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.into_iter().enumerate() {
            if i > 0 {
                self.cancel.sleep(self.config.write_delay()).await?;
            }
            let name = chunk.name();
            let config_map = ConfigMap::new(
                ObjectMeta::named(&name, ns).with_label(PAYLOAD_LABEL_KEY, PAYLOAD_LABEL_VALUE),
            )
            .with_binary(&name, chunk.bytes);
            self.client.create_config_map(&config_map).await?;
            payload.push(name);
        }

        let binary = tokio::fs::read(&request.injector_binary).await.map_err(|e| {
            SkiffError::IoError(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to read injector binary {}: {}",
                    request.injector_binary.display(),
                    e
                ),
            ))
        })?;
        let _ = self
            .client
            .delete_config_map(ns, &self.config.binary_config_map)
            .await;
        let binary_map = ConfigMap::new(ObjectMeta::named(&self.config.binary_config_map, ns))
            .with_binary(&self.config.binary_name, binary);
        self.client.create_config_map(&binary_map).await?;

        let _ = self
            .client
            .delete_service(ns, &self.config.service_name)
            .await;
        let service = Service::node_port(
            ObjectMeta::named(&self.config.service_name, ns),
            &self.config.app_label,
            self.config.registry_port,
        );
        let node_port = self.client.create_service(&service).await?;
        tracing::info!(node_port, "Injector service created");

        Ok(Prepared {
            payload,
            checksum,
            node_port,
        })
    }

    async fn run_trials(
        &self,
        candidates: &[CandidateNodeImage],
        prepared: &Prepared,
        request: &InjectorRequest,
    ) -> Result<InjectorReady> {
        for candidate in candidates {
            self.cancel.check()?;
            match self.try_candidate(candidate, prepared, request).await {
                Ok(true) => {
                    tracing::info!(
                        image = %candidate.image_reference,
                        node = %candidate.node_name,
                        "Seed registry ready"
                    );
                    return Ok(InjectorReady {
                        candidate: candidate.clone(),
                        node_port: prepared.node_port,
                        payload_checksum: prepared.checksum.clone(),
                        payload_chunks: prepared.payload.len(),
                    });
                }
                Ok(false) => tracing::debug!(
                    image = %candidate.image_reference,
                    node = %candidate.node_name,
                    "Candidate never became ready"
                ),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => tracing::debug!(
                    image = %candidate.image_reference,
                    node = %candidate.node_name,
                    error = %e,
                    "Candidate failed"
                ),
            }
        }

        Err(SkiffError::Exhaustion(format!(
            "none of {} candidate node images could run the seed registry",
            candidates.len()
        )))
    }

    async fn try_candidate(
        &self,
        candidate: &CandidateNodeImage,
        prepared: &Prepared,
        request: &InjectorRequest,
    ) -> Result<bool> {
        self.remove_pod(&self.cancel).await?;
        let pod = self.build_pod(candidate, &prepared.payload, &prepared.checksum);
        self.client.create_pod(&pod).await?;

        let threshold = self.config.readiness_failure_threshold;
        for attempt in 1..=threshold {
            match self.probe.serves(&request.seed_images).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => tracing::debug!(attempt, error = %e, "Readiness probe failed"),
            }
            if attempt < threshold {
                self.cancel.sleep(self.config.readiness_interval()).await?;
            }
        }
        Ok(false)
    }

    /// Delete the injector pod and wait until the API server no longer
    /// reports it, so a pod with the same name can be created again.
    async fn remove_pod(&self, cancel: &CancelToken) -> Result<()> {
        let ns = &self.config.namespace;
        let name = &self.config.pod_name;
        self.client.delete_pod(ns, name).await?;

        let deadline = tokio::time::Instant::now() + self.config.pod_deletion_timeout();
        while self.client.pod_exists(ns, name).await? {
            if tokio::time::Instant::now() >= deadline {
                return Err(SkiffError::ClusterError(format!(
                    "pod {}/{} still terminating after {:?}",
                    ns,
                    name,
                    self.config.pod_deletion_timeout()
                )));
            }
            tracing::debug!(pod = %name, "Waiting for pod to terminate");
            cancel.sleep(self.config.pod_deletion_poll()).await?;
        }
        Ok(())
    }

    /// Pod that runs the helper binary inside `candidate`'s image.
    pub fn build_pod(&self, candidate: &CandidateNodeImage, payload: &[String], checksum: &str) -> Pod {
        let cfg = &self.config;
        let init_dir = format!("/{}", cfg.init_dir);
        let entrypoint = format!("{}/{}", init_dir, cfg.binary_name);

        let mut mounts = vec![
            VolumeMount {
                name: "init".to_string(),
                mount_path: entrypoint.clone(),
                sub_path: Some(cfg.binary_name.clone()),
                read_only: false,
            },
            VolumeMount {
                name: "seed".to_string(),
                mount_path: format!("/{}", cfg.seed_dir),
                sub_path: None,
                read_only: false,
            },
        ];
        let mut volumes = vec![
            Volume::config_map("init", &cfg.binary_config_map, Some(0o777)),
            Volume::empty_dir("seed"),
        ];
        for name in payload {
            mounts.push(VolumeMount {
                name: name.clone(),
                mount_path: format!("{}/{}", init_dir, name),
                sub_path: Some(name.clone()),
                read_only: true,
            });
            volumes.push(Volume::config_map(name, name, None));
        }

        let container = Container {
            name: cfg.pod_name.clone(),
            image: candidate.image_reference.clone(),
            image_pull_policy: Some("IfNotPresent".to_string()),
            working_dir: Some(init_dir),
            command: vec![entrypoint, checksum.to_string()],
            volume_mounts: mounts,
            readiness_probe: Some(Probe {
                http_get: Some(HttpGetAction {
                    path: "/v2/".to_string(),
                    port: cfg.registry_port,
                }),
                period_seconds: cfg.readiness_interval_secs as u32,
                success_threshold: 1,
                failure_threshold: cfg.readiness_failure_threshold,
            }),
            resources: Some(ResourceRequirements::cpu_memory(("0.5", "64Mi"), ("1", "256Mi"))),
        };

        let mut node_selector = BTreeMap::new();
        node_selector.insert(NODE_HOSTNAME_LABEL.to_string(), candidate.node_name.clone());

        Pod::new(
            ObjectMeta::named(&cfg.pod_name, &cfg.namespace)
                .with_label("app", &cfg.app_label)
                .with_label(AGENT_LABEL_KEY, AGENT_LABEL_VALUE),
            PodSpec {
                node_selector,
                restart_policy: Some("Never".to_string()),
                containers: vec![container],
                volumes,
                ..Default::default()
            },
        )
    }

    /// Remove the injector pod, payload ConfigMaps, binary ConfigMap and
    /// Service. Failures are logged, not returned.
    pub async fn stop(&self) {
        let ns = &self.config.namespace;
        tracing::info!(namespace = %ns, "Removing injector resources");

        // Teardown also runs after cancellation, so it waits on its own clock
        if let Err(e) = self.remove_pod(&CancelToken::never()).await {
            tracing::warn!(error = %e, "Failed to delete injector pod");
        }
        if let Err(e) = self
            .client
            .delete_config_maps_by_label(ns, PAYLOAD_LABEL_KEY, PAYLOAD_LABEL_VALUE)
            .await
        {
            tracing::warn!(error = %e, "Failed to delete payload configmaps");
        }
        if let Err(e) = self
            .client
            .delete_config_map(ns, &self.config.binary_config_map)
            .await
        {
            tracing::warn!(error = %e, "Failed to delete injector binary configmap");
        }
        if let Err(e) = self.client.delete_service(ns, &self.config.service_name).await {
            tracing::warn!(error = %e, "Failed to delete injector service");
        }
    }
}

struct Prepared {
    payload: Vec<String>,
    checksum: String,
    node_port: u16,
}

/// Distinct `(image, node)` pairs, skipping pods without a node and images
/// under `exclusion_prefix`.
pub fn candidates_from_pods(pods: &[Pod], exclusion_prefix: &str) -> Vec<CandidateNodeImage> {
    let mut pairs = BTreeSet::new();
    for pod in pods {
        let Some(node) = pod.spec.node_name.as_deref() else {
            continue;
        };
        for image in pod.images() {
            if !exclusion_prefix.is_empty() && image.starts_with(exclusion_prefix) {
                continue;
            }
            pairs.insert(CandidateNodeImage {
                image_reference: image.to_string(),
                node_name: node.to_string(),
            });
        }
    }
    pairs.into_iter().collect()
}
