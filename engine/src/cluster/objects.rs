//! Minimal Kubernetes object model.
//!
//! Only the fields the injector reads or writes are modelled. Everything
//! serializes to the API server's camelCase JSON.

use std::collections::BTreeMap;

use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// ConfigMap
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMap {
    #[serde(default = "config_map_api_version")]
    pub api_version: String,
    #[serde(default = "config_map_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    /// Binary entries, base64-encoded on the wire
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", with = "base64_map")]
    pub binary_data: BTreeMap<String, Vec<u8>>,
}

fn config_map_api_version() -> String {
    "v1".to_string()
}

fn config_map_kind() -> String {
    "ConfigMap".to_string()
}

impl ConfigMap {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            api_version: config_map_api_version(),
            kind: config_map_kind(),
            metadata,
            binary_data: BTreeMap::new(),
        }
    }

    pub fn with_binary(mut self, key: impl Into<String>, data: Vec<u8>) -> Self {
        self.binary_data.insert(key.into(), data);
        self
    }

    /// Bytes stored across all binary entries.
    pub fn binary_size(&self) -> usize {
        self.binary_data.values().map(Vec::len).sum()
    }
}

mod base64_map {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&String, String> = map
            .iter()
            .map(|(k, v)| (k, base64::engine::general_purpose::STANDARD.encode(v)))
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(k, v)| {
                base64::engine::general_purpose::STANDARD
                    .decode(v)
                    .map(|bytes| (k, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

// ============================================================================
// Service
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[serde(default = "v1")]
    pub api_version: String,
    #[serde(default = "service_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ServiceSpec,
}

fn v1() -> String {
    "v1".to_string()
}

fn service_kind() -> String {
    "Service".to_string()
}

impl Service {
    /// A NodePort service selecting `app=<app>` on `port`.
    pub fn node_port(metadata: ObjectMeta, app: &str, port: u16) -> Self {
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), app.to_string());
        Self {
            api_version: v1(),
            kind: service_kind(),
            metadata,
            spec: ServiceSpec {
                type_: Some("NodePort".to_string()),
                selector,
                ports: vec![ServicePort {
                    port,
                    node_port: None,
                }],
            },
        }
    }

    /// Node port assigned to the first port, once the API server allocated one.
    pub fn assigned_node_port(&self) -> Option<u16> {
        self.spec.ports.first().and_then(|p| p.node_port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<u16>,
}

// ============================================================================
// Pod
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    #[serde(default = "v1")]
    pub api_version: String,
    #[serde(default = "pod_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PodStatus>,
}

fn pod_kind() -> String {
    "Pod".to_string()
}

impl Pod {
    pub fn new(metadata: ObjectMeta, spec: PodSpec) -> Self {
        Self {
            api_version: v1(),
            kind: pod_kind(),
            metadata,
            spec,
            status: None,
        }
    }

    pub fn phase(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.phase.as_deref())
    }

    /// Images of every container, init container, and ephemeral container.
    pub fn images(&self) -> impl Iterator<Item = &str> {
        self.spec
            .init_containers
            .iter()
            .chain(self.spec.containers.iter())
            .chain(self.spec.ephemeral_containers.iter())
            .map(|c| c.image.as_str())
            .filter(|image| !image.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ephemeral_containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
}

impl Volume {
    pub fn config_map(name: impl Into<String>, config_map: impl Into<String>, mode: Option<i32>) -> Self {
        Self {
            name: name.into(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.into(),
                default_mode: mode,
            }),
            empty_dir: None,
        }
    }

    pub fn empty_dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config_map: None,
            empty_dir: Some(EmptyDirVolumeSource {}),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapVolumeSource {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyDirVolumeSource {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_get: Option<HttpGetAction>,
    pub period_seconds: u32,
    pub success_threshold: u32,
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpGetAction {
    pub path: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

impl ResourceRequirements {
    pub fn cpu_memory(request: (&str, &str), limit: (&str, &str)) -> Self {
        let pair = |(cpu, memory): (&str, &str)| {
            let mut map = BTreeMap::new();
            map.insert("cpu".to_string(), cpu.to_string());
            map.insert("memory".to_string(), memory.to_string());
            map
        };
        Self {
            requests: pair(request),
            limits: pair(limit),
        }
    }
}

/// Generic `kind: List` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}
