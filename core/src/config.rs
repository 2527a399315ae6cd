use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SkiffError};

/// Top-level Skiff configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkiffConfig {
    /// Image transfer settings
    pub transfer: TransferConfig,

    /// Target registry
    pub registry: RegistryInfo,

    /// In-cluster registry bootstrap settings
    pub injector: InjectorConfig,

    /// Credential store location (defaults to ~/.docker/config.json)
    pub credentials_path: Option<PathBuf>,
}

impl SkiffConfig {
    /// Load a configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SkiffError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: SkiffConfig = serde_yaml::from_str(&content).map_err(|e| {
            SkiffError::ConfigError(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.transfer.retry_attempts == 0 {
            return Err(SkiffError::ConfigError(
                "transfer.retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.transfer.architectures.is_empty() {
            return Err(SkiffError::ConfigError(
                "transfer.architectures must not be empty".to_string(),
            ));
        }
        for (source, target) in &self.transfer.registry_overrides {
            if source.is_empty() || target.is_empty() {
                return Err(SkiffError::ConfigError(format!(
                    "Invalid registry override '{}' -> '{}'",
                    source, target
                )));
            }
        }
        if self.injector.chunk_size == 0 {
            return Err(SkiffError::ConfigError(
                "injector.chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.injector.readiness_failure_threshold == 0 {
            return Err(SkiffError::ConfigError(
                "injector.readiness_failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.injector.namespace.is_empty() {
            return Err(SkiffError::ConfigError(
                "injector.namespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Credential store path, falling back to the Docker default
    pub fn credentials_path(&self) -> PathBuf {
        self.credentials_path
            .clone()
            .unwrap_or_else(default_docker_config)
    }
}

/// Image transfer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Skip TLS certificate verification
    pub insecure_skip_verify: bool,

    /// Talk plain HTTP to registries
    pub plain_http: bool,

    /// Acceptable architectures when resolving an index, in preference order
    pub architectures: Vec<String>,

    /// Registry host rewrites applied before resolving (source host -> target)
    pub registry_overrides: BTreeMap<String, String>,

    /// Attempts per layer and per pushed image
    pub retry_attempts: u32,

    /// Fixed delay between attempts, in seconds
    pub retry_backoff_secs: u64,

    /// Daemon images above this size trigger a slowness warning (bytes)
    pub large_image_threshold: u64,

    /// Local OCI layout consulted before contacting registries
    pub local_layout: Option<PathBuf>,

    /// Layout shared across pulls as a digest-keyed layer cache
    pub layer_cache: Option<PathBuf>,

    /// Temp blob files untouched for this long are treated as abandoned, in seconds
    pub stale_temp_age_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            insecure_skip_verify: false,
            plain_http: false,
            architectures: vec![crate::descriptor::host_architecture()],
            registry_overrides: BTreeMap::new(),
            retry_attempts: 3,
            retry_backoff_secs: 1,
            large_image_threshold: 750 * 1000 * 1000,
            local_layout: None,
            layer_cache: None,
            stale_temp_age_secs: 3600,
        }
    }
}

impl TransferConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn stale_temp_age(&self) -> Duration {
        Duration::from_secs(self.stale_temp_age_secs)
    }
}

/// Registry that images are pushed into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryInfo {
    /// Registry address (host[:port])
    pub address: String,

    /// Push username
    pub push_username: Option<String>,

    /// Push password
    pub push_password: Option<String>,

    /// Registry runs inside the target cluster (reached through a tunnel)
    pub internal_registry: bool,

    /// Service fronting the in-cluster registry
    pub service_name: String,

    /// Port of `service_name`
    pub service_port: u16,

    /// Push friendly names only, without checksum-tagged copies
    pub no_checksum: bool,
}

impl Default for RegistryInfo {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:31999".to_string(),
            push_username: None,
            push_password: None,
            internal_registry: true,
            service_name: "skiff-docker-registry".to_string(),
            service_port: 5000,
            no_checksum: false,
        }
    }
}

/// In-cluster registry bootstrap configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectorConfig {
    /// Namespace holding the bootstrap objects
    pub namespace: String,

    /// Payload chunk size in bytes (ConfigMap size ceiling)
    pub chunk_size: usize,

    /// Pause between ConfigMap writes, in milliseconds
    pub write_delay_ms: u64,

    /// Readiness poll interval, in seconds
    pub readiness_interval_secs: u64,

    /// Failed readiness polls tolerated per candidate
    pub readiness_failure_threshold: u32,

    /// Node images starting with this prefix never host the injector
    pub seed_exclusion_prefix: String,

    /// Bootstrap pod name
    pub pod_name: String,

    /// `app` label value shared by the pod and service selector
    pub app_label: String,

    /// Service exposing the seed registry
    pub service_name: String,

    /// ConfigMap carrying the injector binary
    pub binary_config_map: String,

    /// Injector binary file name inside the pod
    pub binary_name: String,

    /// Directory (under /) receiving the binary and payload chunks
    pub init_dir: String,

    /// Directory (under /) backing the seed registry storage
    pub seed_dir: String,

    /// Seed registry port inside the pod
    pub registry_port: u16,

    /// Time allowed for enumerating candidate node images, in seconds
    pub enumeration_timeout_secs: u64,

    /// Poll interval while waiting for a deleted pod to disappear, in milliseconds
    pub pod_deletion_poll_ms: u64,

    /// Time allowed for a deleted pod to disappear, in seconds
    pub pod_deletion_timeout_secs: u64,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            namespace: "skiff".to_string(),
            chunk_size: 1024 * 768,
            write_delay_ms: 250,
            readiness_interval_secs: 2,
            readiness_failure_threshold: 10,
            seed_exclusion_prefix: "127.0.0.1:".to_string(),
            pod_name: "injector".to_string(),
            app_label: "skiff-injector".to_string(),
            service_name: "skiff-injector".to_string(),
            binary_config_map: "skiff-injector-binary".to_string(),
            binary_name: "skiff-injector".to_string(),
            init_dir: "skiff-init".to_string(),
            seed_dir: "skiff-seed".to_string(),
            registry_port: 5000,
            enumeration_timeout_secs: 300,
            pod_deletion_poll_ms: 1000,
            pod_deletion_timeout_secs: 120,
        }
    }
}

impl InjectorConfig {
    pub fn write_delay(&self) -> Duration {
        Duration::from_millis(self.write_delay_ms)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_secs(self.readiness_interval_secs)
    }

    pub fn enumeration_timeout(&self) -> Duration {
        Duration::from_secs(self.enumeration_timeout_secs)
    }

    pub fn pod_deletion_poll(&self) -> Duration {
        Duration::from_millis(self.pod_deletion_poll_ms)
    }

    pub fn pod_deletion_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_deletion_timeout_secs)
    }
}

/// Skiff home directory (~/.skiff)
pub fn skiff_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".skiff")
}

/// Default image cache layout (~/.skiff/cache/images)
pub fn default_cache_dir() -> PathBuf {
    skiff_home().join("cache").join("images")
}

/// Docker-compatible credential store (~/.docker/config.json)
pub fn default_docker_config() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".docker")
        .join("config.json")
}
