//! Registry credentials.
//!
//! Reads and writes the Docker-compatible `config.json` (`auths` keyed by
//! registry host), so logins made with other tools are honoured and vice
//! versa. Unknown top-level keys (`credsStore`, `currentContext`, ...) are
//! preserved on write. Writes are atomic (write tmp, rename).

use std::collections::BTreeMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use skiff_core::config::default_docker_config;
use skiff_core::error::{Result, SkiffError};

/// Canonical credential key for Docker Hub.
pub const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";

/// Username Docker uses to mark an identity token.
const IDENTITY_TOKEN_USER: &str = "<token>";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AuthEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identitytoken: Option<String>,
}

impl AuthEntry {
    fn credentials(&self) -> Option<(String, String)> {
        if let Some(ref encoded) = self.auth {
            if let Some(pair) = decode_auth(encoded) {
                return Some(pair);
            }
        }
        if let (Some(u), Some(p)) = (&self.username, &self.password) {
            return Some((u.clone(), p.clone()));
        }
        self.identitytoken
            .as_ref()
            .map(|token| (IDENTITY_TOKEN_USER.to_string(), token.clone()))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
    #[serde(flatten)]
    other: serde_json::Map<String, serde_json::Value>,
}

/// Host-keyed credential store backed by a Docker `config.json`.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Credential store at `~/.docker/config.json`.
    pub fn default_path() -> Self {
        Self::new(default_docker_config())
    }

    /// Credential store at a custom path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Store credentials for a registry. Overwrites existing entry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.load()?;
        let key = auth_key(registry);
        file.auths.retain(|k, _| auth_key(k) != key);
        file.auths.insert(
            key,
            AuthEntry {
                auth: Some(STANDARD.encode(format!("{}:{}", username, password))),
                ..Default::default()
            },
        );
        self.save(&file)
    }

    /// Get credentials for a registry as `(username, password)`.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        let file = self.load()?;
        let key = auth_key(registry);
        Ok(file
            .auths
            .iter()
            .filter(|(k, _)| auth_key(k) == key)
            .find_map(|(_, entry)| entry.credentials()))
    }

    /// Remove credentials for a registry. Returns true if an entry existed.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file = self.load()?;
        let key = auth_key(registry);
        let before = file.auths.len();
        file.auths.retain(|k, _| auth_key(k) != key);
        let removed = file.auths.len() != before;
        if removed {
            self.save(&file)?;
        }
        Ok(removed)
    }

    /// List all registries with stored credentials.
    pub fn list_registries(&self) -> Result<Vec<String>> {
        let file = self.load()?;
        let mut registries: Vec<String> = file.auths.keys().map(|k| auth_key(k)).collect();
        registries.sort();
        registries.dedup();
        Ok(registries)
    }

    fn load(&self) -> Result<DockerConfigFile> {
        if !self.path.exists() {
            return Ok(DockerConfigFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            SkiffError::ConfigError(format!(
                "Failed to read credential store {}: {}",
                self.path.display(),
                e
            ))
        })?;
        if data.trim().is_empty() {
            return Ok(DockerConfigFile::default());
        }
        serde_json::from_str(&data).map_err(|e| {
            SkiffError::ConfigError(format!(
                "Failed to parse credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn save(&self, file: &DockerConfigFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SkiffError::ConfigError(format!(
                    "Failed to create credential store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let tmp_path = self.path.with_extension("tmp");
        let data = serde_json::to_string_pretty(file)?;
        std::fs::write(&tmp_path, &data).map_err(|e| {
            SkiffError::ConfigError(format!(
                "Failed to write credential store {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            SkiffError::ConfigError(format!(
                "Failed to rename credential store {} -> {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

fn decode_auth(encoded: &str) -> Option<(String, String)> {
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Normalize a registry name to its `config.json` key.
///
/// Scheme and path are dropped; every Docker Hub alias maps to
/// [`DOCKER_HUB_AUTH_KEY`].
pub fn auth_key(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    let r = r
        .strip_prefix("https://")
        .or_else(|| r.strip_prefix("http://"))
        .unwrap_or(r.as_str());
    let host = r.split('/').next().unwrap_or(r);
    match host {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" => {
            DOCKER_HUB_AUTH_KEY.to_string()
        }
        other => other.to_string(),
    }
}

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`, falling back to
    /// anonymous if either is unset.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(u), Some(p)) => Self::basic(u, p),
            _ => Self::anonymous(),
        }
    }

    /// Credential store first, then environment, then anonymous.
    pub fn resolve(store: &CredentialStore, registry: &str) -> Self {
        match store.get(registry) {
            Ok(Some((username, password))) => return Self::basic(username, password),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(registry, error = %e, "Ignoring unreadable credential store");
            }
        }
        Self::from_env()
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none() || self.password.is_none()
    }

    /// `(username, password)` when basic credentials are set.
    pub fn basic_credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("config.json"))
    }

    #[test]
    fn test_store_and_get() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("ghcr.io", "user1", "pass1").unwrap();
        let creds = store.get("ghcr.io").unwrap();
        assert_eq!(creds, Some(("user1".to_string(), "pass1".to_string())));
    }

    #[test]
    fn test_get_nonexistent() {
        let dir = TempDir::new().unwrap();
        assert_eq!(test_store(&dir).get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_written_in_docker_format() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.store("ghcr.io", "user", "pass").unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["auths"]["ghcr.io"]["auth"], STANDARD.encode("user:pass"));
    }

    #[test]
    fn test_reads_existing_docker_config() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        std::fs::write(
            store.path(),
            format!(
                r#"{{
                    "auths": {{
                        "https://index.docker.io/v1/": {{"auth": "{}"}},
                        "quay.io": {{"username": "robot", "password": "secret"}},
                        "https://ecr.example.com/v2/": {{"identitytoken": "tok"}}
                    }},
                    "credsStore": "desktop"
                }}"#,
                STANDARD.encode("hubuser:hubpass")
            ),
        )
        .unwrap();

        assert_eq!(
            store.get("docker.io").unwrap(),
            Some(("hubuser".to_string(), "hubpass".to_string()))
        );
        assert_eq!(
            store.get("quay.io").unwrap(),
            Some(("robot".to_string(), "secret".to_string()))
        );
        assert_eq!(
            store.get("ecr.example.com").unwrap(),
            Some(("<token>".to_string(), "tok".to_string()))
        );
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        std::fs::write(store.path(), r#"{"auths": {}, "credsStore": "desktop"}"#).unwrap();

        store.store("ghcr.io", "u", "p").unwrap();
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("credsStore"));
    }

    #[test]
    fn test_overwrite_and_remove() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("ghcr.io", "user1", "pass1").unwrap();
        store.store("ghcr.io", "user2", "pass2").unwrap();
        assert_eq!(
            store.get("ghcr.io").unwrap(),
            Some(("user2".to_string(), "pass2".to_string()))
        );
        assert!(store.remove("ghcr.io").unwrap());
        assert_eq!(store.get("ghcr.io").unwrap(), None);
        assert!(!store.remove("ghcr.io").unwrap());
    }

    #[test]
    fn test_docker_io_aliases() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("docker.io", "user", "pass").unwrap();
        for alias in ["index.docker.io", "registry-1.docker.io", DOCKER_HUB_AUTH_KEY] {
            assert_eq!(
                store.get(alias).unwrap(),
                Some(("user".to_string(), "pass".to_string()))
            );
        }
        assert_eq!(store.list_registries().unwrap(), vec![DOCKER_HUB_AUTH_KEY]);
    }

    #[test]
    fn test_list_registries() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("quay.io", "u2", "p2").unwrap();
        store.store("ghcr.io", "u1", "p1").unwrap();
        assert_eq!(store.list_registries().unwrap(), vec!["ghcr.io", "quay.io"]);
    }

    #[test]
    fn test_auth_key() {
        assert_eq!(auth_key("GHCR.io"), "ghcr.io");
        assert_eq!(auth_key("https://ghcr.io/v2/"), "ghcr.io");
        assert_eq!(auth_key("registry-1.docker.io"), DOCKER_HUB_AUTH_KEY);
        assert_eq!(auth_key("127.0.0.1:31999"), "127.0.0.1:31999");
    }

    #[test]
    fn test_registry_auth_resolve_from_store() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.store("ghcr.io", "user", "pass").unwrap();

        let auth = RegistryAuth::resolve(&store, "ghcr.io");
        assert_eq!(auth.basic_credentials(), Some(("user", "pass")));
        assert!(!auth.is_anonymous());
    }

    #[test]
    fn test_registry_auth_anonymous() {
        let auth = RegistryAuth::anonymous();
        assert!(auth.is_anonymous());
        assert_eq!(auth.basic_credentials(), None);
    }
}
