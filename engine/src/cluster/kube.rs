//! Kubernetes REST client.
//!
//! Talks to the API server directly with `reqwest`, configured from a
//! kubeconfig file. Bearer-token and CA-data authentication are supported;
//! that covers service-account kubeconfigs and most managed clusters.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use skiff_core::error::{Result, SkiffError};

use super::client::ClusterClient;
use super::objects::{ConfigMap, ObjectList, Pod, Service};

// ============================================================================
// Kubeconfig
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    #[serde(default)]
    current_context: String,
    #[serde(default)]
    clusters: Vec<Named<ClusterEntry>>,
    #[serde(default)]
    users: Vec<Named<UserEntry>>,
    #[serde(default)]
    contexts: Vec<Named<ContextEntry>>,
}

#[derive(Debug, Deserialize)]
struct Named<T> {
    name: String,
    #[serde(alias = "cluster", alias = "user", alias = "context")]
    value: T,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    #[serde(default)]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    client_certificate_data: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: String,
}

/// Connection settings resolved from a kubeconfig context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeEndpoint {
    pub server: String,
    pub token: Option<String>,
    pub ca_pem: Option<Vec<u8>>,
    pub insecure: bool,
}

impl KubeEndpoint {
    /// Parse kubeconfig YAML, selecting `context` or the current context.
    pub fn from_kubeconfig(yaml: &str, context: Option<&str>) -> Result<Self> {
        let config: Kubeconfig = serde_yaml::from_str(yaml)
            .map_err(|e| SkiffError::ConfigError(format!("Invalid kubeconfig: {}", e)))?;

        let context_name = context.unwrap_or(&config.current_context);
        let ctx = find(&config.contexts, context_name, "context")?;
        let cluster = find(&config.clusters, &ctx.cluster, "cluster")?;
        let user = if ctx.user.is_empty() {
            None
        } else {
            Some(find(&config.users, &ctx.user, "user")?)
        };

        if user.map_or(false, |u| u.client_certificate_data.is_some() && u.token.is_none()) {
            return Err(SkiffError::ConfigError(format!(
                "Kubeconfig user '{}' uses client certificates; a bearer token is required",
                ctx.user
            )));
        }

        let ca_pem = match cluster.certificate_authority_data {
            Some(ref data) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(data.trim())
                    .map_err(|e| {
                        SkiffError::ConfigError(format!("Invalid certificate-authority-data: {}", e))
                    })?,
            ),
            None => None,
        };

        Ok(Self {
            server: cluster.server.trim_end_matches('/').to_string(),
            token: user.and_then(|u| u.token.clone()),
            ca_pem,
            insecure: cluster.insecure_skip_tls_verify,
        })
    }
}

fn find<'a, T>(entries: &'a [Named<T>], name: &str, kind: &str) -> Result<&'a T> {
    entries
        .iter()
        .find(|e| e.name == name)
        .map(|e| &e.value)
        .ok_or_else(|| SkiffError::ConfigError(format!("Kubeconfig {} '{}' not found", kind, name)))
}

/// `$KUBECONFIG` if set, else `~/.kube/config`.
pub fn default_kubeconfig() -> PathBuf {
    if let Some(path) = std::env::var_os("KUBECONFIG") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kube")
        .join("config")
}

// ============================================================================
// Client
// ============================================================================

/// [`ClusterClient`] over the Kubernetes REST API.
pub struct KubeClient {
    http: reqwest::Client,
    endpoint: KubeEndpoint,
}

impl KubeClient {
    pub fn new(endpoint: KubeEndpoint) -> Result<Self> {
        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(endpoint.insecure);
        if let Some(ref pem) = endpoint.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| SkiffError::ConfigError(format!("Invalid cluster CA: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| SkiffError::Other(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, endpoint })
    }

    /// Load from a kubeconfig file (default location when `None`).
    pub fn from_kubeconfig(path: Option<&Path>, context: Option<&str>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_kubeconfig);
        let yaml = std::fs::read_to_string(&path).map_err(|e| {
            SkiffError::ConfigError(format!("Failed to read kubeconfig {}: {}", path.display(), e))
        })?;
        let endpoint = KubeEndpoint::from_kubeconfig(&yaml, context)?;
        tracing::debug!(server = %endpoint.server, kubeconfig = %path.display(), "Using cluster");
        Self::new(endpoint)
    }

    pub fn server(&self) -> &str {
        &self.endpoint.server
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .http
            .request(method, format!("{}{}", self.endpoint.server, path));
        match self.endpoint.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| SkiffError::ClusterError(format!("Failed to {}: {}", what, e)))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, what, &body, &self.endpoint.server))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T> {
        self.send(request, what)
            .await?
            .json()
            .await
            .map_err(|e| SkiffError::ClusterError(format!("Failed to decode {} response: {}", what, e)))
    }

    async fn create<T: Serialize + Sync>(&self, collection: &str, body: &T, what: &str) -> Result<reqwest::Response> {
        self.send(self.request(Method::POST, collection).json(body), what)
            .await
    }

    /// DELETE that treats 404 as success.
    async fn delete(&self, path: &str, what: &str) -> Result<()> {
        match self.send(self.request(Method::DELETE, path), what).await {
            Ok(_) | Err(SkiffError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn status_error(status: StatusCode, what: &str, body: &str, server: &str) -> SkiffError {
    let message = format!("{} returned {}: {}", what, status, body.trim());
    match status {
        StatusCode::NOT_FOUND => SkiffError::NotFound {
            reference: what.to_string(),
            message,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SkiffError::Auth {
            registry: server.to_string(),
            message,
        },
        _ => SkiffError::ClusterError(message),
    }
}

/// Skip the grace period and remove dependents before the pod itself.
const POD_DELETE_OPTIONS: [(&str, &str); 2] = [
    ("gracePeriodSeconds", "0"),
    ("propagationPolicy", "Foreground"),
];

fn namespaced(namespace: &str, resource: &str) -> String {
    format!("/api/v1/namespaces/{}/{}", namespace, resource)
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn list_running_pods(&self) -> Result<Vec<Pod>> {
        let request = self
            .request(Method::GET, "/api/v1/pods")
            .query(&[("fieldSelector", "status.phase=Running")]);
        let list: ObjectList<Pod> = self.send_json(request, "list pods").await?;
        Ok(list.items)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let meta = &config_map.metadata;
        let what = format!("create configmap {}/{}", meta.namespace, meta.name);
        let collection = namespaced(&meta.namespace, "configmaps");
        let response = self
            .request(Method::POST, &collection)
            .json(config_map)
            .send()
            .await
            .map_err(|e| SkiffError::ClusterError(format!("Failed to {}: {}", what, e)))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                let path = format!("{}/{}", collection, meta.name);
                self.send(self.request(Method::PUT, &path).json(config_map), &what)
                    .await?;
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(status_error(status, &what, &body, &self.endpoint.server))
            }
        }
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        let path = format!("{}/{}", namespaced(namespace, "configmaps"), name);
        self.delete(&path, &format!("delete configmap {}/{}", namespace, name))
            .await
    }

    async fn delete_config_maps_by_label(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let request = self
            .request(Method::DELETE, &namespaced(namespace, "configmaps"))
            .query(&[("labelSelector", format!("{}={}", key, value))]);
        self.send(request, &format!("delete configmaps {}={}", key, value))
            .await?;
        Ok(())
    }

    async fn create_service(&self, service: &Service) -> Result<u16> {
        let meta = &service.metadata;
        let what = format!("create service {}/{}", meta.namespace, meta.name);
        let created: Service = self
            .create(&namespaced(&meta.namespace, "services"), service, &what)
            .await?
            .json()
            .await
            .map_err(|e| SkiffError::ClusterError(format!("Failed to decode {} response: {}", what, e)))?;
        created
            .assigned_node_port()
            .ok_or_else(|| SkiffError::ClusterError(format!("{}: no node port assigned", what)))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        let path = format!("{}/{}", namespaced(namespace, "services"), name);
        self.delete(&path, &format!("delete service {}/{}", namespace, name))
            .await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        let meta = &pod.metadata;
        let what = format!("create pod {}/{}", meta.namespace, meta.name);
        self.create(&namespaced(&meta.namespace, "pods"), pod, &what)
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let path = format!("{}/{}", namespaced(namespace, "pods"), name);
        let request = self
            .request(Method::DELETE, &path)
            .query(&POD_DELETE_OPTIONS);
        match self
            .send(request, &format!("delete pod {}/{}", namespace, name))
            .await
        {
            Ok(_) | Err(SkiffError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn pod_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let path = format!("{}/{}", namespaced(namespace, "pods"), name);
        match self
            .send(self.request(Method::GET, &path), &format!("get pod {}/{}", namespace, name))
            .await
        {
            Ok(_) => Ok(true),
            Err(SkiffError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
  - name: dev-cluster
    cluster:
      server: https://10.0.0.1:6443/
      certificate-authority-data: aGVsbG8=
  - name: lab-cluster
    cluster:
      server: https://lab:6443
      insecure-skip-tls-verify: true
users:
  - name: dev-user
    user:
      token: abc123
  - name: cert-user
    user:
      client-certificate-data: Zm9v
      client-key-data: YmFy
contexts:
  - name: dev
    context:
      cluster: dev-cluster
      user: dev-user
  - name: lab
    context:
      cluster: lab-cluster
  - name: certs
    context:
      cluster: dev-cluster
      user: cert-user
"#;

    #[test]
    fn test_current_context() {
        let endpoint = KubeEndpoint::from_kubeconfig(KUBECONFIG, None).unwrap();
        assert_eq!(endpoint.server, "https://10.0.0.1:6443");
        assert_eq!(endpoint.token.as_deref(), Some("abc123"));
        assert_eq!(endpoint.ca_pem.as_deref(), Some(b"hello".as_slice()));
        assert!(!endpoint.insecure);
    }

    #[test]
    fn test_explicit_context_without_user() {
        let endpoint = KubeEndpoint::from_kubeconfig(KUBECONFIG, Some("lab")).unwrap();
        assert_eq!(endpoint.server, "https://lab:6443");
        assert!(endpoint.token.is_none());
        assert!(endpoint.insecure);
    }

    #[test]
    fn test_unknown_context() {
        let result = KubeEndpoint::from_kubeconfig(KUBECONFIG, Some("prod"));
        assert!(matches!(result, Err(SkiffError::ConfigError(_))));
    }

    #[test]
    fn test_client_certificates_rejected() {
        let result = KubeEndpoint::from_kubeconfig(KUBECONFIG, Some("certs"));
        assert!(matches!(result, Err(SkiffError::ConfigError(_))));
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "delete pod", "", "s"),
            SkiffError::NotFound { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, "list pods", "", "s"),
            SkiffError::Auth { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, "create pod", "", "s"),
            SkiffError::ClusterError(_)
        ));
    }

    #[test]
    fn test_missing_kubeconfig_file() {
        let result = KubeClient::from_kubeconfig(Some(Path::new("/nonexistent/kubeconfig")), None);
        assert!(matches!(result, Err(SkiffError::ConfigError(_))));
    }

    /// Serves one request per connection, answering with the status picked
    /// by `respond` and recording each request line.
    async fn serve<F>(respond: F) -> (String, Arc<Mutex<Vec<String>>>)
    where
        F: Fn(&str) -> u16 + Send + Sync + 'static,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let respond = Arc::new(respond);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let log = log.clone();
                let respond = respond.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let head_end = loop {
                        let n = socket.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                    let length = head
                        .lines()
                        .filter_map(|l| l.split_once(':'))
                        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    while buf.len() < head_end + length {
                        let n = socket.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }

                    let line = head.lines().next().unwrap_or_default().to_string();
                    let status = (*respond)(&line);
                    log.lock().push(line);
                    let response = format!(
                        "HTTP/1.1 {} Status\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{{}}",
                        status
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        (format!("http://{}", addr), seen)
    }

    fn plain_client(server: String) -> KubeClient {
        KubeClient::new(KubeEndpoint {
            server,
            token: Some("abc123".to_string()),
            ca_pem: None,
            insecure: false,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_delete_pod_is_immediate_and_existence_follows_404() {
        let gets = Arc::new(AtomicUsize::new(0));
        let counter = gets.clone();
        let (server, seen) = serve(move |line| {
            if line.starts_with("GET ") {
                // terminating for two checks, then gone
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    200
                } else {
                    404
                }
            } else {
                200
            }
        })
        .await;
        let client = plain_client(server);

        client.delete_pod("skiff", "injector").await.unwrap();
        assert!(client.pod_exists("skiff", "injector").await.unwrap());
        assert!(client.pod_exists("skiff", "injector").await.unwrap());
        assert!(!client.pod_exists("skiff", "injector").await.unwrap());

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 4);
        assert!(seen[0].starts_with("DELETE /api/v1/namespaces/skiff/pods/injector?"));
        assert!(seen[0].contains("gracePeriodSeconds=0"));
        assert!(seen[0].contains("propagationPolicy=Foreground"));
        assert!(seen[1].starts_with("GET /api/v1/namespaces/skiff/pods/injector "));
    }

    #[tokio::test]
    async fn test_delete_missing_pod_succeeds() {
        let (server, _) = serve(|_| 404).await;
        let client = plain_client(server);
        client.delete_pod("skiff", "injector").await.unwrap();
        assert!(!client.pod_exists("skiff", "injector").await.unwrap());
    }
}
