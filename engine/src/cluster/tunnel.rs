//! Reaching registries that live inside the cluster.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use skiff_core::error::{Result, SkiffError};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Opens a route to a registry.
#[async_trait]
pub trait Tunnel: Send + Sync {
    async fn connect(&self) -> Result<TunnelHandle>;
}

/// An open route. Port-forward processes are killed when the handle drops.
#[derive(Debug)]
pub struct TunnelHandle {
    endpoint: String,
    process: Option<tokio::process::Child>,
}

impl TunnelHandle {
    pub fn direct(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            process: None,
        }
    }

    /// `host:port` of the route.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// `http://host:port`.
    pub fn http_endpoint(&self) -> String {
        format!("http://{}", self.endpoint)
    }

    /// Close the route, waiting for any forwarding process to exit.
    pub async fn close(mut self) {
        if let Some(mut child) = self.process.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "Port-forward already exited");
            }
        }
    }
}

/// A registry reachable at a fixed address.
#[derive(Debug, Clone)]
pub struct DirectTunnel {
    address: String,
}

impl DirectTunnel {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Tunnel for DirectTunnel {
    async fn connect(&self) -> Result<TunnelHandle> {
        Ok(TunnelHandle::direct(self.address.clone()))
    }
}

/// `kubectl port-forward` to a cluster resource.
#[derive(Debug, Clone)]
pub struct PortForward {
    kubectl: PathBuf,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
    namespace: String,
    resource: String,
    remote_port: u16,
    ready_timeout: Duration,
}

impl PortForward {
    /// Forward a local ephemeral port to `svc/<name>:<port>`.
    pub fn service(namespace: impl Into<String>, name: &str, remote_port: u16) -> Self {
        Self {
            kubectl: PathBuf::from("kubectl"),
            kubeconfig: None,
            context: None,
            namespace: namespace.into(),
            resource: format!("svc/{}", name),
            remote_port,
            ready_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_kubeconfig(mut self, kubeconfig: Option<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    /// Kubeconfig context to forward through; must match the cluster the
    /// forwarded resource was created in.
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_kubectl(mut self, kubectl: impl Into<PathBuf>) -> Self {
        self.kubectl = kubectl.into();
        self
    }
}

impl PortForward {
    fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        if let Some(ref kubeconfig) = self.kubeconfig {
            args.push("--kubeconfig".into());
            args.push(kubeconfig.into());
        }
        if let Some(ref context) = self.context {
            args.push("--context".into());
            args.push(context.into());
        }
        let remote = format!(":{}", self.remote_port);
        args.extend(
            [
                "port-forward",
                "--namespace",
                self.namespace.as_str(),
                "--address",
                "127.0.0.1",
                self.resource.as_str(),
                remote.as_str(),
            ]
            .into_iter()
            .map(OsString::from),
        );
        args
    }
}

#[async_trait]
impl Tunnel for PortForward {
    async fn connect(&self) -> Result<TunnelHandle> {
        let mut cmd = tokio::process::Command::new(&self.kubectl);
        cmd.args(self.args())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            SkiffError::ClusterError(format!(
                "Failed to spawn {} port-forward: {}",
                self.kubectl.display(),
                e
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SkiffError::ClusterError("port-forward stdout unavailable".to_string())
        })?;

        let mut lines = BufReader::new(stdout).lines();
        let wait = async {
            while let Some(line) = lines.next_line().await? {
                if let Some(port) = parse_forwarded_port(&line) {
                    return Ok(Some(port));
                }
            }
            Ok::<_, std::io::Error>(None)
        };

        let port = match tokio::time::timeout(self.ready_timeout, wait).await {
            Ok(Ok(Some(port))) => port,
            Ok(Ok(None)) => {
                return Err(SkiffError::ClusterError(format!(
                    "port-forward to {}/{} exited before forwarding",
                    self.namespace, self.resource
                )))
            }
            Ok(Err(e)) => return Err(SkiffError::IoError(e)),
            Err(_) => {
                return Err(SkiffError::ClusterError(format!(
                    "port-forward to {}/{} not ready after {:?}",
                    self.namespace, self.resource, self.ready_timeout
                )))
            }
        };

        tracing::debug!(
            namespace = %self.namespace,
            resource = %self.resource,
            local_port = port,
            "Port-forward established"
        );
        Ok(TunnelHandle {
            endpoint: format!("127.0.0.1:{}", port),
            process: Some(child),
        })
    }
}

/// Local port from a `Forwarding from 127.0.0.1:PORT -> REMOTE` line.
pub fn parse_forwarded_port(line: &str) -> Option<u16> {
    let rest = line.trim().strip_prefix("Forwarding from ")?;
    let (local, _) = rest.split_once(" -> ")?;
    let (_, port) = local.rsplit_once(':')?;
    port.parse().ok()
}
