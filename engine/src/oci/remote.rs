//! Remote registry contract.
//!
//! Every implementation must be safe to share across concurrent transfer
//! tasks. Pushes are idempotent: a digest already present remotely is a
//! successful no-op.

use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use skiff_core::descriptor::{Descriptor, Manifest};
use skiff_core::error::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use super::credentials::RegistryAuth;
use super::reference::ImageReference;

/// Byte sink handed to [`Remote::fetch_blob`].
pub type BlobWriter<'a> = dyn AsyncWrite + Send + Unpin + 'a;

/// Byte source handed to [`Remote::push_blob_from`].
pub type BlobReader<'a> = dyn AsyncRead + Send + Unpin + 'a;

/// OCI distribution operations used by the transfer pipeline.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Resolve a reference to its manifest descriptor.
    ///
    /// Index references resolve to the entry matching the configured
    /// platform. Fails with `NotFound` when absent and `Auth` when
    /// credentials are rejected.
    async fn resolve(&self, reference: &ImageReference) -> Result<Descriptor>;

    /// Raw manifest bytes, digest-exact.
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>>;

    /// Fetch and parse an image manifest.
    async fn fetch_image_manifest(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<Manifest> {
        let raw = self.fetch_manifest(reference, descriptor).await?;
        Manifest::from_slice(&raw)
    }

    /// Stream a blob into `writer`, returning the number of bytes written.
    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        writer: &mut BlobWriter<'_>,
    ) -> Result<u64>;

    /// Whether the repository already holds the blob.
    async fn blob_exists(&self, reference: &ImageReference, descriptor: &Descriptor)
        -> Result<bool>;

    /// Upload a blob, skipping the upload when the digest already exists.
    async fn push_blob(
        &self,
        reference: &ImageReference,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor>;

    /// Upload a blob of known digest from `reader`.
    ///
    /// The default buffers the whole blob and defers to [`Remote::push_blob`];
    /// network remotes override it to upload in bounded chunks.
    async fn push_blob_from(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        reader: &mut BlobReader<'_>,
    ) -> Result<Descriptor> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        self.push_blob(reference, &data, &descriptor.media_type).await
    }

    /// Upload a manifest under the reference's tag (or digest).
    async fn push_manifest(
        &self,
        reference: &ImageReference,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor>;
}

/// Transport and credential settings for a remote.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// Talk plain HTTP instead of TLS
    pub plain_http: bool,
    /// Accept invalid TLS certificates
    pub insecure_skip_verify: bool,
    /// Credentials for every registry, bypassing the credential store
    pub auth: Option<RegistryAuth>,
    /// Credential store location (defaults to ~/.docker/config.json)
    pub credentials_path: Option<PathBuf>,
    /// Acceptable architectures when resolving an index, in preference order
    pub architectures: Vec<String>,
    /// Operating system when resolving an index
    pub os: String,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            plain_http: false,
            insecure_skip_verify: false,
            auth: None,
            credentials_path: None,
            architectures: vec![skiff_core::descriptor::host_architecture()],
            os: "linux".to_string(),
        }
    }
}

impl RemoteOptions {
    pub fn from_transfer_config(config: &skiff_core::config::TransferConfig) -> Self {
        Self {
            plain_http: config.plain_http,
            insecure_skip_verify: config.insecure_skip_verify,
            architectures: config.architectures.clone(),
            ..Default::default()
        }
    }

    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = Some(auth);
        self
    }
}

/// Writer adapter that counts the bytes passing through it.
pub(crate) struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: AsyncWrite + Unpin> CountingWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    pub(crate) fn written(&self) -> u64 {
        self.written
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
