//! Push pipeline.
//!
//! Pushes images from an OCI layout into a target registry. In checksum
//! mode every image goes out twice: under a checksum-suffixed repository
//! name (stable across source registries) and under its friendly name.
//! Already-present blobs are skipped, so the second push mostly moves
//! manifests.

use std::sync::Arc;
use std::time::Duration;

use skiff_core::config::{RegistryInfo, TransferConfig};
use skiff_core::descriptor::{Descriptor, Manifest, OCI_MANIFEST_MEDIA_TYPE};
use skiff_core::error::{Result, SkiffError};
use skiff_core::progress::ProgressHandle;

use crate::cluster::tunnel::Tunnel;
use crate::oci::{ImageReference, OciLayout, Remote};

use super::pool::CancelToken;
use super::retry::retry_fixed;

/// One pushed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedImage {
    /// Reference as recorded in the layout
    pub source: String,
    /// Every reference written to the target registry
    pub targets: Vec<String>,
    /// Manifest digest
    pub digest: String,
}

/// Outcome of [`ImagePusher::push_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub images: Vec<PushedImage>,
    /// Bytes accounted across all passes
    pub total_bytes: u64,
}

struct LocalImage {
    name: String,
    reference: ImageReference,
    raw_manifest: Vec<u8>,
    media_type: String,
    manifest: Manifest,
    size: u64,
}

/// Pushes layout images into a registry.
pub struct ImagePusher {
    remote: Arc<dyn Remote>,
    registry: RegistryInfo,
    retry_attempts: u32,
    retry_backoff: Duration,
    cancel: CancelToken,
}

impl ImagePusher {
    pub fn new(remote: Arc<dyn Remote>, registry: RegistryInfo, config: &TransferConfig) -> Self {
        Self {
            remote,
            registry,
            retry_attempts: config.retry_attempts,
            retry_backoff: config.retry_backoff(),
            cancel: CancelToken::never(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Push `images` (references recorded in `layout`) through `tunnel`.
    ///
    /// No rollback happens on failure: pushed content stays, and a rerun
    /// resumes by skipping it.
    pub async fn push_all(
        &self,
        layout: &OciLayout,
        images: &[String],
        tunnel: &dyn Tunnel,
        progress: ProgressHandle,
    ) -> Result<PushReport> {
        let mut local = Vec::with_capacity(images.len());
        for name in images {
            local.push(load_local_image(layout, name).await?);
        }

        let mut total_bytes: u64 = local.iter().map(|img| img.size).sum();
        if !self.registry.no_checksum {
            total_bytes *= 2;
        }
        progress.set_total(total_bytes);

        let handle = tunnel.connect().await?;
        let endpoint = handle.endpoint().to_string();
        tracing::info!(
            images = local.len(),
            endpoint = %endpoint,
            checksum = !self.registry.no_checksum,
            total_bytes,
            "Pushing images"
        );

        let result = self
            .push_images(layout, &local, &endpoint, &progress)
            .await;
        handle.close().await;

        let pushed = result?;
        progress.finish(&format!("Pushed {} images", pushed.len()));
        Ok(PushReport {
            images: pushed,
            total_bytes,
        })
    }

    async fn push_images(
        &self,
        layout: &OciLayout,
        images: &[LocalImage],
        endpoint: &str,
        progress: &ProgressHandle,
    ) -> Result<Vec<PushedImage>> {
        let mut pushed = Vec::with_capacity(images.len());
        for image in images {
            progress.update_title(&format!("Pushing {}", image.name));

            let mut targets = Vec::with_capacity(2);
            if !self.registry.no_checksum {
                targets.push(image.reference.transform_host(endpoint)?);
            }
            targets.push(image.reference.transform_host_without_checksum(endpoint)?);

            let mut digest = String::new();
            for target in &targets {
                let descriptor = retry_fixed(
                    self.retry_attempts,
                    self.retry_backoff,
                    &self.cancel,
                    |attempt| {
                        tracing::debug!(
                            source = %image.name,
                            target = %target,
                            attempt,
                            "Pushing image"
                        );
                        self.push_image(layout, image, target)
                    },
                )
                .await?;
                progress.add(image.size);
                digest = descriptor.digest;
            }

            pushed.push(PushedImage {
                source: image.name.clone(),
                targets: targets.iter().map(|t| t.reference.clone()).collect(),
                digest,
            });
        }
        Ok(pushed)
    }

    async fn push_image(
        &self,
        layout: &OciLayout,
        image: &LocalImage,
        target: &ImageReference,
    ) -> Result<Descriptor> {
        let blobs = std::iter::once(&image.manifest.config).chain(image.manifest.layers.iter());
        for blob in blobs {
            self.cancel.check()?;
            if self.remote.blob_exists(target, blob).await? {
                continue;
            }
            let mut file = layout.open_blob(&blob.digest).await?;
            let pushed = self.remote.push_blob_from(target, blob, &mut file).await?;
            if pushed.digest != blob.digest {
                return Err(SkiffError::TransientIo(format!(
                    "Pushed blob digest {} does not match {}",
                    pushed.digest, blob.digest
                )));
            }
        }
        self.cancel.check()?;
        self.remote
            .push_manifest(target, &image.raw_manifest, &image.media_type)
            .await
    }
}

async fn load_local_image(layout: &OciLayout, name: &str) -> Result<LocalImage> {
    let root = layout
        .resolve_reference(name)
        .await?
        .ok_or_else(|| SkiffError::NotFound {
            reference: name.to_string(),
            message: format!("not present in layout {}", layout.root().display()),
        })?;
    let raw_manifest = layout.read_blob(&root.digest).await?;
    let manifest = Manifest::from_slice(&raw_manifest)?;
    let media_type = manifest
        .media_type
        .clone()
        .unwrap_or_else(|| OCI_MANIFEST_MEDIA_TYPE.to_string());
    let size = raw_manifest.len() as u64 + manifest.layers_size();

    Ok(LocalImage {
        name: name.to_string(),
        reference: ImageReference::parse(name)?,
        raw_manifest,
        media_type,
        manifest,
        size,
    })
}
