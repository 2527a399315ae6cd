//! Pull pipeline.
//!
//! Populates an OCI layout with a set of images in four phases:
//!
//! 1. Metadata: one task per reference resolves its source and manifest.
//! 2. Accounting: layer sizes are summed once per unique digest.
//! 3. Layers: one task per unique digest streams the blob into the layout,
//!    retrying integrity and transient failures. With a layer cache, blobs
//!    already cached are copied from it and fetched ones are added to it.
//! 4. Manifests: one task per image writes its config and manifest; index
//!    entries are then added in input order and annotated with the
//!    reference → digest map.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use skiff_core::config::TransferConfig;
use skiff_core::descriptor::{Descriptor, Manifest};
use skiff_core::error::{Result, SkiffError};
use skiff_core::progress::ProgressHandle;

use crate::oci::{BlobWrite, ImageReference, OciLayout, Remote};

use super::pool::{CancelToken, TaskPool};
use super::retry::retry_fixed;
use super::source::{ImageSource, SourceKind, SourceResolver};

/// In-memory pipe between a blob fetch and its layout write.
const PIPE_CAPACITY: usize = 256 * 1024;

/// One pulled image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledImage {
    /// Reference as requested
    pub name: String,
    /// Manifest digest recorded in the layout
    pub digest: String,
    pub source: SourceKind,
}

/// Outcome of [`ImagePuller::pull_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Images in request order
    pub images: Vec<PulledImage>,
    /// Distinct layer digests across all images
    pub unique_layers: usize,
    /// Layers streamed into the layout by this pull
    pub layers_written: usize,
    /// Layers already present with the right size
    pub layers_skipped: usize,
    /// Declared bytes of all unique layers
    pub total_bytes: u64,
}

struct ImageMeta {
    source: ImageSource,
    raw_manifest: Vec<u8>,
    manifest: Manifest,
}

struct LayerJob {
    remote: Arc<dyn Remote>,
    reference: ImageReference,
    descriptor: Descriptor,
}

/// Pulls images into an OCI layout.
pub struct ImagePuller {
    layout: Arc<OciLayout>,
    resolver: Arc<SourceResolver>,
    retry_attempts: u32,
    retry_backoff: Duration,
    stale_temp_age: Duration,
    layer_cache: Option<Arc<OciLayout>>,
}

impl ImagePuller {
    pub fn new(layout: Arc<OciLayout>, resolver: SourceResolver, config: &TransferConfig) -> Self {
        Self {
            layout,
            resolver: Arc::new(resolver),
            retry_attempts: config.retry_attempts,
            retry_backoff: config.retry_backoff(),
            stale_temp_age: config.stale_temp_age(),
            layer_cache: None,
        }
    }

    /// Read layers and configs through a digest-keyed cache layout shared
    /// across pulls. Ignored when it is the output layout itself.
    pub fn with_layer_cache(mut self, cache: Arc<OciLayout>) -> Self {
        if cache.root() != self.layout.root() {
            self.layer_cache = Some(cache);
        }
        self
    }

    pub fn layout(&self) -> &Arc<OciLayout> {
        &self.layout
    }

    /// Pull every reference into the layout.
    pub async fn pull_all(
        &self,
        references: &[String],
        progress: ProgressHandle,
        cancel: &CancelToken,
    ) -> Result<PullReport> {
        let removed = self
            .layout
            .remove_stale_temp_files(self.stale_temp_age)
            .await?;
        if removed > 0 {
            tracing::debug!(removed, "Cleared interrupted blob writes");
        }

        let metas = self.fetch_metadata(references, &progress, cancel).await?;

        // Layers shared between images are counted and fetched once
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();
        let mut total_bytes = 0u64;
        for meta in &metas {
            for layer in &meta.manifest.layers {
                if seen.insert(layer.digest.clone()) {
                    total_bytes += layer.known_size().unwrap_or(0);
                    jobs.push(LayerJob {
                        remote: meta.source.remote.clone(),
                        reference: meta.source.reference.clone(),
                        descriptor: layer.clone(),
                    });
                }
            }
        }
        let unique_layers = jobs.len();

        tracing::info!(
            images = metas.len(),
            unique_layers,
            total_bytes,
            "Pulling images"
        );
        progress.set_total(total_bytes);
        progress.update_title(&format!("Pulling {} images", metas.len()));

        let outcomes = self.write_layers(jobs, &progress, cancel).await?;
        let layers_written = outcomes
            .iter()
            .filter(|o| matches!(o, BlobWrite::Written(_)))
            .count();

        let manifests = self.write_manifests(&metas, cancel).await?;

        let mut references_map = BTreeMap::new();
        let mut images = Vec::with_capacity(metas.len());
        for (meta, descriptor) in metas.iter().zip(manifests) {
            references_map.insert(meta.source.name.clone(), descriptor.digest.clone());
            images.push(PulledImage {
                name: meta.source.name.clone(),
                digest: descriptor.digest.clone(),
                source: meta.source.kind,
            });
            self.layout.add_manifest(descriptor).await?;
        }
        self.layout.annotate_references(&references_map).await?;

        progress.finish(&format!("Pulled {} images", images.len()));
        Ok(PullReport {
            images,
            unique_layers,
            layers_written,
            layers_skipped: unique_layers - layers_written,
            total_bytes,
        })
    }

    async fn fetch_metadata(
        &self,
        references: &[String],
        progress: &ProgressHandle,
        cancel: &CancelToken,
    ) -> Result<Vec<ImageMeta>> {
        let total = references.len();
        let mut pool = TaskPool::new("metadata", cancel);
        for (idx, requested) in references.iter().enumerate() {
            let resolver = self.resolver.clone();
            let progress = progress.clone();
            let requested = requested.clone();
            pool.submit(move |cancel| async move {
                progress.update_title(&format!(
                    "Fetching image metadata ({} of {}): {}",
                    idx + 1,
                    total,
                    requested
                ));
                let source = resolver.resolve(&requested, &progress).await?;
                cancel.check()?;
                let raw_manifest = source
                    .remote
                    .fetch_manifest(&source.reference, &source.descriptor)
                    .await?;
                let manifest = Manifest::from_slice(&raw_manifest)?;
                tracing::debug!(
                    reference = %requested,
                    source = %source.kind,
                    digest = %source.descriptor.digest,
                    layers = manifest.layers.len(),
                    "Fetched image metadata"
                );
                Ok(ImageMeta {
                    source,
                    raw_manifest,
                    manifest,
                })
            });
        }
        pool.join().await
    }

    async fn write_layers(
        &self,
        jobs: Vec<LayerJob>,
        progress: &ProgressHandle,
        cancel: &CancelToken,
    ) -> Result<Vec<BlobWrite>> {
        let mut pool = TaskPool::new("layers", cancel);
        for job in jobs {
            let layout = self.layout.clone();
            let cache = self.layer_cache.clone();
            let progress = progress.clone();
            let attempts = self.retry_attempts;
            let backoff = self.retry_backoff;
            pool.submit(move |cancel| async move {
                let result = retry_fixed(attempts, backoff, &cancel, |_attempt| {
                    fetch_cached(
                        &layout,
                        cache.as_deref(),
                        job.remote.as_ref(),
                        &job.reference,
                        &job.descriptor,
                        &cancel,
                    )
                })
                .await;

                match result {
                    Ok(outcome) => {
                        let bytes = match outcome {
                            BlobWrite::Written(n) => n,
                            BlobWrite::Existing => job.descriptor.known_size().unwrap_or(0),
                        };
                        progress.add(bytes);
                        Ok(outcome)
                    }
                    Err(e @ SkiffError::Integrity { .. }) => {
                        progress.warn(&format!(
                            "Potential image cache corruption: {} - try clearing the image cache",
                            e
                        ));
                        Err(e)
                    }
                    Err(e) => Err(e),
                }
            });
        }
        pool.join().await
    }

    async fn write_manifests(
        &self,
        metas: &[ImageMeta],
        cancel: &CancelToken,
    ) -> Result<Vec<Descriptor>> {
        let mut pool = TaskPool::new("manifests", cancel);
        for meta in metas {
            let layout = self.layout.clone();
            let cache = self.layer_cache.clone();
            let remote = meta.source.remote.clone();
            let reference = meta.source.reference.clone();
            let root = meta.source.descriptor.clone();
            let config = meta.manifest.config.clone();
            let raw = meta.raw_manifest.clone();
            let attempts = self.retry_attempts;
            let backoff = self.retry_backoff;
            pool.submit(move |cancel| async move {
                retry_fixed(attempts, backoff, &cancel, |_attempt| {
                    fetch_cached(
                        &layout,
                        cache.as_deref(),
                        remote.as_ref(),
                        &reference,
                        &config,
                        &cancel,
                    )
                })
                .await?;

                let mut descriptor = Descriptor::from_bytes(root.media_type.clone(), &raw);
                descriptor.platform = root.platform.clone();
                layout.write_blob_bytes(&descriptor, &raw).await?;
                Ok(descriptor)
            });
        }
        pool.join().await
    }
}

/// [`fetch_into_layout`] through an optional layer cache.
///
/// Cache hits are copied and re-verified without contacting `remote`.
/// Unreadable cache entries fall back to the remote, and a failure to fill
/// the cache is only logged.
pub async fn fetch_cached(
    layout: &OciLayout,
    cache: Option<&OciLayout>,
    remote: &dyn Remote,
    reference: &ImageReference,
    descriptor: &Descriptor,
    cancel: &CancelToken,
) -> Result<BlobWrite> {
    let Some(cache) = cache else {
        return fetch_into_layout(layout, remote, reference, descriptor, cancel).await;
    };
    if layout.has_blob(descriptor).await? {
        return Ok(BlobWrite::Existing);
    }

    if cache.has_blob(descriptor).await? {
        match copy_blob(cache, layout, descriptor, cancel).await {
            Ok(outcome) => {
                tracing::debug!(digest = %descriptor.digest, "Blob served from layer cache");
                return Ok(outcome);
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => tracing::warn!(
                digest = %descriptor.digest,
                cache = %cache.root().display(),
                error = %e,
                "Ignoring unusable cached blob"
            ),
        }
    }

    let outcome = fetch_into_layout(layout, remote, reference, descriptor, cancel).await?;
    match copy_blob(layout, cache, descriptor, cancel).await {
        Ok(_) => {}
        Err(e) if e.is_cancelled() => return Err(e),
        Err(e) => tracing::warn!(
            digest = %descriptor.digest,
            cache = %cache.root().display(),
            error = %e,
            "Failed to add blob to layer cache"
        ),
    }
    Ok(outcome)
}

async fn copy_blob(
    from: &OciLayout,
    to: &OciLayout,
    descriptor: &Descriptor,
    cancel: &CancelToken,
) -> Result<BlobWrite> {
    let file = from.open_blob(&descriptor.digest).await?;
    to.write_blob(descriptor, file, cancel).await
}

/// Stream one blob from `remote` into the layout.
///
/// The fetch and the layout write run concurrently over an in-memory pipe,
/// so the blob is never held in memory as a whole.
pub async fn fetch_into_layout(
    layout: &OciLayout,
    remote: &dyn Remote,
    reference: &ImageReference,
    descriptor: &Descriptor,
    cancel: &CancelToken,
) -> Result<BlobWrite> {
    if layout.has_blob(descriptor).await? {
        return Ok(BlobWrite::Existing);
    }
    cancel.check()?;

    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let fetch = async {
        let mut writer = writer;
        let result = remote.fetch_blob(reference, descriptor, &mut writer).await;
        drop(writer);
        result
    };
    let write = layout.write_blob(descriptor, reader, cancel);
    let (fetched, written) = tokio::join!(fetch, write);

    match (fetched, written) {
        (Ok(_), Ok(outcome)) => Ok(outcome),
        (_, Err(e)) if e.is_cancelled() => Err(e),
        // The writer gave up first; its error is the cause
        (Err(SkiffError::IoError(io)), Err(write_err))
            if io.kind() == std::io::ErrorKind::BrokenPipe =>
        {
            Err(write_err)
        }
        (Err(fetch_err), _) => Err(fetch_err),
        (Ok(_), Err(write_err)) => Err(write_err),
    }
}
