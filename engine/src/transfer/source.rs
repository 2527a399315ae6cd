//! Image sources.
//!
//! A requested image is located, in order, in:
//!
//! 1. a local tarball (`.tar`, `.tar.gz`, `.tgz`; OCI archive or `docker save` output)
//! 2. the configured local OCI layout (a `references.json` hit)
//! 3. its remote registry
//! 4. the local Docker daemon (`docker save`), unless the registry rejected
//!    the credentials
//!
//! Tarballs and daemon exports are unpacked into scratch OCI layouts that
//! live as long as the [`SourceResolver`], so every source is served through
//! the same [`Remote`] contract.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use skiff_core::config::TransferConfig;
use skiff_core::descriptor::{
    is_index_media_type, Descriptor, ImageIndex, Manifest, ANNOTATION_BASE_IMAGE_NAME,
    ANNOTATION_REF_NAME, OCI_CONFIG_MEDIA_TYPE, OCI_LAYER_GZIP_MEDIA_TYPE,
    OCI_LAYER_TAR_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE,
};
use skiff_core::error::{Result, SkiffError};
use skiff_core::progress::ProgressHandle;
use tempfile::TempDir;

use crate::oci::{BlobReader, BlobWriter, ImageReference, OciLayout, Remote};
use crate::transfer::CancelToken;

/// Annotation containerd and recent Docker releases put on archive entries.
const ANNOTATION_CONTAINERD_IMAGE_NAME: &str = "io.containerd.image.name";

/// Where an image was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Tarball,
    Layout,
    Registry,
    Daemon,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceKind::Tarball => "tarball",
            SourceKind::Layout => "layout",
            SourceKind::Registry => "registry",
            SourceKind::Daemon => "daemon",
        };
        f.write_str(s)
    }
}

/// A located image, ready for manifest and blob reads.
#[derive(Clone)]
pub struct ImageSource {
    pub kind: SourceKind,
    /// Name recorded in the layout's reference map
    pub name: String,
    /// Reference used to address `remote`
    pub reference: ImageReference,
    /// Resolved manifest descriptor
    pub descriptor: Descriptor,
    pub remote: Arc<dyn Remote>,
}

impl std::fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSource")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("reference", &self.reference.reference)
            .field("digest", &self.descriptor.digest)
            .finish()
    }
}

/// Whether a requested image string names a tarball on disk.
pub fn is_tarball_path(requested: &str) -> bool {
    (requested.ends_with(".tar") || requested.ends_with(".tar.gz") || requested.ends_with(".tgz"))
        && Path::new(requested).is_file()
}

// ============================================================================
// Layout-backed remote
// ============================================================================

/// Serves an [`OciLayout`] through the [`Remote`] contract.
pub struct LayoutSource {
    layout: Arc<OciLayout>,
    architectures: Vec<String>,
}

impl LayoutSource {
    pub fn new(layout: Arc<OciLayout>, architectures: Vec<String>) -> Self {
        Self {
            layout,
            architectures,
        }
    }

    pub fn layout(&self) -> &Arc<OciLayout> {
        &self.layout
    }

    /// Look a reference up by its requested string, full form, or host-less
    /// form.
    pub async fn find(&self, requested: &str, reference: &ImageReference) -> Result<Option<Descriptor>> {
        for candidate in [
            requested.to_string(),
            reference.full_reference(),
            reference.host_less(),
        ] {
            if let Some(desc) = self.layout.resolve_reference(&candidate).await? {
                return self.select_image(desc).await.map(Some);
            }
        }
        Ok(None)
    }

    /// Narrow an index entry to the manifest for the configured platform.
    async fn select_image(&self, descriptor: Descriptor) -> Result<Descriptor> {
        if !is_index_media_type(&descriptor.media_type) {
            return Ok(descriptor);
        }
        let index = ImageIndex::from_slice(&self.layout.read_blob(&descriptor.digest).await?)?;
        index
            .select_platform("linux", &self.architectures)
            .cloned()
            .ok_or_else(|| SkiffError::NotFound {
                reference: descriptor.digest.clone(),
                message: format!("no manifest for architectures {:?}", self.architectures),
            })
    }
}

#[async_trait]
impl Remote for LayoutSource {
    async fn resolve(&self, reference: &ImageReference) -> Result<Descriptor> {
        self.find(&reference.reference, reference)
            .await?
            .ok_or_else(|| SkiffError::NotFound {
                reference: reference.reference.clone(),
                message: format!("not present in layout {}", self.layout.root().display()),
            })
    }

    async fn fetch_manifest(
        &self,
        _reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>> {
        self.layout.read_blob(&descriptor.digest).await
    }

    async fn fetch_blob(
        &self,
        _reference: &ImageReference,
        descriptor: &Descriptor,
        writer: &mut BlobWriter<'_>,
    ) -> Result<u64> {
        let mut file = self.layout.open_blob(&descriptor.digest).await?;
        let copied = tokio::io::copy(&mut file, writer).await?;
        Ok(copied)
    }

    async fn blob_exists(
        &self,
        _reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<bool> {
        self.layout.has_blob(descriptor).await
    }

    async fn push_blob(
        &self,
        _reference: &ImageReference,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor> {
        let descriptor = Descriptor::from_bytes(media_type, data);
        self.layout.write_blob_bytes(&descriptor, data).await?;
        Ok(descriptor)
    }

    async fn push_blob_from(
        &self,
        _reference: &ImageReference,
        descriptor: &Descriptor,
        reader: &mut BlobReader<'_>,
    ) -> Result<Descriptor> {
        self.layout
            .write_blob(descriptor, reader, &CancelToken::never())
            .await?;
        Ok(descriptor.clone())
    }

    async fn push_manifest(
        &self,
        reference: &ImageReference,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor> {
        let descriptor = Descriptor::from_bytes(media_type, data);
        self.layout.write_blob_bytes(&descriptor, data).await?;
        self.layout
            .add_manifest(
                descriptor
                    .clone()
                    .with_annotation(ANNOTATION_BASE_IMAGE_NAME, reference.reference.clone()),
            )
            .await?;
        Ok(descriptor)
    }
}

// ============================================================================
// Docker daemon
// ============================================================================

/// Local image daemon used as the last-resort source.
#[async_trait]
pub trait ImageDaemon: Send + Sync {
    /// Uncompressed image size in bytes.
    async fn image_size(&self, reference: &str) -> Result<u64>;

    /// Export the image as a `docker save` archive at `dest`.
    async fn save(&self, reference: &str, dest: &Path) -> Result<()>;
}

/// [`ImageDaemon`] driving the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("docker"),
        }
    }
}

impl DockerCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.stdin(std::process::Stdio::null());
        cmd
    }

    async fn run(&self, mut cmd: tokio::process::Command, reference: &str) -> Result<String> {
        let output = cmd.output().await.map_err(|e| {
            SkiffError::OciImageError(format!(
                "docker not available ({}): {}",
                self.program.display(),
                e
            ))
        })?;

        if !output.status.success() {
            return Err(SkiffError::NotFound {
                reference: reference.to_string(),
                message: format!(
                    "docker daemon: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ImageDaemon for DockerCli {
    async fn image_size(&self, reference: &str) -> Result<u64> {
        let mut cmd = self.command();
        cmd.args(["image", "inspect", "--format", "{{.Size}}", reference]);
        let out = self.run(cmd, reference).await?;
        out.parse::<u64>().map_err(|e| {
            SkiffError::OciImageError(format!("Unexpected docker image size '{}': {}", out, e))
        })
    }

    async fn save(&self, reference: &str, dest: &Path) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("save").arg("-o").arg(dest).arg(reference);
        self.run(cmd, reference).await?;
        Ok(())
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Locates requested images across the supported sources.
pub struct SourceResolver {
    remote: Arc<dyn Remote>,
    local_layout: Option<Arc<LayoutSource>>,
    daemon: Option<Arc<dyn ImageDaemon>>,
    overrides: BTreeMap<String, String>,
    architectures: Vec<String>,
    large_image_threshold: u64,
    scratch: Mutex<Vec<TempDir>>,
}

impl SourceResolver {
    /// Build a resolver over `remote`, opening the configured local layout.
    /// The Docker CLI is the default daemon fallback.
    pub fn new(remote: Arc<dyn Remote>, config: &TransferConfig) -> Result<Self> {
        let local_layout = match &config.local_layout {
            Some(path) => Some(Arc::new(LayoutSource::new(
                Arc::new(OciLayout::open(path)?),
                config.architectures.clone(),
            ))),
            None => None,
        };
        Ok(Self {
            remote,
            local_layout,
            daemon: Some(Arc::new(DockerCli::default())),
            overrides: config.registry_overrides.clone(),
            architectures: config.architectures.clone(),
            large_image_threshold: config.large_image_threshold,
            scratch: Mutex::new(Vec::new()),
        })
    }

    pub fn with_daemon(mut self, daemon: Option<Arc<dyn ImageDaemon>>) -> Self {
        self.daemon = daemon;
        self
    }

    /// Apply the registry override map to a reference's host.
    pub fn apply_overrides(&self, reference: &ImageReference) -> Result<ImageReference> {
        match self.overrides.get(&reference.host) {
            Some(target) => {
                let rewritten = reference.transform_host_without_checksum(target)?;
                tracing::debug!(
                    from = %reference.reference,
                    to = %rewritten.reference,
                    "Applied registry override"
                );
                Ok(rewritten)
            }
            None => Ok(reference.clone()),
        }
    }

    /// Locate one requested image.
    pub async fn resolve(&self, requested: &str, progress: &ProgressHandle) -> Result<ImageSource> {
        if is_tarball_path(requested) {
            progress.update_title(&format!("Reading image tarball: {}", requested));
            return self.load_archive(Path::new(requested), SourceKind::Tarball).await;
        }

        let parsed = ImageReference::parse(requested)?;
        let actual = self.apply_overrides(&parsed)?;

        if let Some(local) = &self.local_layout {
            if let Some(descriptor) = local.find(requested, &actual).await? {
                tracing::debug!(reference = %requested, digest = %descriptor.digest, "Found in local layout");
                return Ok(ImageSource {
                    kind: SourceKind::Layout,
                    name: requested.to_string(),
                    reference: actual,
                    descriptor,
                    remote: local.clone(),
                });
            }
        }

        match self.remote.resolve(&actual).await {
            Ok(descriptor) => Ok(ImageSource {
                kind: SourceKind::Registry,
                name: requested.to_string(),
                reference: actual,
                descriptor,
                remote: self.remote.clone(),
            }),
            Err(e @ SkiffError::Auth { .. }) | Err(e @ SkiffError::Cancelled) => Err(e),
            Err(remote_err) => {
                let Some(daemon) = &self.daemon else {
                    return Err(remote_err);
                };
                tracing::debug!(
                    reference = %actual.reference,
                    error = %remote_err,
                    "Registry lookup failed, trying docker daemon"
                );
                progress.update_title(&format!(
                    "Falling back to docker for {}. This may take some time.",
                    actual.reference
                ));
                match self.load_from_daemon(daemon.as_ref(), requested, &actual, progress).await {
                    Ok(source) => Ok(source),
                    Err(daemon_err) => {
                        tracing::debug!(
                            reference = %actual.reference,
                            error = %daemon_err,
                            "Docker daemon fallback failed"
                        );
                        Err(remote_err)
                    }
                }
            }
        }
    }

    async fn load_from_daemon(
        &self,
        daemon: &dyn ImageDaemon,
        requested: &str,
        reference: &ImageReference,
        progress: &ProgressHandle,
    ) -> Result<ImageSource> {
        let size = daemon.image_size(&reference.reference).await?;
        if size > self.large_image_threshold {
            progress.warn(&format!(
                "{} is {} and may take a very long time to load via docker",
                reference.reference,
                format_size(size)
            ));
        }

        let scratch = self.scratch_dir()?;
        let archive = scratch.join("image.tar");
        daemon.save(&reference.reference, &archive).await?;

        let mut source = self.load_archive(&archive, SourceKind::Daemon).await?;
        source.name = requested.to_string();
        Ok(source)
    }

    /// Unpack an archive into scratch space and serve it as a layout.
    async fn load_archive(&self, archive: &Path, kind: SourceKind) -> Result<ImageSource> {
        let unpacked = self.scratch_dir()?;
        let src = archive.to_path_buf();
        let dest = unpacked.clone();
        tokio::task::spawn_blocking(move || unpack_archive(&src, &dest))
            .await
            .map_err(|e| SkiffError::Other(format!("Archive unpack task failed: {}", e)))??;

        let (layout, name) = open_archive_layout(&unpacked).await?;
        let name = name.ok_or_else(|| SkiffError::NotFound {
            reference: archive.display().to_string(),
            message: "archive does not name an image".to_string(),
        })?;
        let reference = ImageReference::parse(&name)?;

        let source = Arc::new(LayoutSource::new(Arc::new(layout), self.architectures.clone()));
        let descriptor = match source.find(&name, &reference).await? {
            Some(desc) => desc,
            None => {
                let index = source.layout().read_index().await?;
                let first = index.manifests.into_iter().next().ok_or_else(|| {
                    SkiffError::NotFound {
                        reference: archive.display().to_string(),
                        message: "archive holds no images".to_string(),
                    }
                })?;
                source.select_image(first).await?
            }
        };

        tracing::info!(
            archive = %archive.display(),
            reference = %name,
            digest = %descriptor.digest,
            source = %kind,
            "Loaded image archive"
        );
        Ok(ImageSource {
            kind,
            name,
            reference,
            descriptor,
            remote: source,
        })
    }

    fn scratch_dir(&self) -> Result<PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix("skiff-source-")
            .tempdir()
            .map_err(|e| SkiffError::Other(format!("Failed to create scratch directory: {}", e)))?;
        let path = dir.path().to_path_buf();
        self.scratch.lock().push(dir);
        Ok(path)
    }
}

/// Extract a (possibly gzipped) tar archive.
fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    let mut magic = [0u8; 2];
    let gzipped = {
        let mut file = std::fs::File::open(archive).map_err(|e| {
            SkiffError::OciImageError(format!(
                "Failed to open archive {}: {}",
                archive.display(),
                e
            ))
        })?;
        file.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b]
    };

    let file = std::fs::File::open(archive)?;
    let result = if gzipped {
        tar::Archive::new(flate2::read::GzDecoder::new(file)).unpack(dest)
    } else {
        tar::Archive::new(file).unpack(dest)
    };
    result.map_err(|e| {
        SkiffError::OciImageError(format!(
            "Failed to extract archive {}: {}",
            archive.display(),
            e
        ))
    })
}

/// Entry of a `docker save` `manifest.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerArchiveEntry {
    config: String,
    #[serde(default)]
    repo_tags: Vec<String>,
    layers: Vec<String>,
}

/// Open an unpacked archive as an OCI layout, converting `docker save`
/// output when needed. Also returns the image name the archive carries.
async fn open_archive_layout(dir: &Path) -> Result<(OciLayout, Option<String>)> {
    if dir.join("oci-layout").is_file() {
        let layout = OciLayout::open(dir)?;
        let name = layout
            .read_index()
            .await?
            .manifests
            .iter()
            .find_map(archive_image_name);
        return Ok((layout, name));
    }

    let manifest_path = dir.join("manifest.json");
    if !manifest_path.is_file() {
        return Err(SkiffError::OciImageError(format!(
            "{} is neither an OCI archive nor a docker archive",
            dir.display()
        )));
    }
    let entries: Vec<DockerArchiveEntry> =
        serde_json::from_slice(&tokio::fs::read(&manifest_path).await?)?;
    let entry = entries.into_iter().next().ok_or_else(|| {
        SkiffError::OciImageError("docker archive manifest.json is empty".to_string())
    })?;

    let layout = OciLayout::open(dir.join("oci"))?;
    let name = convert_docker_entry(&layout, dir, &entry).await?;
    Ok((layout, name))
}

/// Name of an archived image from its index annotations. Bare tags in
/// `ref.name` do not identify an image and are ignored.
fn archive_image_name(entry: &Descriptor) -> Option<String> {
    entry
        .annotations
        .get(ANNOTATION_BASE_IMAGE_NAME)
        .or_else(|| entry.annotations.get(ANNOTATION_CONTAINERD_IMAGE_NAME))
        .cloned()
        .or_else(|| {
            entry
                .annotations
                .get(ANNOTATION_REF_NAME)
                .filter(|name| name.contains(':') || name.contains('/'))
                .cloned()
        })
}

/// Re-home a `docker save` image as an OCI manifest in `layout`.
async fn convert_docker_entry(
    layout: &OciLayout,
    dir: &Path,
    entry: &DockerArchiveEntry,
) -> Result<Option<String>> {
    let config = import_file(layout, &dir.join(&entry.config), Some(OCI_CONFIG_MEDIA_TYPE)).await?;
    let mut layers = Vec::with_capacity(entry.layers.len());
    for layer in &entry.layers {
        layers.push(import_file(layout, &dir.join(layer), None).await?);
    }

    let manifest = Manifest {
        schema_version: 2,
        media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_string()),
        config,
        layers,
        annotations: Default::default(),
    };
    let raw = serde_json::to_vec(&manifest)?;
    let mut descriptor = Descriptor::from_bytes(OCI_MANIFEST_MEDIA_TYPE, &raw);
    layout.write_blob_bytes(&descriptor, &raw).await?;

    let name = entry.repo_tags.first().cloned();
    if let Some(ref name) = name {
        descriptor = descriptor.with_annotation(ANNOTATION_BASE_IMAGE_NAME, name.clone());
    }
    layout.add_manifest(descriptor).await?;
    Ok(name)
}

/// Copy a file into the layout, sniffing gzip for layers.
async fn import_file(layout: &OciLayout, path: &Path, media_type: Option<&str>) -> Result<Descriptor> {
    let owned = path.to_path_buf();
    let (digest, size, gzipped) = tokio::task::spawn_blocking(move || hash_file(&owned))
        .await
        .map_err(|e| SkiffError::Other(format!("Hash task failed: {}", e)))??;

    let media_type = media_type.unwrap_or(if gzipped {
        OCI_LAYER_GZIP_MEDIA_TYPE
    } else {
        OCI_LAYER_TAR_MEDIA_TYPE
    });
    let descriptor = Descriptor::new(media_type, digest, size as i64);
    let file = tokio::fs::File::open(path).await?;
    layout
        .write_blob(&descriptor, file, &CancelToken::never())
        .await?;
    Ok(descriptor)
}

fn hash_file(path: &Path) -> Result<(String, u64, bool)> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        SkiffError::OciImageError(format!("Failed to open {}: {}", path.display(), e))
    })?;
    let mut magic = [0u8; 2];
    let gzipped = file.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b];

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let size = std::io::copy(&mut file, &mut hasher)?;
    Ok((format!("sha256:{}", hex::encode(hasher.finalize())), size, gzipped))
}

/// Format a byte size as a human-readable string.
fn format_size(bytes: u64) -> String {
    if bytes >= 1000 * 1000 * 1000 {
        format!("{:.2} GB", bytes as f64 / 1e9)
    } else if bytes >= 1000 * 1000 {
        format!("{:.2} MB", bytes as f64 / 1e6)
    } else {
        format!("{} B", bytes)
    }
}
