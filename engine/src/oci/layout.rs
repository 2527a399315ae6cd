//! On-disk OCI image layout.
//!
//! ```text
//! root/
//! ├── oci-layout           (layout marker)
//! ├── index.json           (image index)
//! ├── references.json      (reference → manifest digest)
//! └── blobs/
//!     └── sha256/
//!         └── <hex>        (manifests, configs, layers)
//! ```
//!
//! Blobs are immutable once renamed into place. Every write streams into a
//! uniquely named temp file beside its final path and is renamed only after
//! the byte count matches the declared size, so readers never observe a
//! partial blob and concurrent writers of one digest never interfere.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use skiff_core::descriptor::{
    split_digest, Descriptor, ImageIndex, Manifest, ANNOTATION_BASE_IMAGE_NAME,
};
use skiff_core::error::{Result, SkiffError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::transfer::CancelToken;

const OCI_LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
/// Reference → digest map written beside the index.
pub const REFERENCES_FILE: &str = "references.json";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const TEMP_SUFFIX: &str = ".tmp";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of a blob write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobWrite {
    /// A size-matching blob was already present
    Existing,
    /// The blob was written with this many bytes
    Written(u64),
}

/// Content-addressable OCI layout directory.
pub struct OciLayout {
    root: PathBuf,
    index_lock: Mutex<()>,
}

impl OciLayout {
    /// Open a layout, creating its skeleton when missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("blobs").join("sha256")).map_err(|e| {
            SkiffError::OciImageError(format!(
                "Failed to create OCI layout {}: {}",
                root.display(),
                e
            ))
        })?;

        let layout_file = root.join(OCI_LAYOUT_FILE);
        if !layout_file.exists() {
            std::fs::write(&layout_file, OCI_LAYOUT_CONTENT)?;
        }
        let index_file = root.join(INDEX_FILE);
        if !index_file.exists() {
            std::fs::write(&index_file, serde_json::to_vec_pretty(&ImageIndex::new())?)?;
        }

        Ok(Self {
            root,
            index_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final path of a blob: `blobs/<algorithm>/<hex>`.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let (algorithm, hex) = split_digest(digest)?;
        Ok(self.root.join("blobs").join(algorithm).join(hex))
    }

    /// Whether a blob exists with the declared size (any size when unknown).
    pub async fn has_blob(&self, descriptor: &Descriptor) -> Result<bool> {
        let path = self.blob_path(&descriptor.digest)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(match descriptor.known_size() {
                Some(expected) => meta.is_file() && meta.len() == expected,
                None => meta.is_file(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Stream a blob into the layout.
    ///
    /// Skips when a size-matching blob is already present. Otherwise the
    /// reader is drained into a temp file, checking `cancel` before every
    /// read, and renamed into place once the byte count and digest match.
    /// Short or long writes fail with `Integrity` and leave nothing behind.
    pub async fn write_blob<R>(
        &self,
        descriptor: &Descriptor,
        mut reader: R,
        cancel: &CancelToken,
    ) -> Result<BlobWrite>
    where
        R: AsyncRead + Unpin + Send,
    {
        if self.has_blob(descriptor).await? {
            return Ok(BlobWrite::Existing);
        }

        let final_path = self.blob_path(&descriptor.digest)?;
        let (algorithm, hex) = split_digest(&descriptor.digest)?;
        let dir = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.join("blobs").join(algorithm));
        tokio::fs::create_dir_all(&dir).await?;
        let temp_path = dir.join(format!(".{}.{}{}", hex, uuid::Uuid::new_v4(), TEMP_SUFFIX));

        let result = self
            .stream_to_temp(descriptor, &mut reader, &temp_path, cancel)
            .await;
        let written = match result {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(SkiffError::TransientIo(format!(
                "Failed to rename {} -> {}: {}",
                temp_path.display(),
                final_path.display(),
                e
            )));
        }

        tracing::debug!(digest = %descriptor.digest, bytes = written, "Blob written");
        Ok(BlobWrite::Written(written))
    }

    async fn stream_to_temp<R>(
        &self,
        descriptor: &Descriptor,
        reader: &mut R,
        temp_path: &Path,
        cancel: &CancelToken,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let expected = descriptor.known_size();
        let verify_digest = descriptor.digest.starts_with("sha256:");
        let mut hasher = Sha256::new();
        let mut file = tokio::fs::File::create(temp_path).await?;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut written: u64 = 0;

        loop {
            cancel.check()?;
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            written += n as u64;
            if let Some(expected) = expected {
                if written > expected {
                    return Err(SkiffError::Integrity {
                        digest: descriptor.digest.clone(),
                        expected: descriptor.size,
                        actual: written,
                    });
                }
            }
            if verify_digest {
                hasher.update(&buf[..n]);
            }
            file.write_all(&buf[..n]).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = expected {
            if written != expected {
                return Err(SkiffError::Integrity {
                    digest: descriptor.digest.clone(),
                    expected: descriptor.size,
                    actual: written,
                });
            }
        }
        if verify_digest {
            let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
            if actual != descriptor.digest {
                return Err(SkiffError::TransientIo(format!(
                    "Digest mismatch: expected {}, got {}",
                    descriptor.digest, actual
                )));
            }
        }
        Ok(written)
    }

    /// Write an in-memory blob.
    pub async fn write_blob_bytes(&self, descriptor: &Descriptor, data: &[u8]) -> Result<BlobWrite> {
        self.write_blob(descriptor, data, &CancelToken::never()).await
    }

    /// Read a whole blob into memory.
    pub async fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        tokio::fs::read(&path).await.map_err(|e| blob_error(digest, e))
    }

    /// Open a blob for streaming.
    pub async fn open_blob(&self, digest: &str) -> Result<tokio::fs::File> {
        let path = self.blob_path(digest)?;
        tokio::fs::File::open(&path)
            .await
            .map_err(|e| blob_error(digest, e))
    }

    /// Read and parse an image manifest blob.
    pub async fn read_manifest(&self, descriptor: &Descriptor) -> Result<Manifest> {
        Manifest::from_slice(&self.read_blob(&descriptor.digest).await?)
    }

    /// Current image index.
    pub async fn read_index(&self) -> Result<ImageIndex> {
        let data = tokio::fs::read(self.root.join(INDEX_FILE)).await?;
        ImageIndex::from_slice(&data)
    }

    /// Add a manifest to the index, merging annotations when its digest is
    /// already listed.
    pub async fn add_manifest(&self, descriptor: Descriptor) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        match index
            .manifests
            .iter_mut()
            .find(|entry| entry.digest == descriptor.digest)
        {
            Some(existing) => existing.annotations.extend(descriptor.annotations),
            None => index.manifests.push(descriptor),
        }
        self.write_json_atomic(INDEX_FILE, &index).await
    }

    /// Record reference → digest mappings.
    ///
    /// Each index entry whose digest is mapped gains the base image name
    /// annotation, and the full map is merged into `references.json`.
    pub async fn annotate_references(&self, references: &BTreeMap<String, String>) -> Result<()> {
        let _guard = self.index_lock.lock().await;

        let mut index = self.read_index().await?;
        for (reference, digest) in references {
            for entry in index.manifests.iter_mut().filter(|e| &e.digest == digest) {
                entry
                    .annotations
                    .insert(ANNOTATION_BASE_IMAGE_NAME.to_string(), reference.clone());
            }
        }
        self.write_json_atomic(INDEX_FILE, &index).await?;

        let mut existing = self.read_references().await?;
        existing.extend(references.iter().map(|(r, d)| (r.clone(), d.clone())));
        self.write_json_atomic(REFERENCES_FILE, &existing).await
    }

    /// Reference → digest map from `references.json`.
    pub async fn read_references(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read(self.root.join(REFERENCES_FILE)).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Find the index entry for a reference, via `references.json` first and
    /// the base image name annotation second.
    pub async fn resolve_reference(&self, reference: &str) -> Result<Option<Descriptor>> {
        let index = self.read_index().await?;
        if let Some(digest) = self.read_references().await?.get(reference) {
            if let Some(entry) = index.manifests.iter().find(|e| &e.digest == digest) {
                return Ok(Some(entry.clone()));
            }
        }
        Ok(index
            .manifests
            .into_iter()
            .find(|e| {
                e.annotations
                    .get(ANNOTATION_BASE_IMAGE_NAME)
                    .is_some_and(|name| name == reference)
            }))
    }

    /// Digests of every complete blob, sorted.
    pub async fn list_blobs(&self) -> Result<Vec<String>> {
        let mut digests = Vec::new();
        let blobs = self.root.join("blobs");
        let mut algorithms = tokio::fs::read_dir(&blobs).await?;
        while let Some(algorithm) = algorithms.next_entry().await? {
            if !algorithm.file_type().await?.is_dir() {
                continue;
            }
            let algorithm_name = algorithm.file_name().to_string_lossy().to_string();
            let mut entries = tokio::fs::read_dir(algorithm.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') || !entry.file_type().await?.is_file() {
                    continue;
                }
                digests.push(format!("{}:{}", algorithm_name, name));
            }
        }
        digests.sort();
        Ok(digests)
    }

    /// Delete temp files left behind by interrupted writes.
    ///
    /// Only files unmodified for at least `min_age` are removed; younger ones
    /// may belong to a writer in another pipeline sharing this layout.
    pub async fn remove_stale_temp_files(&self, min_age: Duration) -> Result<usize> {
        let mut removed = 0;
        let now = SystemTime::now();
        let mut algorithms = tokio::fs::read_dir(self.root.join("blobs")).await?;
        while let Some(algorithm) = algorithms.next_entry().await? {
            if !algorithm.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(algorithm.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if !(name.starts_with('.') && name.ends_with(TEMP_SUFFIX)) {
                    continue;
                }
                let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                    Ok(modified) => modified,
                    // Renamed or swept by another writer since read_dir
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
                if age < min_age {
                    tracing::debug!(file = %name, ?age, "Keeping in-flight temp file");
                    continue;
                }
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, root = %self.root.display(), "Removed stale temp files");
        }
        Ok(removed)
    }

    async fn write_json_atomic<T: serde::Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.root.join(name);
        let tmp = self.root.join(format!(".{}.{}{}", name, uuid::Uuid::new_v4(), TEMP_SUFFIX));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

fn blob_error(digest: &str, e: std::io::Error) -> SkiffError {
    if e.kind() == std::io::ErrorKind::NotFound {
        SkiffError::NotFound {
            reference: digest.to_string(),
            message: "blob not present in layout".to_string(),
        }
    } else {
        SkiffError::IoError(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::CancelSwitch;
    use skiff_core::descriptor::{OCI_LAYER_GZIP_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE, UNKNOWN_SIZE};
    use tempfile::TempDir;

    fn layer(data: &[u8]) -> Descriptor {
        Descriptor::from_bytes(OCI_LAYER_GZIP_MEDIA_TYPE, data)
    }

    #[test]
    fn test_open_creates_skeleton() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open(dir.path()).unwrap();
        assert!(dir.path().join("oci-layout").exists());
        assert!(dir.path().join("index.json").exists());
        assert!(dir.path().join("blobs/sha256").is_dir());
        assert_eq!(layout.root(), dir.path());
    }

    #[test]
    fn test_blob_path() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open(dir.path()).unwrap();
        assert_eq!(
            layout.blob_path("sha256:abc123").unwrap(),
            dir.path().join("blobs/sha256/abc123")
        );
        assert!(layout.blob_path("not-a-digest").is_err());
    }

    #[tokio::test]
    async fn test_write_then_skip() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open(dir.path()).unwrap();
        let desc = layer(b"layer contents");

        assert!(!layout.has_blob(&desc).await.unwrap());
        let first = layout.write_blob_bytes(&desc, b"layer contents").await.unwrap();
        assert_eq!(first, BlobWrite::Written(14));
        assert!(layout.has_blob(&desc).await.unwrap());

        let second = layout.write_blob_bytes(&desc, b"layer contents").await.unwrap();
        assert_eq!(second, BlobWrite::Existing);
        assert_eq!(layout.read_blob(&desc.digest).await.unwrap(), b"layer contents");
    }

    #[tokio::test]
    async fn test_short_write_is_integrity_error() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open(dir.path()).unwrap();
        let desc = layer(b"full contents");

        let result = layout.write_blob_bytes(&desc, b"full").await;
        assert!(matches!(
            result,
            Err(SkiffError::Integrity { expected: 13, actual: 4, .. })
        ));
        assert!(!layout.blob_path(&desc.digest).unwrap().exists());
        assert!(layout.list_blobs().await.unwrap().is_empty());
        assert_eq!(layout.remove_stale_temp_files(Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_long_write_is_integrity_error() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open(dir.path()).unwrap();
        let desc = layer(b"abc");

        let result = layout.write_blob_bytes(&desc, b"abcdef").await;
        assert!(matches!(result, Err(SkiffError::Integrity { .. })));
        assert!(!layout.has_blob(&desc).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_size_accepts_any_length() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open(dir.path()).unwrap();
        let mut desc = layer(b"streamed");
        desc.size = UNKNOWN_SIZE;

        let written = layout.write_blob_bytes(&desc, b"streamed").await.unwrap();
        assert_eq!(written, BlobWrite::Written(8));
        assert!(layout.has_blob(&desc).await.unwrap());
    }

    #[tokio::test]
    async fn test_digest_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open(dir.path()).unwrap();
        let desc = layer(b"aaaa");

        let result = layout.write_blob_bytes(&desc, b"bbbb").await;
        assert!(matches!(result, Err(SkiffError::TransientIo(_))));
        assert!(!layout.has_blob(&desc).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_write_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open(dir.path()).unwrap();
        let desc = layer(b"contents");
        let switch = CancelSwitch::new();
        switch.cancel();

        let result = layout
            .write_blob(&desc, &b"contents"[..], &switch.token())
            .await;
        assert!(matches!(result, Err(SkiffError::Cancelled)));
        assert!(!layout.has_blob(&desc).await.unwrap());
        assert_eq!(layout.remove_stale_temp_files(Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_writers_same_digest() {
        let dir = TempDir::new().unwrap();
        let layout = std::sync::Arc::new(OciLayout::open(dir.path()).unwrap());
        let data = vec![7u8; 256 * 1024];
        let desc = layer(&data);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let layout = layout.clone();
            let desc = desc.clone();
            let data = data.clone();
            handles.push(tokio::spawn(async move {
                layout.write_blob_bytes(&desc, &data).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(layout.list_blobs().await.unwrap(), vec![desc.digest.clone()]);
        assert_eq!(layout.read_blob(&desc.digest).await.unwrap(), data);
    }

    fn age_file(path: &Path, by: Duration) {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - by)
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_temp_files_removed() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open(dir.path()).unwrap();
        let stale = dir.path().join("blobs/sha256/.abc.1234.tmp");
        std::fs::write(&stale, b"partial").unwrap();
        age_file(&stale, Duration::from_secs(7200));

        assert!(layout.list_blobs().await.unwrap().is_empty());
        assert_eq!(
            layout.remove_stale_temp_files(Duration::from_secs(3600)).await.unwrap(),
            1
        );
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_sweep_spares_in_flight_write() {
        let dir = TempDir::new().unwrap();
        let layout = std::sync::Arc::new(OciLayout::open(dir.path()).unwrap());
        let data = vec![3u8; 64 * 1024];
        let desc = layer(&data);

        // Writer stalls halfway through the blob
        let (mut tx, rx) = tokio::io::duplex(1024);
        let writer = {
            let layout = layout.clone();
            let desc = desc.clone();
            tokio::spawn(async move { layout.write_blob(&desc, rx, &CancelToken::never()).await })
        };
        tx.write_all(&data[..32 * 1024]).await.unwrap();
        let temp_exists = || {
            std::fs::read_dir(dir.path().join("blobs/sha256"))
                .unwrap()
                .any(|e| e.unwrap().file_name().to_string_lossy().ends_with(".tmp"))
        };
        for _ in 0..100 {
            if temp_exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(temp_exists());

        // A second pipeline starting on the same layout
        assert_eq!(
            layout.remove_stale_temp_files(Duration::from_secs(3600)).await.unwrap(),
            0
        );

        tx.write_all(&data[32 * 1024..]).await.unwrap();
        drop(tx);
        assert_eq!(writer.await.unwrap().unwrap(), BlobWrite::Written(data.len() as u64));
        assert_eq!(layout.read_blob(&desc.digest).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_read_missing_blob_is_not_found() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open(dir.path()).unwrap();
        let result = layout.read_blob("sha256:0000").await;
        assert!(matches!(result, Err(SkiffError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_add_manifest_dedupes_and_merges() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open(dir.path()).unwrap();
        let desc = Descriptor::new(OCI_MANIFEST_MEDIA_TYPE, "sha256:aa", 10);

        layout.add_manifest(desc.clone()).await.unwrap();
        layout
            .add_manifest(desc.clone().with_annotation("k", "v"))
            .await
            .unwrap();

        let index = layout.read_index().await.unwrap();
        assert_eq!(index.manifests.len(), 1);
        assert_eq!(index.manifests[0].annotations.get("k").unwrap(), "v");
    }

    #[tokio::test]
    async fn test_annotate_and_resolve_references() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open(dir.path()).unwrap();
        layout
            .add_manifest(Descriptor::new(OCI_MANIFEST_MEDIA_TYPE, "sha256:aa", 10))
            .await
            .unwrap();
        layout
            .add_manifest(Descriptor::new(OCI_MANIFEST_MEDIA_TYPE, "sha256:bb", 20))
            .await
            .unwrap();

        let mut refs = BTreeMap::new();
        refs.insert("nginx:1.25".to_string(), "sha256:aa".to_string());
        refs.insert("ghcr.io/org/app:v1".to_string(), "sha256:bb".to_string());
        layout.annotate_references(&refs).await.unwrap();

        let index = layout.read_index().await.unwrap();
        assert_eq!(
            index.manifests[0].annotations.get(ANNOTATION_BASE_IMAGE_NAME).unwrap(),
            "nginx:1.25"
        );
        assert_eq!(layout.read_references().await.unwrap(), refs);

        let resolved = layout.resolve_reference("ghcr.io/org/app:v1").await.unwrap();
        assert_eq!(resolved.unwrap().digest, "sha256:bb");
        assert!(layout.resolve_reference("missing:v1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_reference_from_annotation_only() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open(dir.path()).unwrap();
        layout
            .add_manifest(
                Descriptor::new(OCI_MANIFEST_MEDIA_TYPE, "sha256:cc", 5)
                    .with_annotation(ANNOTATION_BASE_IMAGE_NAME, "busybox:1.36"),
            )
            .await
            .unwrap();

        let resolved = layout.resolve_reference("busybox:1.36").await.unwrap();
        assert_eq!(resolved.unwrap().digest, "sha256:cc");
    }
}
