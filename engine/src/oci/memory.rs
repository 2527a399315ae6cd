//! In-memory registry.
//!
//! A [`Remote`] that keeps blobs and manifests in process memory. Used to
//! stage images without a network and as the registry double in tests;
//! counters expose how many uploads actually happened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use skiff_core::descriptor::{
    is_index_media_type, sha256_digest, Descriptor, ImageIndex, Manifest, OCI_CONFIG_MEDIA_TYPE,
    OCI_LAYER_GZIP_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE,
};
use skiff_core::error::{Result, SkiffError};
use tokio::io::AsyncWriteExt;

use super::reference::ImageReference;
use super::remote::{BlobWriter, Remote};

#[derive(Clone)]
struct StoredContent {
    media_type: String,
    data: Vec<u8>,
}

#[derive(Default)]
struct State {
    blobs: HashMap<String, StoredContent>,
    /// Keyed by `host/path` then `:tag` or `@digest`
    manifests: HashMap<String, HashMap<String, StoredContent>>,
    /// Remaining injected fetch failures per digest
    failing_fetches: HashMap<String, usize>,
    /// Digests served truncated to this many bytes
    truncated: HashMap<String, usize>,
}

/// In-memory OCI registry.
pub struct MemoryRegistry {
    state: Mutex<State>,
    architectures: Vec<String>,
    blob_uploads: AtomicUsize,
    blob_fetches: AtomicUsize,
    manifest_uploads: AtomicUsize,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            architectures: vec![skiff_core::descriptor::host_architecture()],
            blob_uploads: AtomicUsize::new(0),
            blob_fetches: AtomicUsize::new(0),
            manifest_uploads: AtomicUsize::new(0),
        }
    }

    /// Number of blobs stored.
    pub fn blob_count(&self) -> usize {
        self.state.lock().blobs.len()
    }

    /// Number of blob uploads that wrote new content.
    pub fn blob_uploads(&self) -> usize {
        self.blob_uploads.load(Ordering::SeqCst)
    }

    /// Number of blob downloads served.
    pub fn blob_fetches(&self) -> usize {
        self.blob_fetches.load(Ordering::SeqCst)
    }

    /// Number of manifest uploads.
    pub fn manifest_uploads(&self) -> usize {
        self.manifest_uploads.load(Ordering::SeqCst)
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.state.lock().blobs.contains_key(digest)
    }

    /// Tags and digests stored for a repository (`host/path`).
    pub fn manifest_keys(&self, repository: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .manifests
            .get(repository)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Make the next `count` fetches of `digest` fail with a transient error.
    pub fn fail_fetches(&self, digest: &str, count: usize) {
        self.state
            .lock()
            .failing_fetches
            .insert(digest.to_string(), count);
    }

    /// Serve `digest` truncated to `len` bytes until cleared.
    pub fn truncate_blob(&self, digest: &str, len: usize) {
        self.state.lock().truncated.insert(digest.to_string(), len);
    }

    pub fn clear_truncation(&self, digest: &str) {
        self.state.lock().truncated.remove(digest);
    }

    /// Store an image built from a config and raw layer contents, tagged at
    /// `reference`. Returns the manifest descriptor.
    pub fn seed_image(
        &self,
        reference: &ImageReference,
        config: &[u8],
        layers: &[&[u8]],
    ) -> Result<Descriptor> {
        let mut state = self.state.lock();
        let config_desc = Descriptor::from_bytes(OCI_CONFIG_MEDIA_TYPE, config);
        state.blobs.insert(
            config_desc.digest.clone(),
            StoredContent {
                media_type: OCI_CONFIG_MEDIA_TYPE.to_string(),
                data: config.to_vec(),
            },
        );

        let mut layer_descs = Vec::with_capacity(layers.len());
        for layer in layers {
            let desc = Descriptor::from_bytes(OCI_LAYER_GZIP_MEDIA_TYPE, layer);
            state.blobs.insert(
                desc.digest.clone(),
                StoredContent {
                    media_type: OCI_LAYER_GZIP_MEDIA_TYPE.to_string(),
                    data: layer.to_vec(),
                },
            );
            layer_descs.push(desc);
        }

        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_string()),
            config: config_desc,
            layers: layer_descs,
            annotations: Default::default(),
        };
        let raw = serde_json::to_vec(&manifest)?;
        let desc = Descriptor::from_bytes(OCI_MANIFEST_MEDIA_TYPE, &raw);
        insert_manifest(&mut state, reference, OCI_MANIFEST_MEDIA_TYPE, raw);
        Ok(desc)
    }

    fn lookup_manifest(&self, reference: &ImageReference) -> Option<StoredContent> {
        let state = self.state.lock();
        state
            .manifests
            .get(&reference.name())
            .and_then(|m| m.get(&reference.tag_or_digest))
            .cloned()
    }
}

fn insert_manifest(
    state: &mut State,
    reference: &ImageReference,
    media_type: &str,
    data: Vec<u8>,
) {
    let digest = sha256_digest(&data);
    let content = StoredContent {
        media_type: media_type.to_string(),
        data,
    };
    let repo = state.manifests.entry(reference.name()).or_default();
    repo.insert(format!("@{}", digest), content.clone());
    repo.insert(reference.tag_or_digest.clone(), content);
}

#[async_trait]
impl Remote for MemoryRegistry {
    async fn resolve(&self, reference: &ImageReference) -> Result<Descriptor> {
        let content = self
            .lookup_manifest(reference)
            .ok_or_else(|| SkiffError::NotFound {
                reference: reference.reference.clone(),
                message: "manifest unknown".to_string(),
            })?;

        if is_index_media_type(&content.media_type) {
            let index = ImageIndex::from_slice(&content.data)?;
            return index
                .select_platform("linux", &self.architectures)
                .cloned()
                .ok_or_else(|| SkiffError::NotFound {
                    reference: reference.reference.clone(),
                    message: "no manifest for platform".to_string(),
                });
        }
        Ok(Descriptor::from_bytes(content.media_type, &content.data))
    }

    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>> {
        let state = self.state.lock();
        state
            .manifests
            .get(&reference.name())
            .and_then(|m| m.get(&format!("@{}", descriptor.digest)))
            .map(|c| c.data.clone())
            .ok_or_else(|| SkiffError::NotFound {
                reference: reference.reference.clone(),
                message: format!("manifest {} unknown", descriptor.digest),
            })
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        writer: &mut BlobWriter<'_>,
    ) -> Result<u64> {
        let data = {
            let mut state = self.state.lock();
            if let Some(remaining) = state.failing_fetches.get_mut(&descriptor.digest) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SkiffError::TransientIo(format!(
                        "injected failure fetching {}",
                        descriptor.digest
                    )));
                }
            }
            let content = state
                .blobs
                .get(&descriptor.digest)
                .ok_or_else(|| SkiffError::NotFound {
                    reference: reference.reference.clone(),
                    message: format!("blob {} unknown", descriptor.digest),
                })?;
            match state.truncated.get(&descriptor.digest) {
                Some(&len) => content.data[..len.min(content.data.len())].to_vec(),
                None => content.data.clone(),
            }
        };

        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(data.len() as u64)
    }

    async fn blob_exists(
        &self,
        _reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<bool> {
        Ok(self.has_blob(&descriptor.digest))
    }

    async fn push_blob(
        &self,
        _reference: &ImageReference,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor> {
        let descriptor = Descriptor::from_bytes(media_type, data);
        let mut state = self.state.lock();
        if !state.blobs.contains_key(&descriptor.digest) {
            state.blobs.insert(
                descriptor.digest.clone(),
                StoredContent {
                    media_type: media_type.to_string(),
                    data: data.to_vec(),
                },
            );
            self.blob_uploads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(descriptor)
    }

    async fn push_manifest(
        &self,
        reference: &ImageReference,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor> {
        let mut state = self.state.lock();
        insert_manifest(&mut state, reference, media_type, data.to_vec());
        self.manifest_uploads.fetch_add(1, Ordering::SeqCst);
        Ok(Descriptor::from_bytes(media_type, data))
    }
}
