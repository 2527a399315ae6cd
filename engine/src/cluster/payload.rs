//! Seed payload packaging.
//!
//! The seed layout travels into the cluster as a gzipped tarball split into
//! chunks small enough to fit a ConfigMap after base64 encoding. The helper
//! binary inside the injector pod concatenates the chunks in name order and
//! verifies the whole-payload checksum before serving the layout.

use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use skiff_core::error::{Result, SkiffError};

/// Raw chunk size that stays under the ~1 MiB object ceiling once encoded.
pub const DEFAULT_CHUNK_SIZE: usize = 768 * 1024;

/// Prefix of payload ConfigMap names.
pub const PAYLOAD_PREFIX: &str = "seed-payload";

/// One sequenced slice of the payload tarball.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadChunk {
    pub sequence_index: usize,
    pub bytes: Vec<u8>,
}

impl PayloadChunk {
    pub fn name(&self) -> String {
        chunk_name(self.sequence_index)
    }
}

/// `seed-payload-NNN`; lexical order matches sequence order below 1000 chunks.
pub fn chunk_name(index: usize) -> String {
    format!("{}-{:03}", PAYLOAD_PREFIX, index)
}

/// Archive the contents of `seed_dir` into a gzipped tarball at `dest`.
pub async fn create_payload_archive(seed_dir: &Path, dest: &Path) -> Result<()> {
    let seed_dir = seed_dir.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || write_archive(&seed_dir, &dest))
        .await
        .map_err(|e| SkiffError::Other(format!("Payload archive task failed: {}", e)))?
}

fn write_archive(seed_dir: &Path, dest: &Path) -> Result<()> {
    if !seed_dir.is_dir() {
        return Err(SkiffError::NotFound {
            reference: seed_dir.display().to_string(),
            message: "seed directory does not exist".to_string(),
        });
    }
    let file = std::fs::File::create(dest).map_err(|e| {
        SkiffError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to create payload {}: {}", dest.display(), e),
        ))
    })?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);

    let mut entries = std::fs::read_dir(seed_dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name();
        if entry.file_type()?.is_dir() {
            builder.append_dir_all(&name, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), &name)?;
        }
    }

    let encoder = builder.into_inner()?;
    let file = encoder.finish()?;
    file.sync_all()?;
    Ok(())
}

/// Split `path` into `chunk_size` pieces and checksum the whole file.
///
/// Returns the chunks in sequence order and the lowercase SHA-256 hex of the
/// unsplit file.
pub async fn split_file(path: &Path, chunk_size: usize) -> Result<(Vec<PayloadChunk>, String)> {
    if chunk_size == 0 {
        return Err(SkiffError::ConfigError(
            "Payload chunk size must be greater than zero".to_string(),
        ));
    }
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || split_blocking(&path, chunk_size))
        .await
        .map_err(|e| SkiffError::Other(format!("Payload split task failed: {}", e)))?
}

fn split_blocking(path: &Path, chunk_size: usize) -> Result<(Vec<PayloadChunk>, String)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut chunks = Vec::new();

    loop {
        let mut bytes = Vec::with_capacity(chunk_size);
        let read = (&mut file).take(chunk_size as u64).read_to_end(&mut bytes)?;
        if read == 0 {
            break;
        }
        hasher.update(&bytes);
        chunks.push(PayloadChunk {
            sequence_index: chunks.len(),
            bytes,
        });
        if read < chunk_size {
            break;
        }
    }

    Ok((chunks, hex::encode(hasher.finalize())))
}

/// Concatenate chunks in sequence order and verify the payload checksum.
pub fn reassemble(chunks: &[PayloadChunk], checksum: &str) -> Result<Vec<u8>> {
    let mut ordered: Vec<&PayloadChunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.sequence_index);

    for (expected, chunk) in ordered.iter().enumerate() {
        if chunk.sequence_index != expected {
            return Err(SkiffError::Other(format!(
                "Payload chunk {} missing or duplicated",
                chunk_name(expected)
            )));
        }
    }

    let mut payload = Vec::with_capacity(ordered.iter().map(|c| c.bytes.len()).sum());
    for chunk in ordered {
        payload.extend_from_slice(&chunk.bytes);
    }

    let actual = hex::encode(Sha256::digest(&payload));
    if !actual.eq_ignore_ascii_case(checksum) {
        return Err(SkiffError::Other(format!(
            "Payload checksum mismatch: expected {}, got {}",
            checksum, actual
        )));
    }
    Ok(payload)
}
