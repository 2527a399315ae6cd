//! OCI registry client.
//!
//! Implements [`Remote`] over the `oci-distribution` crate. Manifests are
//! fetched raw so their digests survive the round trip; manifest uploads,
//! chunked blob uploads and blob existence checks go through `reqwest` using
//! the bearer token the distribution client negotiated.

use std::collections::HashMap;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use skiff_core::descriptor::{
    is_index_media_type, sha256_digest, Descriptor, ImageIndex, DOCKER_MANIFEST_LIST_MEDIA_TYPE,
    DOCKER_MANIFEST_MEDIA_TYPE, OCI_INDEX_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE,
};
use skiff_core::error::{Result, SkiffError};
use tokio::io::AsyncReadExt;

use super::credentials::{CredentialStore, RegistryAuth};
use super::reference::ImageReference;
use super::remote::{BlobReader, BlobWriter, CountingWriter, Remote, RemoteOptions};

const MANIFEST_MEDIA_TYPES: &[&str] = &[
    OCI_MANIFEST_MEDIA_TYPE,
    DOCKER_MANIFEST_MEDIA_TYPE,
    OCI_INDEX_MEDIA_TYPE,
    DOCKER_MANIFEST_LIST_MEDIA_TYPE,
];

/// Bytes sent per PATCH of a chunked blob upload.
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Registry client backed by `oci-distribution`.
pub struct RegistryClient {
    client: Client,
    http: reqwest::Client,
    options: RegistryClientOptions,
    credentials: CredentialStore,
    /// Negotiated tokens keyed by operation and repository
    tokens: Mutex<HashMap<String, Option<String>>>,
}

struct RegistryClientOptions {
    plain_http: bool,
    auth: Option<RegistryAuth>,
    architectures: Vec<String>,
    os: String,
    upload_chunk_size: usize,
}

impl RegistryClient {
    /// Create a registry client.
    pub fn new(options: RemoteOptions) -> Result<Self> {
        let config = ClientConfig {
            protocol: if options.plain_http {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            accept_invalid_certificates: options.insecure_skip_verify,
            ..Default::default()
        };
        let client = Client::new(config);

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(options.insecure_skip_verify)
            .build()
            .map_err(|e| SkiffError::Other(format!("Failed to build HTTP client: {}", e)))?;

        let credentials = match options.credentials_path {
            Some(path) => CredentialStore::new(path),
            None => CredentialStore::default_path(),
        };

        Ok(Self {
            client,
            http,
            options: RegistryClientOptions {
                plain_http: options.plain_http,
                auth: options.auth,
                architectures: options.architectures,
                os: options.os,
                upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            },
            credentials,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Override the chunk size of streamed blob uploads.
    pub fn with_upload_chunk_size(mut self, size: usize) -> Self {
        self.options.upload_chunk_size = size.max(1);
        self
    }

    fn auth_for(&self, host: &str) -> RegistryAuth {
        match &self.options.auth {
            Some(auth) => auth.clone(),
            None => RegistryAuth::resolve(&self.credentials, host),
        }
    }

    fn oci_auth(&self, host: &str) -> OciRegistryAuth {
        match self.auth_for(host).basic_credentials() {
            Some((u, p)) => OciRegistryAuth::Basic(u.to_string(), p.to_string()),
            None => OciRegistryAuth::Anonymous,
        }
    }

    /// Authenticate once per repository and operation, caching the token.
    async fn ensure_auth(
        &self,
        reference: &ImageReference,
        oci_ref: &Reference,
        operation: RegistryOperation,
    ) -> Result<Option<String>> {
        let scope = match operation {
            RegistryOperation::Push => "push",
            RegistryOperation::Pull => "pull",
        };
        let key = format!("{}:{}", scope, reference.name());
        let cached = self.tokens.lock().get(&key).cloned();
        if let Some(token) = cached {
            return Ok(token);
        }

        let token = self
            .client
            .auth(oci_ref, &self.oci_auth(&reference.host), operation)
            .await
            .map_err(|e| map_oci_error(reference, "authenticate", e))?;
        self.tokens.lock().insert(key, token.clone());
        Ok(token)
    }

    fn scheme(&self) -> &'static str {
        if self.options.plain_http {
            "http"
        } else {
            "https"
        }
    }

    fn v2_url(&self, oci_ref: &Reference, kind: &str, target: &str) -> String {
        format!(
            "{}://{}/v2/{}/{}/{}",
            self.scheme(),
            oci_ref.resolve_registry(),
            oci_ref.repository(),
            kind,
            target
        )
    }

    fn authorize(
        &self,
        request: reqwest::RequestBuilder,
        host: &str,
        token: Option<String>,
    ) -> reqwest::RequestBuilder {
        match token {
            Some(token) => request.bearer_auth(token),
            None => match self.auth_for(host).basic_credentials() {
                Some((u, p)) => request.basic_auth(u, Some(p)),
                None => request,
            },
        }
    }

    /// Send a request, mapping non-success statuses to registry errors.
    async fn send_checked(
        &self,
        request: reqwest::RequestBuilder,
        reference: &ImageReference,
        what: &str,
    ) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| SkiffError::TransientIo(format!("{} failed: {}", what, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("{} returned {}: {}", what, status, body);
        Err(match status.as_u16() {
            401 | 403 => SkiffError::Auth {
                registry: reference.host.clone(),
                message,
            },
            _ => SkiffError::RegistryError {
                registry: reference.host.clone(),
                message,
            },
        })
    }

    /// Absolute URL of the upload session a response points at.
    fn upload_location(
        &self,
        oci_ref: &Reference,
        reference: &ImageReference,
        response: &reqwest::Response,
    ) -> Result<String> {
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| SkiffError::RegistryError {
                registry: reference.host.clone(),
                message: format!("Upload response from {} has no Location", response.url()),
            })?;
        if location.starts_with("http://") || location.starts_with("https://") {
            return Ok(location.to_string());
        }
        Ok(format!(
            "{}://{}/{}",
            self.scheme(),
            oci_ref.resolve_registry(),
            location.trim_start_matches('/')
        ))
    }

    /// Pick the index entry matching the configured platform.
    fn select_from_index(&self, reference: &ImageReference, raw: &[u8]) -> Result<Descriptor> {
        let index = ImageIndex::from_slice(raw)?;
        index
            .select_platform(&self.options.os, &self.options.architectures)
            .cloned()
            .ok_or_else(|| SkiffError::NotFound {
                reference: reference.reference.clone(),
                message: format!(
                    "no manifest for platform {}/{}",
                    self.options.os,
                    self.options.architectures.join(",")
                ),
            })
    }
}

#[async_trait]
impl Remote for RegistryClient {
    async fn resolve(&self, reference: &ImageReference) -> Result<Descriptor> {
        let oci_ref = to_oci_reference(reference)?;

        tracing::debug!(reference = %reference, "Resolving image reference");

        let (raw, _) = self
            .client
            .pull_manifest_raw(
                &oci_ref,
                &self.oci_auth(&reference.host),
                MANIFEST_MEDIA_TYPES,
            )
            .await
            .map_err(|e| map_oci_error(reference, "resolve", e))?;

        let media_type = manifest_media_type(&raw);
        if is_index_media_type(&media_type) {
            let selected = self.select_from_index(reference, &raw)?;
            tracing::debug!(
                reference = %reference,
                digest = %selected.digest,
                "Selected platform manifest from index"
            );
            return Ok(selected);
        }

        Ok(Descriptor::from_bytes(media_type, &raw))
    }

    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>> {
        let by_digest = Reference::with_digest(
            reference.host.clone(),
            reference.path.clone(),
            descriptor.digest.clone(),
        );
        let (raw, _) = self
            .client
            .pull_manifest_raw(
                &by_digest,
                &self.oci_auth(&reference.host),
                MANIFEST_MEDIA_TYPES,
            )
            .await
            .map_err(|e| map_oci_error(reference, "fetch manifest", e))?;

        let actual = sha256_digest(&raw);
        if actual != descriptor.digest {
            return Err(SkiffError::OciImageError(format!(
                "Manifest digest mismatch for {}: expected {}, got {}",
                reference, descriptor.digest, actual
            )));
        }
        Ok(raw)
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        writer: &mut BlobWriter<'_>,
    ) -> Result<u64> {
        let oci_ref = to_oci_reference(reference)?;
        self.ensure_auth(reference, &oci_ref, RegistryOperation::Pull)
            .await?;

        tracing::debug!(
            reference = %reference,
            digest = %descriptor.digest,
            size = descriptor.size,
            "Fetching blob"
        );

        let layer = to_oci_descriptor(descriptor);
        let mut counting = CountingWriter::new(writer);
        self.client
            .pull_blob(&oci_ref, &layer, &mut counting)
            .await
            .map_err(|e| map_oci_error(reference, "fetch blob", e))?;
        Ok(counting.written())
    }

    async fn blob_exists(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<bool> {
        let oci_ref = to_oci_reference(reference)?;
        let token = self
            .ensure_auth(reference, &oci_ref, RegistryOperation::Push)
            .await?;
        let url = self.v2_url(&oci_ref, "blobs", &descriptor.digest);

        let response = self
            .authorize(self.http.head(&url), &reference.host, token)
            .send()
            .await
            .map_err(|e| SkiffError::TransientIo(format!("HEAD {} failed: {}", url, e)))?;

        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            401 | 403 => Err(SkiffError::Auth {
                registry: reference.host.clone(),
                message: format!("HEAD {} returned {}", url, response.status()),
            }),
            code => Err(SkiffError::RegistryError {
                registry: reference.host.clone(),
                message: format!("HEAD {} returned {}", url, code),
            }),
        }
    }

    async fn push_blob(
        &self,
        reference: &ImageReference,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor> {
        let descriptor = Descriptor::from_bytes(media_type, data);
        if self.blob_exists(reference, &descriptor).await? {
            tracing::debug!(
                reference = %reference,
                digest = %descriptor.digest,
                "Blob already present, skipping upload"
            );
            return Ok(descriptor);
        }

        let oci_ref = to_oci_reference(reference)?;
        self.client
            .push_blob(&oci_ref, data, &descriptor.digest)
            .await
            .map_err(|e| map_oci_error(reference, "push blob", e))?;

        tracing::debug!(
            reference = %reference,
            digest = %descriptor.digest,
            size = descriptor.size,
            "Blob pushed"
        );
        Ok(descriptor)
    }

    /// Chunked upload: POST opens a session, each chunk is PATCHed to the
    /// latest Location, and a PUT with the digest commits it. At most one
    /// chunk is held in memory.
    async fn push_blob_from(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        reader: &mut BlobReader<'_>,
    ) -> Result<Descriptor> {
        if self.blob_exists(reference, descriptor).await? {
            tracing::debug!(
                reference = %reference,
                digest = %descriptor.digest,
                "Blob already present, skipping upload"
            );
            return Ok(descriptor.clone());
        }

        let oci_ref = to_oci_reference(reference)?;
        let token = self
            .ensure_auth(reference, &oci_ref, RegistryOperation::Push)
            .await?;
        let start = self.v2_url(&oci_ref, "blobs", "uploads/");
        let response = self
            .send_checked(
                self.authorize(self.http.post(&start), &reference.host, token.clone()),
                reference,
                &format!("POST {}", start),
            )
            .await?;
        let mut location = self.upload_location(&oci_ref, reference, &response)?;

        let mut hasher = Sha256::new();
        let mut offset: u64 = 0;
        let mut chunk = vec![0u8; self.options.upload_chunk_size];
        loop {
            let filled = read_chunk(reader, &mut chunk).await?;
            if filled == 0 {
                break;
            }
            hasher.update(&chunk[..filled]);
            let end = offset + filled as u64 - 1;
            let request = self
                .authorize(self.http.patch(&location), &reference.host, token.clone())
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .header(reqwest::header::CONTENT_RANGE, format!("{}-{}", offset, end))
                .body(chunk[..filled].to_vec());
            let response = self
                .send_checked(request, reference, &format!("PATCH {}", location))
                .await?;
            location = self.upload_location(&oci_ref, reference, &response)?;
            offset += filled as u64;
            if filled < chunk.len() {
                break;
            }
        }

        if let Some(expected) = descriptor.known_size() {
            if offset != expected {
                return Err(SkiffError::Integrity {
                    digest: descriptor.digest.clone(),
                    expected: descriptor.size,
                    actual: offset,
                });
            }
        }
        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        if actual != descriptor.digest {
            return Err(SkiffError::TransientIo(format!(
                "Digest mismatch: expected {}, got {}",
                descriptor.digest, actual
            )));
        }

        let separator = if location.contains('?') { '&' } else { '?' };
        let commit = format!("{}{}digest={}", location, separator, descriptor.digest);
        self.send_checked(
            self.authorize(self.http.put(&commit), &reference.host, token)
                .header(reqwest::header::CONTENT_LENGTH, 0),
            reference,
            &format!("PUT {}", commit),
        )
        .await?;

        tracing::debug!(
            reference = %reference,
            digest = %descriptor.digest,
            size = offset,
            "Blob pushed"
        );
        Ok(descriptor.clone())
    }

    async fn push_manifest(
        &self,
        reference: &ImageReference,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor> {
        let oci_ref = to_oci_reference(reference)?;
        let token = self
            .ensure_auth(reference, &oci_ref, RegistryOperation::Push)
            .await?;
        let target = match (&reference.digest, &reference.tag) {
            (Some(digest), _) => digest.clone(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => sha256_digest(data),
        };
        let url = self.v2_url(&oci_ref, "manifests", &target);

        let request = self
            .authorize(self.http.put(&url), &reference.host, token)
            .header(reqwest::header::CONTENT_TYPE, media_type)
            .body(data.to_vec());
        self.send_checked(request, reference, &format!("PUT {}", url))
            .await?;

        tracing::info!(reference = %reference, "Manifest pushed");
        Ok(Descriptor::from_bytes(media_type, data))
    }
}

/// Fill `buf` from `reader`, stopping early only at end of stream.
async fn read_chunk(reader: &mut BlobReader<'_>, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Convert an ImageReference to an oci-distribution Reference.
fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = reference.full_reference();
    ref_str.parse::<Reference>().map_err(|e| {
        SkiffError::OciImageError(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

fn to_oci_descriptor(descriptor: &Descriptor) -> OciDescriptor {
    OciDescriptor {
        media_type: descriptor.media_type.clone(),
        digest: descriptor.digest.clone(),
        size: descriptor.size,
        ..Default::default()
    }
}

/// The `mediaType` field of a raw manifest, sniffing `manifests` for
/// untyped indexes.
fn manifest_media_type(raw: &[u8]) -> String {
    let value: serde_json::Value = match serde_json::from_slice(raw) {
        Ok(v) => v,
        Err(_) => return OCI_MANIFEST_MEDIA_TYPE.to_string(),
    };
    if let Some(media_type) = value.get("mediaType").and_then(|m| m.as_str()) {
        return media_type.to_string();
    }
    if value.get("manifests").is_some() {
        OCI_INDEX_MEDIA_TYPE.to_string()
    } else {
        OCI_MANIFEST_MEDIA_TYPE.to_string()
    }
}

/// Map distribution-client failures onto the engine's error kinds.
fn map_oci_error(reference: &ImageReference, action: &str, err: OciDistributionError) -> SkiffError {
    let message = format!("Failed to {}: {}", action, err);
    match err {
        OciDistributionError::AuthenticationFailure(_)
        | OciDistributionError::UnauthorizedError { .. } => SkiffError::Auth {
            registry: reference.host.clone(),
            message,
        },
        OciDistributionError::ImageManifestNotFoundError(_) => SkiffError::NotFound {
            reference: reference.reference.clone(),
            message,
        },
        OciDistributionError::RequestError(_) => SkiffError::TransientIo(message),
        OciDistributionError::ServerError { code, .. } => match code {
            401 | 403 => SkiffError::Auth {
                registry: reference.host.clone(),
                message,
            },
            404 => SkiffError::NotFound {
                reference: reference.reference.clone(),
                message,
            },
            _ => SkiffError::RegistryError {
                registry: reference.host.clone(),
                message,
            },
        },
        _ => classify_message(reference, message),
    }
}

/// Fallback classification from registry error envelopes.
fn classify_message(reference: &ImageReference, message: String) -> SkiffError {
    let lower = message.to_lowercase();
    if lower.contains("manifest_unknown")
        || lower.contains("name_unknown")
        || lower.contains("blob_unknown")
        || lower.contains("not found")
    {
        SkiffError::NotFound {
            reference: reference.reference.clone(),
            message,
        }
    } else if lower.contains("unauthorized") || lower.contains("denied") {
        SkiffError::Auth {
            registry: reference.host.clone(),
            message,
        }
    } else {
        SkiffError::RegistryError {
            registry: reference.host.clone(),
            message,
        }
    }
}
