//! Skiff Engine - OCI distribution and cluster bootstrap.
//!
//! - [`oci`]: registry client, credentials, references, on-disk OCI layout
//! - [`transfer`]: concurrent pull/push pipeline with layer deduplication
//! - [`cluster`]: in-cluster seed registry bootstrap over the control plane

#![allow(clippy::result_large_err)]

pub mod cluster;
pub mod oci;
pub mod transfer;

// Re-export common types
pub use cluster::{ClusterClient, Injector, InjectorReady, InjectorRequest, KubeClient};
pub use oci::{
    CredentialStore, ImageReference, MemoryRegistry, OciLayout, PartialPull, RegistryAuth,
    RegistryClient, Remote, RemoteOptions,
};
pub use transfer::{CancelSwitch, CancelToken, ImagePuller, ImagePusher, PullReport, PushReport};

/// Skiff Engine version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
