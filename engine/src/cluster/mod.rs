//! In-cluster seed registry bootstrap.
//!
//! - [`client`]: the Kubernetes operations the injector needs
//! - [`kube`]: REST implementation configured from a kubeconfig
//! - [`payload`]: seed tarball chunking into ConfigMap-sized pieces
//! - [`seed`]: staging seed images into their own layout
//! - [`injector`]: the bootstrap state machine
//! - [`tunnel`]: routes to registries inside the cluster

pub mod client;
pub mod injector;
pub mod kube;
pub mod objects;
pub mod payload;
pub mod seed;
pub mod tunnel;

pub use client::ClusterClient;
pub use injector::{
    candidates_from_pods, CandidateNodeImage, HttpRegistryProbe, Injector, InjectorReady,
    InjectorRequest, RegistryProbe,
};
pub use kube::{default_kubeconfig, KubeClient, KubeEndpoint};
pub use payload::{chunk_name, create_payload_archive, reassemble, split_file, PayloadChunk};
pub use seed::load_seed_images;
pub use tunnel::{DirectTunnel, PortForward, Tunnel, TunnelHandle};
