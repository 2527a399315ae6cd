//! OCI distribution: references, credentials, remotes, and the local layout.

pub mod credentials;
pub mod layout;
pub mod memory;
pub mod partial;
pub mod reference;
pub mod registry;
pub mod remote;

pub use credentials::{CredentialStore, RegistryAuth};
pub use layout::{BlobWrite, OciLayout};
pub use memory::MemoryRegistry;
pub use partial::{PartialPull, PartialPullReport};
pub use reference::ImageReference;
pub use registry::RegistryClient;
pub use remote::{BlobReader, BlobWriter, Remote, RemoteOptions};
