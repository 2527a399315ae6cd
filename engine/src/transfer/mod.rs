//! Image transfer pipeline.
//!
//! Pulls images from tarballs, local layouts, registries, or the local
//! daemon into an OCI layout, and pushes a layout into a target registry.

pub mod pool;
pub mod pull;
pub mod push;
pub mod retry;
pub mod source;

pub use pool::{CancelSwitch, CancelToken, TaskPool, TaskProgress};
pub use pull::{ImagePuller, PullReport};
pub use push::{ImagePusher, PushReport};
pub use retry::{retry_fixed, DEFAULT_ATTEMPTS};
pub use source::{ImageSource, SourceKind};
