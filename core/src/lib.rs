//! Skiff Core - Foundational Types
//!
//! Error type, configuration, OCI descriptor model, and the progress sink
//! shared by the transfer engine and the CLI.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod progress;

// Re-export commonly used types
pub use config::{InjectorConfig, RegistryInfo, SkiffConfig, TransferConfig};
pub use descriptor::{Descriptor, ImageIndex, Manifest, Platform};
pub use error::{Result, SkiffError};
pub use progress::{LogProgress, MemoryProgress, NoopProgress, ProgressHandle, ProgressReporter};

/// Skiff version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
