//! Skiff CLI - move images into airgapped clusters.

pub mod commands;
pub mod output;
