//! CLI command definitions and dispatch.

mod images;
mod inject;
mod login;
mod logout;
mod pull;
mod push;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use skiff_core::config::SkiffConfig;
use skiff_engine::CancelSwitch;

/// Skiff - move OCI images into airgapped Kubernetes clusters.
#[derive(Parser)]
#[command(name = "skiff", version, about)]
pub struct Cli {
    /// Configuration file (YAML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter (e.g. "info", "skiff_engine=debug"); overrides RUST_LOG
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Pull images into an OCI layout
    Pull(pull::PullArgs),
    /// Push images from an OCI layout into a registry
    Push(push::PushArgs),
    /// Bootstrap a seed registry inside a cluster
    Inject(inject::InjectArgs),
    /// Remove the seed registry bootstrap resources
    InjectCleanup(inject::InjectCleanupArgs),
    /// List images recorded in an OCI layout
    Images(images::ImagesArgs),
    /// Store registry credentials
    Login(login::LoginArgs),
    /// Remove stored registry credentials
    Logout(logout::LogoutArgs),
}

/// Load the configuration file, or defaults when none is given.
pub(crate) fn load_config(path: Option<&Path>) -> Result<SkiffConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(SkiffConfig::from_file(path)?),
        None => Ok(SkiffConfig::default()),
    }
}

/// Cancellation switch flipped by Ctrl-C.
pub(crate) fn interrupt_switch() -> CancelSwitch {
    let switch = CancelSwitch::new();
    let handle = switch.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            handle.cancel();
        }
    });
    switch
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Pull(args) => pull::execute(args, config).await,
        Command::Push(args) => push::execute(args, config).await,
        Command::Inject(args) => inject::execute(args, config).await,
        Command::InjectCleanup(args) => inject::cleanup(args, config).await,
        Command::Images(args) => images::execute(args).await,
        Command::Login(args) => login::execute(args, config).await,
        Command::Logout(args) => logout::execute(args, config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_pull_with_overrides() {
        let cli = Cli::try_parse_from([
            "skiff",
            "--log-level",
            "debug",
            "pull",
            "nginx:1.25",
            "--output",
            "/tmp/layout",
            "--override",
            "docker.io=mirror.local",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Command::Pull(_)));
    }

    #[test]
    fn test_parse_login_logout() {
        let cli = Cli::try_parse_from(["skiff", "login", "-u", "bob", "--password-stdin"]).unwrap();
        match cli.command {
            Command::Login(args) => {
                assert_eq!(args.server, "docker.io");
                assert!(args.password_stdin);
            }
            _ => panic!("expected login"),
        }
        assert!(Cli::try_parse_from(["skiff", "login", "-p", "x", "--password-stdin"]).is_err());
        assert!(Cli::try_parse_from(["skiff", "logout", "--all"]).is_ok());
        assert!(Cli::try_parse_from(["skiff", "logout", "ghcr.io", "--all"]).is_err());
    }

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config, SkiffConfig::default());
    }
}
