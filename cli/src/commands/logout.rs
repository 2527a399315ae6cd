//! `skiff logout` command.

use clap::Args;
use skiff_core::config::SkiffConfig;
use skiff_engine::CredentialStore;

use super::login::DEFAULT_SERVER;

#[derive(Args)]
pub struct LogoutArgs {
    /// Registry server
    #[arg(default_value = DEFAULT_SERVER)]
    pub server: String,

    /// Forget every stored registry
    #[arg(long, conflicts_with = "server")]
    pub all: bool,
}

pub async fn execute(args: LogoutArgs, config: SkiffConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = CredentialStore::new(config.credentials_path());
    let servers = if args.all {
        store.list_registries()?
    } else {
        vec![args.server]
    };

    for server in servers {
        if store.remove(&server)? {
            println!("Removed credentials for {}", server);
        } else {
            println!("Not logged in to {}", server);
        }
    }
    Ok(())
}
