//! `skiff login` command.

use std::io::Read;

use clap::Args;
use skiff_core::config::SkiffConfig;
use skiff_engine::CredentialStore;

/// Registry assumed when none is given.
pub const DEFAULT_SERVER: &str = "docker.io";

#[derive(Args)]
pub struct LoginArgs {
    /// Registry server
    #[arg(default_value = DEFAULT_SERVER)]
    pub server: String,

    #[arg(short, long)]
    pub username: Option<String>,

    #[arg(short, long, conflicts_with = "password_stdin")]
    pub password: Option<String>,

    /// Take the password from stdin
    #[arg(long)]
    pub password_stdin: bool,
}

fn prompt(label: &str) -> std::io::Result<String> {
    eprint!("{}: ", label);
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn read_stdin() -> std::io::Result<String> {
    let mut all = String::new();
    std::io::stdin().read_to_string(&mut all)?;
    Ok(all.trim_end_matches(['\r', '\n']).to_string())
}

pub async fn execute(args: LoginArgs, config: SkiffConfig) -> Result<(), Box<dyn std::error::Error>> {
    let username = match args.username {
        Some(u) => u,
        None => prompt("Username")?,
    };
    let password = match (args.password, args.password_stdin) {
        (_, true) => read_stdin()?,
        (Some(p), false) => p,
        (None, false) => prompt("Password")?,
    };
    if username.is_empty() || password.is_empty() {
        return Err("Username and password are required".into());
    }

    let store = CredentialStore::new(config.credentials_path());
    store.store(&args.server, &username, &password)?;
    tracing::info!(server = %args.server, path = %store.path().display(), "Stored credentials");

    println!("Login Succeeded");
    Ok(())
}
