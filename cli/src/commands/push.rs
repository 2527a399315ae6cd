//! `skiff push` command.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use skiff_core::config::{default_cache_dir, RegistryInfo, SkiffConfig};
use skiff_engine::cluster::{DirectTunnel, PortForward, Tunnel};
use skiff_engine::oci::{OciLayout, RegistryAuth, RegistryClient, RemoteOptions};
use skiff_engine::ImagePusher;

use crate::output::{self, BarProgress};

#[derive(Args)]
pub struct PushArgs {
    /// Images to push (default: every image recorded in the layout)
    pub images: Vec<String>,

    /// OCI layout to push from (default: ~/.skiff/cache/images)
    #[arg(short, long)]
    pub layout: Option<PathBuf>,

    /// External registry address, reached directly (default: the in-cluster registry)
    #[arg(long)]
    pub registry: Option<String>,

    /// Port-forward to this service instead of the configured registry service
    #[arg(long, value_name = "SERVICE")]
    pub port_forward: Option<String>,

    /// Kubeconfig used for port-forwarding
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context used for port-forwarding
    #[arg(long)]
    pub context: Option<String>,

    /// Push friendly names only, without checksum-tagged copies
    #[arg(long)]
    pub no_checksum: bool,

    /// Push username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Push password
    #[arg(short, long)]
    pub password: Option<String>,

    /// Talk plain HTTP to the registry
    #[arg(long)]
    pub plain_http: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Service and port to port-forward to, or `None` to dial the registry
/// address directly.
fn forward_target(args: &PushArgs, registry: &RegistryInfo) -> Option<(String, u16)> {
    match args.port_forward {
        Some(ref service) => Some((service.clone(), registry.service_port)),
        None if registry.internal_registry => Some((registry.service_name.clone(), registry.service_port)),
        None => None,
    }
}

pub async fn execute(args: PushArgs, mut config: SkiffConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(ref address) = args.registry {
        config.registry.address = address.clone();
        config.registry.internal_registry = false;
    }
    config.registry.no_checksum |= args.no_checksum;
    if args.username.is_some() {
        config.registry.push_username = args.username.clone();
        config.registry.push_password = args.password.clone();
    }
    config.transfer.plain_http |= args.plain_http;
    config.transfer.insecure_skip_verify |= args.insecure;

    let root = args.layout.clone().unwrap_or_else(default_cache_dir);
    let layout = OciLayout::open(&root)?;
    let images = if args.images.is_empty() {
        layout.read_references().await?.into_keys().collect()
    } else {
        args.images.clone()
    };
    if images.is_empty() {
        return Err(format!("No images recorded in {}", root.display()).into());
    }

    let mut options = RemoteOptions::from_transfer_config(&config.transfer);
    options.credentials_path = config.credentials_path.clone();
    if let (Some(user), Some(pass)) = (&config.registry.push_username, &config.registry.push_password) {
        options = options.with_auth(RegistryAuth::basic(user, pass));
    }
    let remote = Arc::new(RegistryClient::new(options)?);

    let tunnel: Box<dyn Tunnel> = match forward_target(&args, &config.registry) {
        Some((service, port)) => Box::new(
            PortForward::service(&config.injector.namespace, &service, port)
                .with_kubeconfig(args.kubeconfig.clone())
                .with_context(args.context.clone()),
        ),
        None => Box::new(DirectTunnel::new(config.registry.address.clone())),
    };

    let switch = super::interrupt_switch();
    let pusher = ImagePusher::new(remote, config.registry.clone(), &config.transfer)
        .with_cancel(switch.token());
    let report = pusher
        .push_all(&layout, &images, tunnel.as_ref(), BarProgress::handle(args.quiet))
        .await?;

    if args.quiet {
        return Ok(());
    }
    let mut table = output::new_table(&["IMAGE", "TARGET", "DIGEST"]);
    for image in &report.images {
        for target in &image.targets {
            table.add_row(vec![
                image.source.clone(),
                target.clone(),
                output::short_digest(&image.digest).to_string(),
            ]);
        }
    }
    println!("{table}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        push: PushArgs,
    }

    fn args(argv: &[&str]) -> PushArgs {
        let mut full = vec!["push"];
        full.extend_from_slice(argv);
        Harness::try_parse_from(full).unwrap().push
    }

    #[test]
    fn test_internal_registry_is_port_forwarded() {
        let registry = RegistryInfo::default();
        assert_eq!(
            forward_target(&args(&[]), &registry),
            Some(("skiff-docker-registry".to_string(), 5000))
        );
        assert_eq!(
            forward_target(&args(&["--port-forward", "mirror"]), &registry),
            Some(("mirror".to_string(), 5000))
        );
    }

    #[test]
    fn test_external_registry_is_dialed_directly() {
        let registry = RegistryInfo {
            internal_registry: false,
            ..Default::default()
        };
        assert_eq!(forward_target(&args(&["--registry", "registry.lan:5000"]), &registry), None);
    }
}
