//! `skiff pull` command.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use skiff_core::config::{default_cache_dir, SkiffConfig};
use skiff_engine::oci::{OciLayout, RegistryClient, RemoteOptions};
use skiff_engine::transfer::source::SourceResolver;
use skiff_engine::ImagePuller;

use crate::output::{self, BarProgress};

#[derive(Args)]
pub struct PullArgs {
    /// Image references, tarball paths, or daemon images
    #[arg(required = true)]
    pub images: Vec<String>,

    /// OCI layout to pull into (default: ~/.skiff/cache/images)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,

    /// Talk plain HTTP to registries
    #[arg(long)]
    pub plain_http: bool,

    /// Registry rewrite applied before resolution (HOST=TARGET, repeatable)
    #[arg(long = "override", value_name = "HOST=TARGET")]
    pub overrides: Vec<String>,

    /// Acceptable architectures, in preference order (repeatable)
    #[arg(long = "arch")]
    pub architectures: Vec<String>,

    /// Fetch every blob from its source instead of the shared layer cache
    #[arg(long)]
    pub no_layer_cache: bool,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PullArgs, mut config: SkiffConfig) -> Result<(), Box<dyn std::error::Error>> {
    apply_args(&args, &mut config)?;
    let transfer = &config.transfer;

    let mut options = RemoteOptions::from_transfer_config(transfer);
    options.credentials_path = config.credentials_path.clone();
    let remote = Arc::new(RegistryClient::new(options)?);
    let resolver = SourceResolver::new(remote, transfer)?;

    let root = args.output.clone().unwrap_or_else(default_cache_dir);
    let layout = Arc::new(OciLayout::open(&root)?);
    let mut puller = ImagePuller::new(layout, resolver, transfer);
    if let Some(cache_root) = layer_cache_dir(&args, transfer.layer_cache.as_deref()) {
        puller = puller.with_layer_cache(Arc::new(OciLayout::open(cache_root)?));
    }

    let switch = super::interrupt_switch();
    let report = match puller
        .pull_all(&args.images, BarProgress::handle(args.quiet), &switch.token())
        .await
    {
        Ok(report) => report,
        Err(e) => {
            if let Some(hint) = e.hint() {
                eprintln!("Hint: {}", hint);
            }
            return Err(e.into());
        }
    };

    if args.quiet {
        return Ok(());
    }
    let mut table = output::new_table(&["IMAGE", "DIGEST", "SOURCE"]);
    for image in &report.images {
        table.add_row(vec![
            image.name.clone(),
            output::short_digest(&image.digest).to_string(),
            image.source.to_string(),
        ]);
    }
    println!("{table}");
    println!(
        "Pulled {} images into {} ({} layers written, {} already present, {})",
        report.images.len(),
        root.display(),
        report.layers_written,
        report.layers_skipped,
        output::format_bytes(report.total_bytes)
    );
    Ok(())
}

/// Layer cache for this pull: the configured one, else the default image
/// cache. `ImagePuller` ignores it when it is also the output.
fn layer_cache_dir(args: &PullArgs, configured: Option<&Path>) -> Option<PathBuf> {
    if args.no_layer_cache {
        return None;
    }
    Some(configured.map(Path::to_path_buf).unwrap_or_else(default_cache_dir))
}

fn apply_args(args: &PullArgs, config: &mut SkiffConfig) -> Result<(), Box<dyn std::error::Error>> {
    let transfer = &mut config.transfer;
    transfer.insecure_skip_verify |= args.insecure;
    transfer.plain_http |= args.plain_http;
    if !args.architectures.is_empty() {
        transfer.architectures = args.architectures.clone();
    }
    for entry in &args.overrides {
        let (host, target) = entry
            .split_once('=')
            .filter(|(h, t)| !h.is_empty() && !t.is_empty())
            .ok_or_else(|| format!("Invalid override '{}': expected HOST=TARGET", entry))?;
        transfer
            .registry_overrides
            .insert(host.to_string(), target.to_string());
    }
    Ok(())
}
