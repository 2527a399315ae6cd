//! `skiff inject` and `skiff inject-cleanup` commands.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use skiff_core::config::SkiffConfig;
use skiff_engine::cluster::{
    load_seed_images, HttpRegistryProbe, Injector, InjectorRequest, KubeClient, PortForward,
};
use skiff_engine::OciLayout;

#[derive(Args)]
pub struct ClusterArgs {
    /// Kubeconfig file (default: $KUBECONFIG or ~/.kube/config)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context (default: current context)
    #[arg(long)]
    pub context: Option<String>,

    /// Namespace for the injector resources
    #[arg(short, long)]
    pub namespace: Option<String>,
}

#[derive(Args)]
pub struct InjectArgs {
    /// Package OCI layout containing the seed images
    #[arg(short, long)]
    pub layout: PathBuf,

    /// Image the seed registry must serve (repeatable)
    #[arg(long = "seed-image", required = true)]
    pub seed_images: Vec<String>,

    /// Statically linked injector binary
    #[arg(long)]
    pub injector_binary: PathBuf,

    /// Scratch directory for the seed layout and payload (default: temporary)
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    #[command(flatten)]
    pub cluster: ClusterArgs,
}

#[derive(Args)]
pub struct InjectCleanupArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,
}

fn build_injector(cluster: &ClusterArgs, config: &mut SkiffConfig) -> Result<Injector, Box<dyn std::error::Error>> {
    if let Some(ref namespace) = cluster.namespace {
        config.injector.namespace = namespace.clone();
    }
    let client = KubeClient::from_kubeconfig(cluster.kubeconfig.as_deref(), cluster.context.as_deref())?;
    let forward = PortForward::service(
        &config.injector.namespace,
        &config.injector.service_name,
        config.injector.registry_port,
    )
    .with_kubeconfig(cluster.kubeconfig.clone())
    .with_context(cluster.context.clone());
    let probe = HttpRegistryProbe::new(Arc::new(forward))?;
    Ok(Injector::new(
        Arc::new(client),
        Arc::new(probe),
        config.injector.clone(),
    ))
}

pub async fn execute(args: InjectArgs, mut config: SkiffConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Removed on return when no work dir was given
    let scratch;
    let work_dir = match args.work_dir {
        Some(ref dir) => dir.clone(),
        None => {
            scratch = tempfile::Builder::new().prefix("skiff-inject-").tempdir()?;
            scratch.path().to_path_buf()
        }
    };

    let switch = super::interrupt_switch();
    let package = OciLayout::open(&args.layout)?;
    let seed_dir = work_dir.join("seed");
    println!("Staging {} seed images...", args.seed_images.len());
    let seed_images = load_seed_images(&package, &args.seed_images, &seed_dir, &switch.token()).await?;

    let injector = build_injector(&args.cluster, &mut config)?.with_cancel(switch.token());
    let request = InjectorRequest {
        seed_dir,
        seed_images,
        injector_binary: args.injector_binary.clone(),
        work_dir: work_dir.join("payload"),
    };

    println!("Bootstrapping seed registry...");
    let ready = match injector.start(&request).await {
        Ok(ready) => ready,
        Err(e) => {
            if let Some(hint) = e.hint() {
                eprintln!("Hint: {}", hint);
            }
            return Err(e.into());
        }
    };

    println!(
        "Seed registry running on node {} (image {})",
        ready.candidate.node_name, ready.candidate.image_reference
    );
    println!("Registry address: {}", ready.registry_address());
    println!("Run `skiff inject-cleanup` once the permanent registry is up.");
    Ok(())
}

pub async fn cleanup(args: InjectCleanupArgs, mut config: SkiffConfig) -> Result<(), Box<dyn std::error::Error>> {
    let injector = build_injector(&args.cluster, &mut config)?;
    injector.stop().await;
    println!("Removed injector resources from namespace {}", injector.config().namespace);
    Ok(())
}
