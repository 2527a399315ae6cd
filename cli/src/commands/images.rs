//! `skiff images` command.

use std::path::PathBuf;

use clap::Args;
use skiff_core::config::default_cache_dir;
use skiff_engine::OciLayout;

use crate::output;

#[derive(Args)]
pub struct ImagesArgs {
    /// OCI layout to list (default: ~/.skiff/cache/images)
    #[arg(short, long)]
    pub layout: Option<PathBuf>,

    /// Only show image references (one per line)
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ImagesArgs) -> Result<(), Box<dyn std::error::Error>> {
    let root = args.layout.unwrap_or_else(default_cache_dir);
    if !root.join("index.json").exists() {
        if !args.quiet {
            println!("{}", output::new_table(&["REFERENCE", "DIGEST", "SIZE"]));
        }
        return Ok(());
    }

    let layout = OciLayout::open(&root)?;
    let references = layout.read_references().await?;

    if args.quiet {
        for reference in references.keys() {
            println!("{}", reference);
        }
        return Ok(());
    }

    let mut table = output::new_table(&["REFERENCE", "DIGEST", "SIZE"]);
    for (reference, digest) in &references {
        let size = match layout.resolve_reference(reference).await? {
            Some(entry) => {
                let manifest = layout.read_manifest(&entry).await?;
                output::format_bytes(manifest.layers_size() + entry.known_size().unwrap_or(0))
            }
            None => "-".to_string(),
        };
        table.add_row(vec![
            reference.clone(),
            output::short_digest(digest).to_string(),
            size,
        ]);
    }
    println!("{table}");
    Ok(())
}
