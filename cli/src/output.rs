//! Terminal output: tables and progress bars.

use std::sync::Arc;

use comfy_table::{ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use skiff_core::progress::{ProgressHandle, ProgressReporter};

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Shorten `sha256:<hex>` to the first 12 hex characters.
pub fn short_digest(digest: &str) -> &str {
    let hex = digest.split_once(':').map_or(digest, |(_, hex)| hex);
    &hex[..12.min(hex.len())]
}

/// Progress reporter drawing a single byte bar on stderr.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn handle(quiet: bool) -> ProgressHandle {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] {bar:40.cyan/blue} {decimal_bytes:>9}/{decimal_total_bytes:9} {msg}",
        ) {
            bar.set_style(style.progress_chars("##-"));
        }
        Arc::new(Self { bar })
    }
}

impl ProgressReporter for BarProgress {
    fn set_total(&self, total: u64) {
        self.bar.set_length(total);
    }

    fn add(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn update_title(&self, title: &str) {
        self.bar.set_message(title.to_string());
    }

    fn warn(&self, message: &str) {
        self.bar.println(format!("WARNING: {}", message));
    }

    fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_short_digest() {
        assert_eq!(
            short_digest("sha256:0123456789abcdef0123456789abcdef"),
            "0123456789ab"
        );
        assert_eq!(short_digest("abc"), "abc");
    }

    #[test]
    fn test_hidden_bar_accepts_updates() {
        let progress = BarProgress::handle(true);
        progress.set_total(10);
        progress.add(4);
        progress.update_title("Pulling");
        progress.warn("careful");
        progress.finish("done");
    }
}
