//! Abstract progress sink.
//!
//! The engine reports byte counts and operator warnings through this trait;
//! rendering is left to the caller (the CLI draws bars, tests record).

use std::sync::{Arc, Mutex};

/// Receiver of transfer progress.
pub trait ProgressReporter: Send + Sync {
    /// Set the expected total in bytes (or items).
    fn set_total(&self, total: u64);

    /// Advance the current position.
    fn add(&self, delta: u64);

    /// Replace the current status line.
    fn update_title(&self, title: &str);

    /// Surface an operator-facing warning.
    fn warn(&self, message: &str);

    /// Mark the operation finished.
    fn finish(&self, message: &str);
}

/// Shared handle passed through the pipeline.
pub type ProgressHandle = Arc<dyn ProgressReporter>;

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl NoopProgress {
    pub fn handle() -> ProgressHandle {
        Arc::new(NoopProgress)
    }
}

impl ProgressReporter for NoopProgress {
    fn set_total(&self, _total: u64) {}
    fn add(&self, _delta: u64) {}
    fn update_title(&self, _title: &str) {}
    fn warn(&self, _message: &str) {}
    fn finish(&self, _message: &str) {}
}

/// Forwards titles and warnings to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn set_total(&self, total: u64) {
        tracing::debug!(total, "Progress total set");
    }

    fn add(&self, _delta: u64) {}

    fn update_title(&self, title: &str) {
        tracing::info!("{}", title);
    }

    fn warn(&self, message: &str) {
        tracing::warn!("{}", message);
    }

    fn finish(&self, message: &str) {
        tracing::info!("{}", message);
    }
}

#[derive(Debug, Default)]
struct Recorded {
    total: u64,
    current: u64,
    titles: Vec<String>,
    warnings: Vec<String>,
    finished: Option<String>,
}

/// Records every call; used to assert on warnings and totals.
#[derive(Debug, Default)]
pub struct MemoryProgress {
    inner: Mutex<Recorded>,
}

impl MemoryProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn total(&self) -> u64 {
        self.lock().total
    }

    pub fn current(&self) -> u64 {
        self.lock().current
    }

    pub fn titles(&self) -> Vec<String> {
        self.lock().titles.clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.lock().warnings.clone()
    }

    pub fn finished(&self) -> Option<String> {
        self.lock().finished.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        // A panicking reporter call leaves plain data behind; keep reading it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ProgressReporter for MemoryProgress {
    fn set_total(&self, total: u64) {
        self.lock().total = total;
    }

    fn add(&self, delta: u64) {
        self.lock().current += delta;
    }

    fn update_title(&self, title: &str) {
        self.lock().titles.push(title.to_string());
    }

    fn warn(&self, message: &str) {
        self.lock().warnings.push(message.to_string());
    }

    fn finish(&self, message: &str) {
        self.lock().finished = Some(message.to_string());
    }
}
