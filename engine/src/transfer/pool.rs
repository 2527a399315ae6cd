//! Task pool with a shared cancellation switch.
//!
//! Each submitted item runs as its own task on a [`JoinSet`]. The first
//! task to fail with a real error flips the pool's [`CancelSwitch`];
//! siblings observe it through their [`CancelToken`] and wind down with
//! `Cancelled`, which is never reported as a failure of its own.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use skiff_core::error::{Result, SkiffError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Owner side of a cancellation signal.
#[derive(Clone)]
pub struct CancelSwitch {
    tx: Arc<watch::Sender<bool>>,
    token: CancelToken,
}

impl Default for CancelSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSwitch {
    /// A root switch.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A switch that also trips when `parent` is cancelled.
    pub fn child_of(parent: &CancelToken) -> Self {
        Self::build(Some(parent.clone()))
    }

    fn build(parent: Option<CancelToken>) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            token: CancelToken {
                rx,
                parent: parent.map(Box::new),
            },
        }
    }

    /// Flip the switch. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A token observing this switch.
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }
}

/// Observer side of a cancellation signal.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    parent: Option<Box<CancelToken>>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx, parent: None }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// `Err(Cancelled)` once the switch (or any ancestor) has flipped.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SkiffError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when this token or an ancestor is cancelled.
    pub fn cancelled(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut rx = self.rx.clone();
            let own = async move {
                loop {
                    if *rx.borrow_and_update() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        // Sender gone without cancelling
                        std::future::pending::<()>().await;
                    }
                }
            };
            match &self.parent {
                Some(parent) => {
                    tokio::select! {
                        _ = own => {}
                        _ = parent.cancelled() => {}
                    }
                }
                None => own.await,
            }
        })
    }

    /// Sleep for `duration`, returning early with `Cancelled`.
    pub async fn sleep(&self, duration: std::time::Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(SkiffError::Cancelled),
        }
    }
}

/// Progress event emitted as each task completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskProgress {
    pub completed: usize,
    pub total: usize,
}

/// Runs one task per item and gathers their results in submission order.
pub struct TaskPool<T> {
    name: &'static str,
    tasks: JoinSet<(usize, Result<T>)>,
    switch: CancelSwitch,
    progress_tx: mpsc::UnboundedSender<TaskProgress>,
    progress_rx: Option<mpsc::UnboundedReceiver<TaskProgress>>,
    submitted: usize,
    /// Completion count; events are sent while it is held so they arrive in order
    completed: Arc<Mutex<usize>>,
    total: Arc<AtomicUsize>,
}

impl<T: Send + 'static> TaskPool<T> {
    /// Create a pool whose switch follows `parent`.
    pub fn new(name: &'static str, parent: &CancelToken) -> Self {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        Self {
            name,
            tasks: JoinSet::new(),
            switch: CancelSwitch::child_of(parent),
            progress_tx,
            progress_rx: Some(progress_rx),
            submitted: 0,
            completed: Arc::new(Mutex::new(0)),
            total: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawn a task. The closure receives the pool's cancellation token.
    pub fn submit<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let index = self.submitted;
        self.submitted += 1;
        self.total.fetch_add(1, Ordering::SeqCst);

        let token = self.switch.token();
        let switch = self.switch.clone();
        let progress_tx = self.progress_tx.clone();
        let completed = Arc::clone(&self.completed);
        let total = Arc::clone(&self.total);
        let fut = task(token.clone());

        self.tasks.spawn(async move {
            let result = match token.check() {
                Ok(()) => fut.await,
                Err(e) => Err(e),
            };
            if let Err(ref e) = result {
                if !e.is_cancelled() {
                    switch.cancel();
                }
            }
            {
                let mut done = completed.lock();
                *done += 1;
                let _ = progress_tx.send(TaskProgress {
                    completed: *done,
                    total: total.load(Ordering::SeqCst),
                });
            }
            (index, result)
        });
    }

    /// Ordered stream of completion events. Available once.
    pub fn progress(&mut self) -> Option<mpsc::UnboundedReceiver<TaskProgress>> {
        self.progress_rx.take()
    }

    /// Token observing this pool's switch.
    pub fn token(&self) -> CancelToken {
        self.switch.token()
    }

    /// Cancel every outstanding task.
    pub fn cancel(&self) {
        self.switch.cancel();
    }

    /// Number of tasks submitted so far.
    pub fn len(&self) -> usize {
        self.submitted
    }

    pub fn is_empty(&self) -> bool {
        self.submitted == 0
    }

    /// Wait for every task. Returns all results in submission order, or the
    /// first real error (cancellations only win when nothing else failed).
    pub async fn join(mut self) -> Result<Vec<T>> {
        drop(self.progress_tx);
        let mut results: Vec<(usize, T)> = Vec::with_capacity(self.submitted);
        let mut first_error: Option<SkiffError> = None;
        let mut cancelled = false;

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((index, Ok(value))) => results.push((index, value)),
                Ok((_, Err(e))) if e.is_cancelled() => {
                    cancelled = true;
                }
                Ok((index, Err(e))) => {
                    if first_error.is_none() {
                        tracing::warn!(pool = self.name, task = index, error = %e, "Task failed");
                        first_error = Some(e);
                    } else {
                        tracing::debug!(pool = self.name, task = index, error = %e, "Additional task failure");
                    }
                }
                Err(join_error) => {
                    self.switch.cancel();
                    if first_error.is_none() {
                        first_error = Some(SkiffError::Other(format!(
                            "{} task aborted: {}",
                            self.name, join_error
                        )));
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if cancelled {
            tracing::debug!(pool = self.name, "Pool cancelled");
            return Err(SkiffError::Cancelled);
        }

        results.sort_by_key(|(index, _)| *index);
        Ok(results.into_iter().map(|(_, value)| value).collect())
    }
}
