//! Self-managing background worker.
//!
//! A worker runs [`BackgroundWorker::do_work`] repeatedly on its own tokio task
//! until one of three things happens: `stop()` is called, `do_work` returns
//! `false`, or every handle to the worker outside its own loop has been
//! dropped. The last case lets owners shut a worker down simply by letting go
//! of their `Arc`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Run-state shared between a worker and its loop.
#[derive(Debug, Default)]
pub struct Lifecycle {
    active: AtomicBool,
    stop_requested: AtomicBool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn try_activate(&self) -> bool {
        let won = self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.stop_requested.store(false, Ordering::Release);
        }
        won
    }

    fn deactivate(&self) {
        self.stop_requested.store(false, Ordering::Release);
        self.active.store(false, Ordering::Release);
    }
}

/// A unit of work that is repeated on a dedicated task.
#[async_trait]
pub trait BackgroundWorker: Send + Sync + 'static {
    /// Run-state storage owned by the concrete worker.
    fn lifecycle(&self) -> &Lifecycle;

    /// Name used in log output.
    fn name(&self) -> &'static str {
        "worker"
    }

    /// One iteration of work. Returning `false` ends the loop.
    ///
    /// Implementations must bound how long a single call can wait so the
    /// loop gets a chance to notice it has been stopped or abandoned.
    async fn do_work(&self) -> bool;

    /// Begin running `do_work` on a new task.
    ///
    /// Returns `false` without doing anything if the worker is already running
    /// or if there is no tokio runtime to run on.
    fn start(self: &Arc<Self>) -> bool
    where
        Self: Sized,
    {
        if !self.lifecycle().try_activate() {
            return false;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!(worker = self.name(), error = %e, "no runtime available to start worker");
                self.lifecycle().deactivate();
                return false;
            }
        };

        // The loop's clone is the worker's reference to itself.
        let worker = Arc::clone(self);
        handle.spawn(run_loop(worker));
        debug!(worker = self.name(), "worker started");
        true
    }

    /// Ask the loop to exit before its next iteration. Does not wait.
    fn stop(&self) {
        self.lifecycle()
            .stop_requested
            .store(true, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.lifecycle().is_active()
    }
}

async fn run_loop<W: BackgroundWorker>(worker: Arc<W>) {
    loop {
        if worker.lifecycle().stop_requested.load(Ordering::Acquire) {
            debug!(worker = worker.name(), "stop requested");
            break;
        }

        if Arc::strong_count(&worker) == 1 {
            debug!(worker = worker.name(), "no owners left, shutting down");
            break;
        }

        if !worker.do_work().await {
            debug!(worker = worker.name(), "work loop finished");
            break;
        }
    }

    worker.lifecycle().deactivate();
}
