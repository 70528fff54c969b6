//! Main controller implementation.
//!
//! This module contains the `MetadataController` that waits for the change
//! feed to sync, then runs the worker pool until shutdown.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::worker::run_worker;
use agent_cache::Cache;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Metadata controller: the work queue and the workers draining it.
#[derive(Debug)]
pub struct MetadataController {
    queue: Arc<WorkQueue>,
    reconciler: Arc<Reconciler>,
    workers: usize,
    max_retries: u32,
    ready: Arc<AtomicBool>,
}

impl MetadataController {
    /// Creates a new controller instance.
    pub fn new(queue: Arc<WorkQueue>, reconciler: Reconciler, config: &ControllerConfig) -> Self {
        Self {
            queue,
            reconciler: Arc::new(reconciler),
            workers: config.workers,
            max_retries: config.max_retries,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag set once the initial sync is done
    #[must_use]
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    /// Runs the controller until `cancel` fires.
    ///
    /// Workers start only after `synced` resolves. A sync failure is
    /// returned; cancellation before sync is a clean stop.
    pub async fn run<S>(&self, synced: S, cancel: CancellationToken) -> Result<(), ControllerError>
    where
        S: Future<Output = Result<(), ControllerError>>,
    {
        info!("Starting metadata controller");
        let result = self.run_until_cancelled(synced, &cancel).await;
        self.queue.shutdown();
        if !self.queue.is_empty() {
            debug!("Discarding {} pending endpoints keys", self.queue.len());
        }
        info!("Stopping metadata controller");
        result
    }

    async fn run_until_cancelled<S>(&self, synced: S, cancel: &CancellationToken) -> Result<(), ControllerError>
    where
        S: Future<Output = Result<(), ControllerError>>,
    {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("Shutdown requested before caches synced");
                return Ok(());
            }
            result = synced => result?,
        }
        self.ready.store(true, Ordering::Release);

        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            workers.spawn(run_worker(
                id,
                Arc::clone(&self.queue),
                Arc::clone(&self.reconciler),
                self.max_retries,
            ));
        }
        info!("Started {} metadata workers", self.workers);

        cancel.cancelled().await;
        self.queue.shutdown();

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Metadata worker failed: {}", e);
            }
        }
        Ok(())
    }
}

/// Sweeps expired entries out of `cache` every `period` until `cancel` fires.
pub async fn run_cache_janitor(cache: Arc<Cache>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let purged = cache.purge_expired();
        debug!("Purged {} expired cache entries, {} remaining", purged, cache.len());
    }
}
