//! Reconciliation workers.
//!
//! Each worker repeatedly takes one key from the queue and reconciles it
//! until the queue shuts down.

use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use std::sync::Arc;
use tracing::{debug, trace};

/// Runs one worker loop until the queue is shut down.
pub async fn run_worker(id: usize, queue: Arc<WorkQueue>, reconciler: Arc<Reconciler>, max_retries: u32) {
    debug!("Starting metadata worker {}", id);
    while process_next_work_item(&queue, &reconciler, max_retries).await {}
    debug!("Stopping metadata worker {}", id);
}

/// Processes one key. Returns `false` once the queue is shut down.
///
/// A failing key is retried with backoff while it has failed fewer than
/// `max_retries` times, and dropped afterwards.
pub async fn process_next_work_item(queue: &Arc<WorkQueue>, reconciler: &Reconciler, max_retries: u32) -> bool {
    let Some(key) = queue.dequeue().await else {
        return false;
    };
    trace!("Processing endpoints {} ({} keys pending)", key, queue.len());

    match reconciler.reconcile(&key) {
        Ok(()) => queue.ack(&key),
        Err(e) if queue.is_shutting_down() => {
            debug!("Not retrying endpoints {} during shutdown: {}", key, e);
            queue.drop_key(&key);
        }
        Err(e) if queue.num_requeues(&key) < max_retries => {
            debug!("Error syncing endpoints {}: {}", key, e);
            queue.retry(&key);
        }
        Err(e) => {
            debug!("Dropping endpoints {} out of the queue: {}", key, e);
            queue.drop_key(&key);
        }
    }
    true
}
