// src/filter/queue.rs
//! Bounded-concurrency filter runner. Submissions enter a FIFO queue and
//! are drained by a fixed pool of workers, capping concurrent outbound
//! classification calls while preserving admission order. Completion order
//! is whatever concurrency allows.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::filter::FilterManager;
use crate::item::{CandidateItem, FilterDecision};

pub const DEFAULT_WORKERS: usize = 3;

struct Job {
    item: CandidateItem,
    reply: oneshot::Sender<FilterDecision>,
}

pub struct FilterQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl FilterQueue {
    /// Spawn `workers` drainers over a shared FIFO queue. Workers live as
    /// long as the queue handle (the channel closing stops them).
    pub fn new(manager: Arc<FilterManager>, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                loop {
                    // Hold the receiver lock only for the dequeue so the
                    // other workers can drain concurrently.
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else {
                        debug!(worker, "filter queue closed, worker exiting");
                        break;
                    };
                    let decision = manager.should_post(&job.item).await;
                    // A dropped receiver means the submitter gave up
                    // (timeout); the decision is simply discarded.
                    let _ = job.reply.send(decision);
                }
            });
        }

        Self { tx }
    }

    /// Enqueue an item without blocking; the returned future resolves when
    /// a worker has produced the decision. One task's failure never stalls
    /// the queue for the rest.
    pub async fn submit(&self, item: CandidateItem) -> Result<FilterDecision> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Job {
                item,
                reply: reply_tx,
            })
            .map_err(|_| PipelineError::Internal("filter queue closed".into()))?;
        reply_rx.await.map_err(|_| {
            warn!("filter worker dropped a decision");
            PipelineError::Internal("filter worker dropped the decision".into())
        })
    }
}
