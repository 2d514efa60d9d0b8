// src/dispatch.rs
//! Batched dispatcher. Accepted items go out in fixed-size batches with
//! inter-item pacing and a longer pause between batches; each item retries
//! independently, and one item exhausting its retries never aborts the
//! rest. Partial delivery is an accepted outcome.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::item::{CandidateItem, Destination, FilterDecision};
use crate::notify::{DeliveryChannel, RenderedItem};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("dispatch_posted_total", "Items delivered to a destination.");
        describe_counter!(
            "dispatch_failed_total",
            "Items that exhausted delivery retries."
        );
    });
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Items per batch.
    pub batch_size: usize,
    /// Pause between items inside a batch.
    pub item_delay: Duration,
    /// Pause between batches.
    pub batch_delay: Duration,
    /// Delivery attempts per item.
    pub max_attempts: u32,
    /// Backoff unit; attempt n sleeps `backoff_base << (n-1)`.
    pub backoff_base: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            item_delay: Duration::from_secs(1),
            batch_delay: Duration::from_secs(5),
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
        }
    }
}

/// Aggregate outcome of one dispatch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub posted: usize,
    pub failed: usize,
}

pub struct Dispatcher {
    channel: Arc<dyn DeliveryChannel>,
    cfg: DispatchConfig,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn DeliveryChannel>, cfg: DispatchConfig) -> Self {
        ensure_metrics_described();
        Self { channel, cfg }
    }

    /// Deliver accepted items to one destination. Fails fast when the
    /// destination has no delivery target — connectivity is the caller's
    /// precondition, not something to retry into existence here.
    pub async fn dispatch(
        &self,
        destination: &Destination,
        items: &[(CandidateItem, FilterDecision)],
    ) -> Result<DispatchReport> {
        let address = destination
            .address
            .as_deref()
            .ok_or_else(|| PipelineError::NoDeliveryTarget(destination.id.clone()))?;

        let mut report = DispatchReport {
            posted: 0,
            failed: 0,
        };

        let batches: Vec<&[(CandidateItem, FilterDecision)]> =
            items.chunks(self.cfg.batch_size.max(1)).collect();
        for (batch_no, batch) in batches.iter().enumerate() {
            if batch_no > 0 {
                tokio::time::sleep(self.cfg.batch_delay).await;
            }
            for (item_no, (item, decision)) in batch.iter().enumerate() {
                if item_no > 0 {
                    tokio::time::sleep(self.cfg.item_delay).await;
                }
                let rendered = RenderedItem::from_accepted(item, decision);
                match self.send_with_retry(address, &rendered).await {
                    Ok(()) => {
                        report.posted += 1;
                        counter!("dispatch_posted_total").increment(1);
                    }
                    Err(e) => {
                        report.failed += 1;
                        counter!("dispatch_failed_total").increment(1);
                        warn!(
                            error = %e,
                            destination = %destination.id,
                            item = %item.id,
                            "item delivery exhausted retries"
                        );
                    }
                }
            }
        }

        if report.failed > 0 {
            warn!(
                destination = %destination.id,
                posted = report.posted,
                failed = report.failed,
                "dispatch finished with failures"
            );
        } else {
            info!(
                destination = %destination.id,
                posted = report.posted,
                "dispatch finished"
            );
        }
        Ok(report)
    }

    async fn send_with_retry(&self, address: &str, item: &RenderedItem) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.channel.send(address, item).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if attempt >= self.cfg.max_attempts.max(1) {
                        return Err(e);
                    }
                    debug!(error = %e, attempt, "delivery attempt failed, backing off");
                    tokio::time::sleep(self.cfg.backoff_base * (1u32 << (attempt - 1))).await;
                }
            }
        }
    }
}
