// src/scheduler.rs
//! Cycle orchestrator. A timer (or a manual trigger) moves the scheduler
//! Idle → Running; a trigger while Running is a logged no-op, never queued.
//! The cycle polls all sources once, then serves each due destination
//! independently: filter → durable mark-seen → dispatch → cadence update.
//! Failures scoped to one destination or one item are logged and skipped;
//! only failures before the work is partitioned abort the cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{PipelineError, Result};
use crate::filter::FilterQueue;
use crate::item::{CandidateItem, Destination, FilterDecision, Source};
use crate::poller::Poller;
use crate::store::Store;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("cycle_runs_total", "Scheduler cycles started.");
        describe_counter!(
            "cycle_noop_total",
            "Triggers ignored because a cycle was already running."
        );
        describe_counter!(
            "filter_timeouts_total",
            "Items dropped because their filter decision missed the budget."
        );
        describe_gauge!("cycle_last_run_ts", "Unix ts when the last cycle started.");
    });
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Per-item budget for a filter decision; an elapse drops the item
    /// from the current destination's batch without retry.
    pub filter_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            filter_timeout: Duration::from_secs(30),
        }
    }
}

/// How a cycle ended. Mostly for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A cycle was already running.
    Skipped,
    /// No destination has a delivery target configured.
    NoDestinations,
    /// Every configured destination is inside its cadence window.
    NoneDue,
    /// Polling produced nothing; due destinations were fast-forwarded.
    NoNewItems { destinations: usize },
    Completed {
        destinations: usize,
        polled: usize,
        posted: usize,
        failed: usize,
    },
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    poller: Arc<Poller>,
    queue: Arc<FilterQueue>,
    dispatcher: Arc<Dispatcher>,
    cfg: SchedulerConfig,
    running: AtomicBool,
}

/// Resets the Running flag even when a cycle body bails early.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        poller: Arc<Poller>,
        queue: Arc<FilterQueue>,
        dispatcher: Arc<Dispatcher>,
        cfg: SchedulerConfig,
    ) -> Self {
        ensure_metrics_described();
        Self {
            store,
            poller,
            queue,
            dispatcher,
            cfg,
            running: AtomicBool::new(false),
        }
    }

    /// Run one full cycle. Idle → Running → Idle; re-entrant triggers are
    /// a no-op.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            counter!("cycle_noop_total").increment(1);
            info!("cycle already running, trigger ignored");
            return Ok(CycleOutcome::Skipped);
        }
        let _guard = RunningGuard(&self.running);

        counter!("cycle_runs_total").increment(1);
        let now = Utc::now();
        gauge!("cycle_last_run_ts").set(now.timestamp() as f64);

        // Everything up to the due-partition is cycle-fatal.
        let destinations = self
            .store
            .destinations()
            .await
            .map_err(|e| PipelineError::CycleAbort(format!("loading destinations: {e}")))?;
        let configured: Vec<Destination> = destinations
            .into_iter()
            .filter(|d| d.address.is_some())
            .collect();
        if configured.is_empty() {
            debug!("no destinations configured, cycle is a no-op");
            return Ok(CycleOutcome::NoDestinations);
        }

        let (due, waiting) = partition_due(configured, now);
        if due.is_empty() {
            debug!(waiting = waiting.len(), "no destination due, cycle is a no-op");
            return Ok(CycleOutcome::NoneDue);
        }
        info!(due = due.len(), waiting = waiting.len(), "cycle starting");

        let sources = self
            .store
            .sources()
            .await
            .map_err(|e| PipelineError::CycleAbort(format!("loading sources: {e}")))?;

        // Polling is destination-agnostic: once per cycle, shared by all
        // due destinations.
        let polled = self.poller.poll_all(&sources).await;
        let mut new_items: Vec<CandidateItem> = Vec::new();
        for source in &sources {
            if let Some(items) = polled.get(&source.id) {
                new_items.extend(items.iter().cloned());
            }
        }

        if new_items.is_empty() {
            // Fast-forward cadence so the very next tick does not re-check.
            for dest in &due {
                self.touch_destination(&dest.id, now).await;
            }
            info!(destinations = due.len(), "no new items, cadence fast-forwarded");
            return Ok(CycleOutcome::NoNewItems {
                destinations: due.len(),
            });
        }

        let mut posted = 0usize;
        let mut failed = 0usize;
        for dest in &due {
            let accepted = self.filter_for_destination(dest, &new_items).await;
            let deliverable = self.mark_accepted_seen(dest, accepted).await;

            if !deliverable.is_empty() {
                match self.dispatcher.dispatch(dest, &deliverable).await {
                    Ok(report) => {
                        posted += report.posted;
                        failed += report.failed;
                    }
                    Err(e) => {
                        failed += deliverable.len();
                        warn!(error = %e, destination = %dest.id, "dispatch failed");
                    }
                }
            }
            // Updated exactly once per cycle, item outcome notwithstanding.
            self.touch_destination(&dest.id, now).await;
        }

        info!(
            destinations = due.len(),
            polled = new_items.len(),
            posted,
            failed,
            "cycle finished"
        );
        Ok(CycleOutcome::Completed {
            destinations: due.len(),
            polled: new_items.len(),
            posted,
            failed,
        })
    }

    /// Run every polled item through the filter queue with the per-item
    /// timeout. Admission order is submission order; the accepted list
    /// keeps that order regardless of completion order.
    async fn filter_for_destination(
        &self,
        dest: &Destination,
        items: &[CandidateItem],
    ) -> Vec<(CandidateItem, FilterDecision)> {
        let futs = items.iter().map(|item| {
            let fut = self.queue.submit(item.clone());
            tokio::time::timeout(self.cfg.filter_timeout, fut)
        });
        let results = join_all(futs).await;

        let mut accepted = Vec::new();
        for (item, result) in items.iter().zip(results) {
            match result {
                Ok(Ok(decision)) if decision.accept => {
                    accepted.push((item.clone(), decision));
                }
                Ok(Ok(decision)) => {
                    debug!(
                        item = %item.id,
                        destination = %dest.id,
                        reason = %decision.reason,
                        "item rejected by filter"
                    );
                }
                Ok(Err(e)) => {
                    warn!(error = %e, item = %item.id, destination = %dest.id, "filter failed, item dropped");
                }
                Err(_) => {
                    counter!("filter_timeouts_total").increment(1);
                    let e = PipelineError::FilterTimeout(self.cfg.filter_timeout);
                    warn!(error = %e, item = %item.id, destination = %dest.id, "item dropped");
                }
            }
        }
        accepted
    }

    /// Durably mark accepted items seen *before* dispatch. An item whose
    /// mark fails is withheld from the batch: without the durable mark a
    /// redelivery on restart could not be ruled out.
    async fn mark_accepted_seen(
        &self,
        dest: &Destination,
        accepted: Vec<(CandidateItem, FilterDecision)>,
    ) -> Vec<(CandidateItem, FilterDecision)> {
        let mut deliverable = Vec::with_capacity(accepted.len());
        for (item, decision) in accepted {
            match self.store.mark_seen(&item).await {
                Ok(()) => deliverable.push((item, decision)),
                Err(e) => {
                    warn!(error = %e, item = %item.id, destination = %dest.id, "mark-seen failed, item withheld");
                }
            }
        }
        deliverable
    }

    async fn touch_destination(&self, id: &str, now: chrono::DateTime<Utc>) {
        if let Err(e) = self.store.update_destination(id, now).await {
            warn!(error = %e, destination = id, "failed to update destination cadence");
        }
    }

    /// Spawn the periodic trigger. The first tick fires immediately.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.run_cycle().await {
                    Ok(outcome) => debug!(?outcome, "scheduled cycle finished"),
                    Err(e) => error!(error = %e, "scheduled cycle aborted"),
                }
            }
        })
    }
}

/// Split configured destinations into due vs. waiting at `now`.
fn partition_due(
    destinations: Vec<Destination>,
    now: chrono::DateTime<Utc>,
) -> (Vec<Destination>, Vec<Destination>) {
    destinations.into_iter().partition(|d| d.is_due(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn dest(id: &str, interval_hours: u32, last_updated_mins_ago: Option<i64>) -> Destination {
        let now = Utc::now();
        Destination {
            id: id.to_string(),
            address: Some(format!("https://hooks.test/{id}")),
            poll_interval_hours: interval_hours,
            last_updated: last_updated_mins_ago.map(|m| now - ChronoDuration::minutes(m)),
        }
    }

    #[test]
    fn partition_respects_cadence() {
        let now = Utc::now();
        let (due, waiting) = partition_due(
            vec![
                dest("fresh", 2, Some(90)),
                dest("overdue", 2, Some(130)),
                dest("never-updated", 24, None),
            ],
            now,
        );
        let due_ids: Vec<&str> = due.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(due_ids, vec!["overdue", "never-updated"]);
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, "fresh");
    }

    #[test]
    fn interval_is_clamped_into_valid_range() {
        let now = Utc::now();
        // 0 hours would make everything due immediately; it clamps to 1.
        let d = dest("clamped", 0, Some(30));
        assert!(!d.is_due(now));
        let d = dest("clamped", 0, Some(70));
        assert!(d.is_due(now));
    }
}
