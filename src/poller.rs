// src/poller.rs
//! Concurrent source poller. Fans out over sources in fixed-size batches,
//! collapses concurrent polls of the same source onto one in-flight fetch,
//! retries with exponential backoff, and applies the marker boundary stop
//! so already-processed items are never re-scanned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::dedup::Deduplicator;
use crate::error::{PipelineError, Result};
use crate::item::{CandidateItem, RawItem, Source};
use crate::sources::FeedReader;
use crate::store::Store;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("poll_items_total", "New candidate items produced by polling.");
        describe_counter!(
            "poll_source_errors_total",
            "Sources that failed a cycle after exhausting retries."
        );
        describe_counter!(
            "poll_collapsed_total",
            "Poll requests that attached to an already in-flight fetch."
        );
        describe_counter!(
            "poll_reentrant_skips_total",
            "Full poll cycles skipped because one was already running."
        );
    });
}

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    /// Sources polled concurrently per batch.
    pub batch_width: usize,
    /// Max new items accepted from one source per cycle.
    pub per_source_cap: usize,
    /// Fetch attempts per source before the source fails this cycle.
    pub max_attempts: u32,
    /// Backoff unit; attempt n sleeps `backoff_base * 2^n`.
    pub backoff_base: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            batch_width: 5,
            per_source_cap: 5,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

type SharedPoll = Shared<BoxFuture<'static, Vec<CandidateItem>>>;

pub struct Poller {
    reader: Arc<dyn FeedReader>,
    store: Arc<dyn Store>,
    dedup: Arc<Deduplicator>,
    cfg: PollerConfig,
    /// Source id → in-flight fetch; a second caller awaits the first
    /// caller's result instead of issuing a duplicate fetch. Each entry is
    /// removed by the fetch task itself as its last step, never by the
    /// callers awaiting it.
    in_flight: Arc<tokio::sync::Mutex<HashMap<String, SharedPoll>>>,
    /// Whole-cycle exclusivity: a concurrent `poll_all` returns empty.
    cycle_gate: tokio::sync::Mutex<()>,
}

impl Poller {
    pub fn new(
        reader: Arc<dyn FeedReader>,
        store: Arc<dyn Store>,
        dedup: Arc<Deduplicator>,
        cfg: PollerConfig,
    ) -> Self {
        ensure_metrics_described();
        Self {
            reader,
            store,
            dedup,
            cfg,
            in_flight: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            cycle_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Poll every active source once. Batches of `batch_width` run
    /// concurrently; one source's failure yields an empty result for that
    /// source only. A call while another `poll_all` is in flight returns
    /// an empty map immediately.
    pub async fn poll_all(&self, sources: &[Source]) -> HashMap<String, Vec<CandidateItem>> {
        let Ok(_guard) = self.cycle_gate.try_lock() else {
            counter!("poll_reentrant_skips_total").increment(1);
            info!("poll cycle already in flight, skipping");
            return HashMap::new();
        };

        let active: Vec<&Source> = sources.iter().filter(|s| s.active).collect();
        let mut results = HashMap::with_capacity(active.len());
        for batch in active.chunks(self.cfg.batch_width) {
            let futs = batch.iter().map(|s| self.poll_source(s));
            let outs = join_all(futs).await;
            for (source, items) in batch.iter().zip(outs) {
                results.insert(source.id.clone(), items);
            }
        }

        let total: usize = results.values().map(Vec::len).sum();
        debug!(sources = active.len(), new_items = total, "poll cycle finished");
        results
    }

    /// Poll one source, collapsing onto an in-flight fetch for the same
    /// source id when one exists. Failures are already converted to an
    /// empty result inside the task.
    pub async fn poll_source(&self, source: &Source) -> Vec<CandidateItem> {
        let fut = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get(&source.id) {
                counter!("poll_collapsed_total").increment(1);
                debug!(source = %source.id, "attaching to in-flight poll");
                existing.clone()
            } else {
                let task = poll_source_task(
                    Arc::clone(&self.reader),
                    Arc::clone(&self.store),
                    Arc::clone(&self.dedup),
                    self.cfg,
                    source.clone(),
                );
                // The task removes its own entry right before resolving.
                // A slow collapsed caller waking up later therefore can
                // never delete a newer entry for the same source id.
                let map = Arc::clone(&self.in_flight);
                let id = source.id.clone();
                let fut = async move {
                    let out = task.await;
                    map.lock().await.remove(&id);
                    out
                }
                .boxed()
                .shared();
                in_flight.insert(source.id.clone(), fut.clone());
                fut
            }
        };

        fut.await
    }

    #[cfg(test)]
    async fn in_flight_len(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

/// Owned task so the future is `'static` and can be shared between
/// collapsed callers.
async fn poll_source_task(
    reader: Arc<dyn FeedReader>,
    store: Arc<dyn Store>,
    dedup: Arc<Deduplicator>,
    cfg: PollerConfig,
    source: Source,
) -> Vec<CandidateItem> {
    let raw = match fetch_with_retry(&reader, &source, cfg).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, source = %source.id, "source failed for this cycle");
            counter!("poll_source_errors_total").increment(1);
            return Vec::new();
        }
    };

    let today = Utc::now().date_naive();
    let marker = source.last_seen_marker.as_deref();
    let mut kept: Vec<CandidateItem> = Vec::new();

    // Provider order is newest-first; everything at and past the marker
    // was already processed.
    for item in &raw {
        if kept.len() >= cfg.per_source_cap {
            break;
        }
        let Some(candidate) = CandidateItem::from_raw(item, &source.id) else {
            continue;
        };
        if marker == Some(candidate.id.as_str()) {
            break;
        }
        if candidate.published_at.map(|ts| ts.date_naive()) != Some(today) {
            continue;
        }
        if dedup.is_duplicate(&candidate).await {
            continue;
        }
        kept.push(candidate);
    }

    if let Some(newest) = kept.first() {
        if let Err(e) = store.update_source_marker(&source.id, &newest.id).await {
            warn!(error = %e, source = %source.id, "failed to advance source marker");
        }
        counter!("poll_items_total").increment(kept.len() as u64);
    }

    debug!(source = %source.id, fetched = raw.len(), kept = kept.len(), "source polled");
    kept
}

async fn fetch_with_retry(
    reader: &Arc<dyn FeedReader>,
    source: &Source,
    cfg: PollerConfig,
) -> Result<Vec<RawItem>> {
    let mut last_err = None;
    for attempt in 1..=cfg.max_attempts.max(1) {
        match reader.fetch(&source.uri).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!(error = %e, source = %source.id, attempt, "source fetch attempt failed");
                last_err = Some(e);
                if attempt < cfg.max_attempts {
                    tokio::time::sleep(cfg.backoff_base * 2u32.saturating_pow(attempt)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| PipelineError::SourceFetch("no attempts made".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DedupConfig;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedReader {
        items: Vec<RawItem>,
        fail_first: usize,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedReader {
        fn new(items: Vec<RawItem>) -> Self {
            Self {
                items,
                fail_first: 0,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
        fn failing_first(mut self, n: usize) -> Self {
            self.fail_first = n;
            self
        }
        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FeedReader for ScriptedReader {
        async fn fetch(&self, _uri: &str) -> Result<Vec<RawItem>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if n < self.fail_first {
                return Err(PipelineError::SourceFetch("scripted failure".into()));
            }
            Ok(self.items.clone())
        }
    }

    fn raw(n: usize) -> RawItem {
        RawItem {
            title: Some(format!("story {n}")),
            body: format!("body {n}"),
            link: Some(format!("https://wire.test/{n}")),
            published_at: Some(Utc::now()),
            guid: Some(format!("guid-{n}")),
        }
    }

    fn source(id: &str, marker: Option<&str>) -> Source {
        Source {
            id: id.to_string(),
            uri: format!("https://feed.test/{id}"),
            last_seen_marker: marker.map(str::to_string),
            active: true,
        }
    }

    fn poller(reader: Arc<dyn FeedReader>, store: Arc<MemoryStore>) -> Poller {
        let dedup = Arc::new(Deduplicator::new(
            Arc::clone(&store) as Arc<dyn Store>,
            DedupConfig::default(),
        ));
        Poller::new(
            reader,
            store,
            dedup,
            PollerConfig {
                backoff_base: Duration::from_millis(1),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn boundary_stop_keeps_only_items_newer_than_marker() {
        // Newest-first provider order [1,2,3,4,5]; marker on #3 → [1,2].
        let reader = Arc::new(ScriptedReader::new(vec![
            raw(1),
            raw(2),
            raw(3),
            raw(4),
            raw(5),
        ]));
        let store = Arc::new(MemoryStore::new());
        let p = poller(reader, Arc::clone(&store));

        let src = source("s1", Some("guid-3"));
        let out = p.poll_all(std::slice::from_ref(&src)).await;
        let items = &out["s1"];
        assert_eq!(
            items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            vec!["guid-1", "guid-2"]
        );
        // Marker advances to the newest produced item.
        let sources = store.sources().await.unwrap();
        assert!(sources.is_empty(), "poller must not create sources");
    }

    #[tokio::test]
    async fn marker_advances_to_newest_item() {
        let reader = Arc::new(ScriptedReader::new(vec![raw(1), raw(2)]));
        let store = Arc::new(MemoryStore::new());
        store.add_source(source("s1", None)).await.unwrap();
        let p = poller(reader, Arc::clone(&store));

        let src = store.sources().await.unwrap().remove(0);
        let out = p.poll_all(std::slice::from_ref(&src)).await;
        assert_eq!(out["s1"].len(), 2);
        let sources = store.sources().await.unwrap();
        assert_eq!(sources[0].last_seen_marker.as_deref(), Some("guid-1"));
    }

    #[tokio::test]
    async fn per_source_cap_limits_output() {
        let reader = Arc::new(ScriptedReader::new((1..=10).map(raw).collect()));
        let store = Arc::new(MemoryStore::new());
        let p = poller(reader, store);

        let src = source("s1", None);
        let out = p.poll_all(std::slice::from_ref(&src)).await;
        assert_eq!(out["s1"].len(), 5);
    }

    #[tokio::test]
    async fn stale_items_are_discarded() {
        let mut old = raw(1);
        old.published_at = Some(Utc::now() - chrono::Duration::days(2));
        let reader = Arc::new(ScriptedReader::new(vec![old, raw(2)]));
        let store = Arc::new(MemoryStore::new());
        let p = poller(reader, store);

        let out = p.poll_all(std::slice::from_ref(&source("s1", None))).await;
        assert_eq!(out["s1"].len(), 1);
        assert_eq!(out["s1"][0].id, "guid-2");
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let reader = Arc::new(ScriptedReader::new(vec![raw(1)]).failing_first(2));
        let store = Arc::new(MemoryStore::new());
        let p = poller(Arc::clone(&reader) as Arc<dyn FeedReader>, store);

        let out = p.poll_all(std::slice::from_ref(&source("s1", None))).await;
        assert_eq!(out["s1"].len(), 1);
        assert_eq!(reader.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_isolate_the_source() {
        let reader = Arc::new(ScriptedReader::new(vec![raw(1)]).failing_first(10));
        let store = Arc::new(MemoryStore::new());
        let p = poller(Arc::clone(&reader) as Arc<dyn FeedReader>, store);

        let srcs = vec![source("bad", None)];
        let out = p.poll_all(&srcs).await;
        assert!(out["bad"].is_empty());
        assert_eq!(reader.calls(), 3);
    }

    #[tokio::test]
    async fn concurrent_polls_of_same_source_collapse() {
        let reader = Arc::new(
            ScriptedReader::new(vec![raw(1)]).with_delay(Duration::from_millis(50)),
        );
        let store = Arc::new(MemoryStore::new());
        let p = Arc::new(poller(
            Arc::clone(&reader) as Arc<dyn FeedReader>,
            store,
        ));

        let src = source("s1", None);
        let (a, b) = tokio::join!(p.poll_source(&src), p.poll_source(&src));
        assert_eq!(a, b);
        assert_eq!(reader.calls(), 1, "second caller must reuse the in-flight fetch");
    }

    #[tokio::test]
    async fn fetch_task_removes_its_own_in_flight_entry() {
        let reader = Arc::new(
            ScriptedReader::new(vec![raw(1)]).with_delay(Duration::from_millis(40)),
        );
        let store = Arc::new(MemoryStore::new());
        let p = Arc::new(poller(Arc::clone(&reader) as Arc<dyn FeedReader>, store));

        let src = source("s1", None);
        let (a, b) = tokio::join!(p.poll_source(&src), p.poll_source(&src));
        assert_eq!(a, b);
        assert_eq!(
            p.in_flight_len().await,
            0,
            "entry must be gone once the fetch resolved"
        );

        // A later pair starts exactly one fresh fetch; the earlier pair's
        // completion must not have clobbered anything it did not create.
        let (c, d) = tokio::join!(p.poll_source(&src), p.poll_source(&src));
        assert_eq!(c, d);
        assert_eq!(reader.calls(), 2);
        assert_eq!(p.in_flight_len().await, 0);
    }

    #[tokio::test]
    async fn reentrant_poll_all_returns_empty() {
        let reader = Arc::new(
            ScriptedReader::new(vec![raw(1)]).with_delay(Duration::from_millis(100)),
        );
        let store = Arc::new(MemoryStore::new());
        let p = Arc::new(poller(reader, store));

        let src = source("s1", None);
        let first = {
            let p = Arc::clone(&p);
            let src = src.clone();
            tokio::spawn(async move { p.poll_all(std::slice::from_ref(&src)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = p.poll_all(std::slice::from_ref(&src)).await;
        assert!(second.is_empty(), "concurrent cycle must be a no-op");
        let first = first.await.unwrap();
        assert_eq!(first["s1"].len(), 1);
    }
}
