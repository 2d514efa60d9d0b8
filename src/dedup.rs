// src/dedup.rs
//! Two-layer deduplicator: a bounded in-memory recency set in front of the
//! persistent seen-store. The in-memory set is a latency optimization only;
//! every negative is confirmed against the store before an item counts as
//! new. On any internal error the answer is "not a duplicate" — downstream
//! idempotency rests on the durable mark-seen before dispatch, not here.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::item::CandidateItem;
use crate::store::Store;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "dedup_recent_hits_total",
            "Duplicates answered by the in-memory recency set."
        );
        describe_counter!(
            "dedup_store_hits_total",
            "Duplicates answered by the persistent seen-store."
        );
        describe_counter!("dedup_new_total", "Items confirmed new by both layers.");
        describe_counter!(
            "dedup_resets_total",
            "Scheduled clears of the in-memory recency set."
        );
    });
}

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// In-memory recency set capacity.
    pub capacity: usize,
    /// Uptime interval after which the in-memory set is cleared and a
    /// persistent retention cleanup is spawned.
    pub reset_interval: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            reset_interval: Duration::from_secs(24 * 3600),
        }
    }
}

/// Insertion-ordered bounded set. When capacity is exceeded, the oldest
/// ~10% are evicted — a soft cache, so coarse eviction is fine; false
/// negatives are corrected by the persistent check.
#[derive(Debug)]
struct RecentSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl RecentSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(10_000)),
            members: HashSet::with_capacity(capacity.min(10_000)),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, fingerprint: &str) -> bool {
        self.members.contains(fingerprint)
    }

    fn insert(&mut self, fingerprint: &str) {
        if !self.members.insert(fingerprint.to_string()) {
            return;
        }
        self.order.push_back(fingerprint.to_string());
        if self.order.len() > self.capacity {
            let evict = (self.capacity / 10).max(1);
            for _ in 0..evict {
                if let Some(old) = self.order.pop_front() {
                    self.members.remove(&old);
                }
            }
            debug!(evicted = evict, "recency set over capacity, evicted oldest");
        }
    }

    fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

pub struct Deduplicator {
    store: Arc<dyn Store>,
    recent: Mutex<RecentSet>,
    last_reset: Mutex<Instant>,
    reset_interval: Duration,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn Store>, cfg: DedupConfig) -> Self {
        ensure_metrics_described();
        Self {
            store,
            recent: Mutex::new(RecentSet::new(cfg.capacity)),
            last_reset: Mutex::new(Instant::now()),
            reset_interval: cfg.reset_interval,
        }
    }

    /// Whether this item was seen before. Consults the recency set first,
    /// then the store; a store hit is backfilled into the recency set.
    /// Any internal failure, a poisoned lock included, answers "new".
    pub async fn is_duplicate(&self, item: &CandidateItem) -> bool {
        self.maybe_reset();

        let fp = item.fingerprint.as_str();
        match self.recent.lock() {
            Ok(recent) => {
                if recent.contains(fp) {
                    counter!("dedup_recent_hits_total").increment(1);
                    return true;
                }
            }
            Err(_) => {
                warn!(fingerprint = fp, "recency set lock poisoned, treating as new");
                return false;
            }
        }

        match self.store.is_seen(fp).await {
            Ok(true) => {
                if let Ok(mut recent) = self.recent.lock() {
                    recent.insert(fp);
                }
                counter!("dedup_store_hits_total").increment(1);
                true
            }
            Ok(false) => {
                if let Ok(mut recent) = self.recent.lock() {
                    recent.insert(fp);
                }
                counter!("dedup_new_total").increment(1);
                false
            }
            Err(e) => {
                // Best-effort suppression: report "new" and let the durable
                // mark-seen guard idempotency.
                warn!(error = %e, fingerprint = fp, "dedup store check failed, treating as new");
                false
            }
        }
    }

    /// Keep only items not previously seen, preserving order.
    pub async fn filter_new(&self, items: Vec<CandidateItem>) -> Vec<CandidateItem> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if !self.is_duplicate(&item).await {
                out.push(item);
            }
        }
        out
    }

    /// Every `reset_interval` of uptime: clear the recency set and spawn a
    /// persistent retention cleanup on its own error boundary. Cleanup
    /// failures are logged and never reach the caller.
    fn maybe_reset(&self) {
        let Ok(mut last) = self.last_reset.lock() else {
            return;
        };
        if last.elapsed() < self.reset_interval {
            return;
        }
        *last = Instant::now();
        drop(last);

        let dropped = {
            let Ok(mut recent) = self.recent.lock() else {
                return;
            };
            let n = recent.len();
            recent.clear();
            n
        };
        counter!("dedup_resets_total").increment(1);
        info!(dropped, "recency set reset, spawning retention cleanup");

        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            match store.retention_cleanup().await {
                Ok(removed) => info!(removed, "retention cleanup finished"),
                Err(e) => warn!(error = %e, "retention cleanup failed"),
            }
        });
    }

    #[cfg(test)]
    fn recent_len(&self) -> usize {
        self.recent.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, Result as PipelineResult};
    use crate::item::{fingerprint, Destination, ExclusionRule, Source};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    /// Store whose retention cleanup always fails; everything else
    /// delegates to an in-memory store.
    struct FailingCleanupStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl Store for FailingCleanupStore {
        async fn is_seen(&self, fingerprint: &str) -> PipelineResult<bool> {
            self.inner.is_seen(fingerprint).await
        }
        async fn mark_seen(&self, item: &CandidateItem) -> PipelineResult<()> {
            self.inner.mark_seen(item).await
        }
        async fn retention_cleanup(&self) -> PipelineResult<usize> {
            Err(PipelineError::StoreUnavailable("cleanup refused".into()))
        }
        async fn destinations(&self) -> PipelineResult<Vec<Destination>> {
            self.inner.destinations().await
        }
        async fn update_destination(
            &self,
            id: &str,
            last_updated: DateTime<Utc>,
        ) -> PipelineResult<()> {
            self.inner.update_destination(id, last_updated).await
        }
        async fn sources(&self) -> PipelineResult<Vec<Source>> {
            self.inner.sources().await
        }
        async fn add_source(&self, source: Source) -> PipelineResult<()> {
            self.inner.add_source(source).await
        }
        async fn remove_source(&self, id: &str) -> PipelineResult<bool> {
            self.inner.remove_source(id).await
        }
        async fn update_source_marker(&self, id: &str, marker: &str) -> PipelineResult<()> {
            self.inner.update_source_marker(id, marker).await
        }
        async fn exclusion_rules(&self) -> PipelineResult<Vec<ExclusionRule>> {
            self.inner.exclusion_rules().await
        }
        async fn add_exclusion_rule(&self, rule: ExclusionRule) -> PipelineResult<()> {
            self.inner.add_exclusion_rule(rule).await
        }
        async fn remove_exclusion_rule(&self, keyword: &str) -> PipelineResult<bool> {
            self.inner.remove_exclusion_rule(keyword).await
        }
    }

    fn item(n: usize) -> CandidateItem {
        let title = format!("title {n}");
        let link = format!("https://x.test/{n}");
        CandidateItem {
            id: link.clone(),
            source_id: "s1".into(),
            title: title.clone(),
            body: String::new(),
            link: link.clone(),
            published_at: None,
            fingerprint: fingerprint(&title, &link),
        }
    }

    #[tokio::test]
    async fn second_sighting_is_a_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let dedup = Deduplicator::new(store, DedupConfig::default());
        let it = item(1);
        assert!(!dedup.is_duplicate(&it).await);
        assert!(dedup.is_duplicate(&it).await);
    }

    #[tokio::test]
    async fn durable_mark_survives_recency_reset() {
        let store = Arc::new(MemoryStore::new());
        let dedup = Deduplicator::new(
            Arc::clone(&store) as Arc<dyn Store>,
            DedupConfig::default(),
        );
        let it = item(2);
        assert!(!dedup.is_duplicate(&it).await);
        store.mark_seen(&it).await.unwrap();

        // Simulate the 24h clear: the store still answers "seen".
        dedup.recent.lock().unwrap().clear();
        assert!(dedup.is_duplicate(&it).await);
    }

    #[tokio::test]
    async fn eviction_keeps_set_bounded() {
        let store = Arc::new(MemoryStore::new());
        let dedup = Deduplicator::new(
            store,
            DedupConfig {
                capacity: 100,
                ..Default::default()
            },
        );
        for n in 0..150 {
            let _ = dedup.is_duplicate(&item(n)).await;
        }
        assert!(dedup.recent_len() <= 100);
    }

    #[tokio::test]
    async fn scheduled_reset_clears_recency_and_runs_retention_cleanup() {
        // Retention window of zero days: any durable mark is expired the
        // moment the spawned cleanup runs.
        let store = Arc::new(MemoryStore::with_retention_days(0));
        let dedup = Deduplicator::new(
            Arc::clone(&store) as Arc<dyn Store>,
            DedupConfig {
                reset_interval: Duration::from_millis(50),
                ..Default::default()
            },
        );

        let it = item(1);
        assert!(!dedup.is_duplicate(&it).await);
        store.mark_seen(&it).await.unwrap();
        assert_eq!(store.seen_count(), 1);
        assert_eq!(dedup.recent_len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        // First check past the interval fires the reset.
        let _ = dedup.is_duplicate(&item(2)).await;
        assert_eq!(dedup.recent_len(), 1, "set cleared before the new insert");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            store.seen_count(),
            0,
            "spawned retention cleanup must prune expired marks"
        );
    }

    #[tokio::test]
    async fn failing_retention_cleanup_leaves_dedup_working() {
        let store = Arc::new(FailingCleanupStore {
            inner: MemoryStore::new(),
        });
        let dedup = Deduplicator::new(
            Arc::clone(&store) as Arc<dyn Store>,
            DedupConfig {
                reset_interval: Duration::from_millis(200),
                ..Default::default()
            },
        );

        assert!(!dedup.is_duplicate(&item(3)).await);
        tokio::time::sleep(Duration::from_millis(250)).await;

        // Reset fires here; the spawned cleanup fails in the background
        // and must not disturb the answers.
        assert!(!dedup.is_duplicate(&item(4)).await);
        assert!(dedup.is_duplicate(&item(4)).await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(dedup.is_duplicate(&item(4)).await);
    }

    #[tokio::test]
    async fn poisoned_recency_lock_reports_not_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let dedup = Deduplicator::new(
            Arc::clone(&store) as Arc<dyn Store>,
            DedupConfig::default(),
        );
        let it = item(9);
        store.mark_seen(&it).await.unwrap();
        assert!(dedup.is_duplicate(&it).await);

        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = dedup.recent.lock().unwrap();
            panic!("poison the recency lock");
        }));
        assert!(
            !dedup.is_duplicate(&it).await,
            "internal dedup failure must degrade to not-a-duplicate"
        );
    }

    #[tokio::test]
    async fn filter_new_preserves_order_and_drops_seen() {
        let store = Arc::new(MemoryStore::new());
        let dedup = Deduplicator::new(
            Arc::clone(&store) as Arc<dyn Store>,
            DedupConfig::default(),
        );
        store.mark_seen(&item(1)).await.unwrap();

        let out = dedup.filter_new(vec![item(0), item(1), item(2)]).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, item(0).id);
        assert_eq!(out[1].id, item(2).id);
    }
}
