// src/store/mod.rs
pub mod json;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::item::{CandidateItem, Destination, ExclusionRule, Source};

pub use json::JsonStore;
pub use memory::MemoryStore;

/// Durable state behind the pipeline: the seen-set, sources, destinations
/// and exclusion rules. The store is the single source of durable truth;
/// implementations must serialize conflicting writes to the same row
/// (last-writer-wins on `last_updated` is acceptable).
///
/// Every operation fails with `PipelineError::StoreUnavailable` when the
/// backing store cannot be used.
#[async_trait]
pub trait Store: Send + Sync {
    /// Whether this fingerprint was ever durably marked seen.
    async fn is_seen(&self, fingerprint: &str) -> Result<bool>;

    /// Durably mark an item seen. Idempotent; the first mark wins the
    /// `seen_at` timestamp used by retention cleanup.
    async fn mark_seen(&self, item: &CandidateItem) -> Result<()>;

    /// Drop seen-marks older than the store's retention window. Returns the
    /// number of marks removed.
    async fn retention_cleanup(&self) -> Result<usize>;

    async fn destinations(&self) -> Result<Vec<Destination>>;
    async fn update_destination(&self, id: &str, last_updated: DateTime<Utc>) -> Result<()>;

    async fn sources(&self) -> Result<Vec<Source>>;
    async fn add_source(&self, source: Source) -> Result<()>;
    async fn remove_source(&self, id: &str) -> Result<bool>;
    async fn update_source_marker(&self, id: &str, marker: &str) -> Result<()>;

    async fn exclusion_rules(&self) -> Result<Vec<ExclusionRule>>;
    async fn add_exclusion_rule(&self, rule: ExclusionRule) -> Result<()>;
    async fn remove_exclusion_rule(&self, keyword: &str) -> Result<bool>;
}
