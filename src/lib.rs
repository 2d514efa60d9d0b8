// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod classify;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod item;
pub mod normalize;
pub mod notify;
pub mod poller;
pub mod scheduler;
pub mod sources;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::classify::{Classifier, DisabledClassifier, MockClassifier, OpenAiClassifier};
pub use crate::dedup::{DedupConfig, Deduplicator};
pub use crate::dispatch::{DispatchConfig, DispatchReport, Dispatcher};
pub use crate::error::PipelineError;
pub use crate::filter::{FilterManager, FilterQueue};
pub use crate::item::{
    fingerprint, CandidateItem, Destination, ExclusionRule, FilterDecision, RawItem, Source,
};
pub use crate::notify::{DeliveryChannel, RenderedItem, WebhookChannel};
pub use crate::poller::{Poller, PollerConfig};
pub use crate::scheduler::{CycleOutcome, Scheduler, SchedulerConfig};
pub use crate::sources::{FeedReader, RssFeedReader};
pub use crate::store::{JsonStore, MemoryStore, Store};
