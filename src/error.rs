// src/error.rs
use std::time::Duration;

/// Error taxonomy for the ingestion pipeline.
///
/// Errors scoped to one source/item/destination are caught at the unit
/// boundary, logged, and converted into an empty/skip outcome; only
/// `CycleAbort` (raised before any per-unit work starts) fails a whole
/// scheduler cycle.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Network or parse failure while fetching a source. Retried inside the
    /// poller, then isolated per source.
    #[error("source fetch failed: {0}")]
    SourceFetch(String),

    /// The backing store cannot be used. Fatal to the invoking operation.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A filter decision did not arrive inside the per-item budget. The
    /// item is dropped for the current destination; filtering is fail-open
    /// everywhere else.
    #[error("filter decision timed out after {0:?}")]
    FilterTimeout(Duration),

    /// The classifier replied with something unusable. Callers fail open.
    #[error("filter response parse failed: {0}")]
    FilterParse(String),

    /// Delivery to the downstream channel failed after retries.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Dispatch was invoked for a destination without a delivery target.
    #[error("destination {0} has no delivery target")]
    NoDeliveryTarget(String),

    /// Failure before the cycle partitioned work into units.
    #[error("cycle aborted: {0}")]
    CycleAbort(String),

    /// Broken internal plumbing (closed channels, poisoned state).
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
