// src/notify/mod.rs
pub mod webhook;

use async_trait::async_trait;

use crate::error::Result;
use crate::item::{CandidateItem, FilterDecision};

pub use webhook::WebhookChannel;

/// What actually goes out to a destination for one accepted item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedItem {
    pub title: String,
    pub link: String,
    pub category: String,
    /// 0..=100, from the filter decision.
    pub confidence: u8,
}

impl RenderedItem {
    pub fn from_accepted(item: &CandidateItem, decision: &FilterDecision) -> Self {
        Self {
            title: item.title.clone(),
            link: item.link.clone(),
            category: decision.category.clone(),
            confidence: decision.confidence,
        }
    }
}

/// Collaborator seam for delivering one rendered item to an address.
/// A single attempt only — the dispatcher owns retries and pacing.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send(&self, address: &str, item: &RenderedItem) -> Result<()>;
    fn channel_name(&self) -> &'static str;
}
