// src/sources/mod.rs
pub mod rss;

use async_trait::async_trait;

use crate::error::Result;
use crate::item::RawItem;

pub use rss::RssFeedReader;

/// Collaborator seam for fetching raw items from a source URI. Items come
/// back in provider order (newest first for RSS); the poller's boundary
/// stop depends on that order being stable.
#[async_trait]
pub trait FeedReader: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<Vec<RawItem>>;
}
