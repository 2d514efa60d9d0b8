// src/item.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::normalize::normalize_text;

/// Transient record as yielded by a feed reader. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawItem {
    pub title: Option<String>,
    pub body: String,
    pub link: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub guid: Option<String>,
}

impl RawItem {
    /// Identity used for the source's `last_seen_marker`: guid when the
    /// provider supplies one, else the link.
    pub fn identity(&self) -> Option<&str> {
        self.guid.as_deref().or(self.link.as_deref())
    }
}

/// A raw item promoted to a pipeline candidate: it carries the content
/// fingerprint (the dedup key) and the originating source id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateItem {
    pub id: String,
    pub source_id: String,
    pub title: String,
    pub body: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
    pub fingerprint: String,
}

impl CandidateItem {
    /// Promote a raw item. Returns `None` when the item lacks a title or a
    /// link; such items are not identifiable and are dropped at the edge.
    pub fn from_raw(raw: &RawItem, source_id: &str) -> Option<Self> {
        let title = raw.title.as_deref()?.to_string();
        let link = raw.link.as_deref()?.to_string();
        let fingerprint = fingerprint(&title, &link);
        let id = raw.identity().map(str::to_string)?;
        Some(Self {
            id,
            source_id: source_id.to_string(),
            title,
            body: raw.body.clone(),
            link,
            published_at: raw.published_at,
            fingerprint,
        })
    }
}

/// Content fingerprint: SHA-256 over normalized title + link. Derived only
/// from content, so two sources reporting the same story collapse to one
/// logical item and the value is stable across process restarts.
pub fn fingerprint(title: &str, link: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(title).to_lowercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(link.trim().as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Outcome of the two-stage filter for a single candidate. Produced once
/// per item per cycle, never cached across items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterDecision {
    pub accept: bool,
    pub reason: String,
    /// 0..=100
    pub confidence: u8,
    pub category: String,
}

/// A polled external source, owned by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub id: String,
    pub uri: String,
    /// Opaque cursor into the provider's ordering: identity of the newest
    /// item already yielded.
    pub last_seen_marker: Option<String>,
    pub active: bool,
}

/// A delivery target with its own update cadence, owned by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Destination {
    pub id: String,
    /// Webhook URL / channel address. `None` means not yet configured.
    pub address: Option<String>,
    /// 1..=168
    pub poll_interval_hours: u32,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Destination {
    /// Whether enough time has elapsed since the last update for this
    /// destination to take part in the current cycle.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let hours = self.poll_interval_hours.clamp(1, 168) as i64;
        match self.last_updated {
            None => true,
            Some(ts) => now.signed_duration_since(ts) >= chrono::Duration::hours(hours),
        }
    }
}

/// A keyword consulted by Stage A and passed as context to Stage B.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExclusionRule {
    pub keyword: String,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn fingerprint_is_deterministic_and_content_addressed() {
        let a = fingerprint("Fed holds rates", "https://example.com/a");
        let b = fingerprint("  Fed   holds rates ", "https://example.com/a");
        let c = fingerprint("Fed holds rates", "https://example.com/b");
        assert_eq!(a, b, "normalization must collapse whitespace");
        assert_ne!(a, c, "link participates in the fingerprint");
        assert_eq!(a, fingerprint("Fed holds rates", "https://example.com/a"));
    }

    #[test]
    fn fingerprint_is_case_insensitive_on_title() {
        assert_eq!(
            fingerprint("Big News", "https://x.test/1"),
            fingerprint("big news", "https://x.test/1"),
        );
    }

    #[test]
    fn from_raw_requires_title_and_link() {
        let mut raw = RawItem {
            title: None,
            body: "b".into(),
            link: Some("https://x.test/1".into()),
            published_at: None,
            guid: None,
        };
        assert!(CandidateItem::from_raw(&raw, "s1").is_none());
        raw.title = Some("t".into());
        let item = CandidateItem::from_raw(&raw, "s1").unwrap();
        assert_eq!(item.id, "https://x.test/1");
        assert_eq!(item.source_id, "s1");

        raw.guid = Some("guid-1".into());
        assert_eq!(CandidateItem::from_raw(&raw, "s1").unwrap().id, "guid-1");
    }

    #[test]
    fn cadence_gating_compares_elapsed_against_interval() {
        let now = Utc::now();
        let mut dest = Destination {
            id: "d1".into(),
            address: Some("https://hook.test".into()),
            poll_interval_hours: 2,
            last_updated: Some(now - Duration::minutes(90)),
        };
        assert!(!dest.is_due(now));
        dest.last_updated = Some(now - Duration::minutes(130));
        assert!(dest.is_due(now));
        dest.last_updated = None;
        assert!(dest.is_due(now));
    }
}
