// src/store/memory.rs
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::{PipelineError, Result};
use crate::item::{CandidateItem, Destination, ExclusionRule, Source};
use crate::store::Store;

#[derive(Debug, Default)]
struct State {
    seen: HashMap<String, DateTime<Utc>>,
    sources: Vec<Source>,
    destinations: Vec<Destination>,
    rules: Vec<ExclusionRule>,
}

/// In-memory store. Backs tests and local dry-runs; everything evaporates
/// with the process.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    retention_days: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_retention_days(30)
    }

    pub fn with_retention_days(retention_days: i64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            retention_days,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| PipelineError::StoreUnavailable("memory store mutex poisoned".into()))
    }

    /// Test helper: number of durably seen fingerprints.
    pub fn seen_count(&self) -> usize {
        self.state.lock().map(|s| s.seen.len()).unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn is_seen(&self, fingerprint: &str) -> Result<bool> {
        Ok(self.lock()?.seen.contains_key(fingerprint))
    }

    async fn mark_seen(&self, item: &CandidateItem) -> Result<()> {
        self.lock()?
            .seen
            .entry(item.fingerprint.clone())
            .or_insert_with(Utc::now);
        Ok(())
    }

    async fn retention_cleanup(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(self.retention_days);
        let mut state = self.lock()?;
        let before = state.seen.len();
        state.seen.retain(|_, seen_at| *seen_at >= cutoff);
        Ok(before - state.seen.len())
    }

    async fn destinations(&self) -> Result<Vec<Destination>> {
        Ok(self.lock()?.destinations.clone())
    }

    async fn update_destination(&self, id: &str, last_updated: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(dest) = state.destinations.iter_mut().find(|d| d.id == id) {
            dest.last_updated = Some(last_updated);
        }
        Ok(())
    }

    async fn sources(&self) -> Result<Vec<Source>> {
        Ok(self.lock()?.sources.clone())
    }

    async fn add_source(&self, source: Source) -> Result<()> {
        let mut state = self.lock()?;
        state.sources.retain(|s| s.id != source.id);
        state.sources.push(source);
        Ok(())
    }

    async fn remove_source(&self, id: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let before = state.sources.len();
        state.sources.retain(|s| s.id != id);
        Ok(state.sources.len() < before)
    }

    async fn update_source_marker(&self, id: &str, marker: &str) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(src) = state.sources.iter_mut().find(|s| s.id == id) {
            src.last_seen_marker = Some(marker.to_string());
        }
        Ok(())
    }

    async fn exclusion_rules(&self) -> Result<Vec<ExclusionRule>> {
        Ok(self.lock()?.rules.clone())
    }

    async fn add_exclusion_rule(&self, rule: ExclusionRule) -> Result<()> {
        let mut state = self.lock()?;
        state
            .rules
            .retain(|r| !r.keyword.eq_ignore_ascii_case(&rule.keyword));
        state.rules.push(rule);
        Ok(())
    }

    async fn remove_exclusion_rule(&self, keyword: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let before = state.rules.len();
        state
            .rules
            .retain(|r| !r.keyword.eq_ignore_ascii_case(keyword));
        Ok(state.rules.len() < before)
    }
}

/// Test helper: build a destination with sane defaults.
pub fn test_destination(id: &str, interval_hours: u32) -> Destination {
    Destination {
        id: id.to_string(),
        address: Some(format!("https://hooks.test/{id}")),
        poll_interval_hours: interval_hours,
        last_updated: None,
    }
}

impl MemoryStore {
    /// Seed helpers used by tests and local bootstrap.
    pub fn seed_destination(&self, dest: Destination) {
        if let Ok(mut s) = self.state.lock() {
            s.destinations.retain(|d| d.id != dest.id);
            s.destinations.push(dest);
        }
    }
}
