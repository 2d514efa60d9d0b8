// src/store/json.rs
//! JSON-file-backed store. One file holds the whole durable state; every
//! mutation rewrites it atomically (tmp file + rename) so a crash never
//! leaves a half-written store behind.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::item::{CandidateItem, Destination, ExclusionRule, Source};
use crate::store::Store;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Persisted {
    #[serde(default)]
    seen: HashMap<String, DateTime<Utc>>,
    #[serde(default)]
    sources: Vec<Source>,
    #[serde(default)]
    destinations: Vec<Destination>,
    #[serde(default)]
    rules: Vec<ExclusionRule>,
}

pub struct JsonStore {
    path: PathBuf,
    state: Mutex<Persisted>,
    retention_days: i64,
}

impl JsonStore {
    /// Open (or create) the store file. A missing file starts empty; an
    /// unreadable or unparseable one is `StoreUnavailable`.
    pub fn open<P: AsRef<Path>>(path: P, retention_days: i64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| PipelineError::StoreUnavailable(format!("create {dir:?}: {e}")))?;
        }
        let state = match fs::read_to_string(&path) {
            Ok(s) => serde_json::from_str(&s)
                .map_err(|e| PipelineError::StoreUnavailable(format!("parse {path:?}: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Persisted::default(),
            Err(e) => {
                return Err(PipelineError::StoreUnavailable(format!("read {path:?}: {e}")))
            }
        };
        info!(path = %path.display(), seen = state.seen.len(), "json store opened");
        Ok(Self {
            path,
            state: Mutex::new(state),
            retention_days,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Persisted>> {
        self.state
            .lock()
            .map_err(|_| PipelineError::StoreUnavailable("json store mutex poisoned".into()))
    }

    /// Write-through: serialize under the lock, then tmp-write + rename.
    fn persist(&self, state: &Persisted) -> Result<()> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| PipelineError::StoreUnavailable(format!("serialize: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(json.as_bytes())?;
            fs::rename(&tmp, &self.path)?;
            Ok(())
        };
        write().map_err(|e| {
            PipelineError::StoreUnavailable(format!("write {:?}: {e}", self.path))
        })
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Persisted) -> T) -> Result<T> {
        let mut state = self.lock()?;
        let out = f(&mut state);
        self.persist(&state)?;
        Ok(out)
    }
}

#[async_trait]
impl Store for JsonStore {
    async fn is_seen(&self, fingerprint: &str) -> Result<bool> {
        Ok(self.lock()?.seen.contains_key(fingerprint))
    }

    async fn mark_seen(&self, item: &CandidateItem) -> Result<()> {
        self.mutate(|s| {
            s.seen.entry(item.fingerprint.clone()).or_insert_with(Utc::now);
        })
    }

    async fn retention_cleanup(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(self.retention_days);
        self.mutate(|s| {
            let before = s.seen.len();
            s.seen.retain(|_, seen_at| *seen_at >= cutoff);
            before - s.seen.len()
        })
    }

    async fn destinations(&self) -> Result<Vec<Destination>> {
        Ok(self.lock()?.destinations.clone())
    }

    async fn update_destination(&self, id: &str, last_updated: DateTime<Utc>) -> Result<()> {
        self.mutate(|s| {
            if let Some(dest) = s.destinations.iter_mut().find(|d| d.id == id) {
                dest.last_updated = Some(last_updated);
            }
        })
    }

    async fn sources(&self) -> Result<Vec<Source>> {
        Ok(self.lock()?.sources.clone())
    }

    async fn add_source(&self, source: Source) -> Result<()> {
        self.mutate(|s| {
            s.sources.retain(|x| x.id != source.id);
            s.sources.push(source);
        })
    }

    async fn remove_source(&self, id: &str) -> Result<bool> {
        self.mutate(|s| {
            let before = s.sources.len();
            s.sources.retain(|x| x.id != id);
            s.sources.len() < before
        })
    }

    async fn update_source_marker(&self, id: &str, marker: &str) -> Result<()> {
        self.mutate(|s| {
            if let Some(src) = s.sources.iter_mut().find(|x| x.id == id) {
                src.last_seen_marker = Some(marker.to_string());
            }
        })
    }

    async fn exclusion_rules(&self) -> Result<Vec<ExclusionRule>> {
        Ok(self.lock()?.rules.clone())
    }

    async fn add_exclusion_rule(&self, rule: ExclusionRule) -> Result<()> {
        self.mutate(|s| {
            s.rules
                .retain(|r| !r.keyword.eq_ignore_ascii_case(&rule.keyword));
            s.rules.push(rule);
        })
    }

    async fn remove_exclusion_rule(&self, keyword: &str) -> Result<bool> {
        self.mutate(|s| {
            let before = s.rules.len();
            s.rules.retain(|r| !r.keyword.eq_ignore_ascii_case(keyword));
            s.rules.len() < before
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::fingerprint;

    fn item(title: &str, link: &str) -> CandidateItem {
        CandidateItem {
            id: link.to_string(),
            source_id: "s1".into(),
            title: title.to_string(),
            body: String::new(),
            link: link.to_string(),
            published_at: None,
            fingerprint: fingerprint(title, link),
        }
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = JsonStore::open(&path, 30).unwrap();
        let it = item("reopened", "https://x.test/r");
        store.mark_seen(&it).await.unwrap();
        store
            .add_exclusion_rule(ExclusionRule {
                keyword: "sports".into(),
                active: true,
            })
            .await
            .unwrap();
        drop(store);

        let store = JsonStore::open(&path, 30).unwrap();
        assert!(store.is_seen(&it.fingerprint).await.unwrap());
        let rules = store.exclusion_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].keyword, "sports");
    }

    #[tokio::test]
    async fn corrupt_file_is_store_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "not json").unwrap();
        let err = JsonStore::open(&path, 30).err().expect("open must fail");
        assert!(matches!(err, PipelineError::StoreUnavailable(_)));
    }
}
