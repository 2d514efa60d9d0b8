// src/config.rs
//! Application configuration. Loaded from TOML with per-field defaults so
//! a missing file or a partial file both work; ranges are sanitized after
//! parse rather than rejected.
//!
//! Resolution order:
//! 1) $NEWSGATE_CONFIG
//! 2) config/newsgate.toml
//! 3) built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::dedup::DedupConfig;
use crate::dispatch::DispatchConfig;
use crate::poller::PollerConfig;
use crate::scheduler::SchedulerConfig;

const ENV_PATH: &str = "NEWSGATE_CONFIG";
const DEFAULT_PATH: &str = "config/newsgate.toml";

fn default_cycle_interval_mins() -> u64 {
    30
}
fn default_store_path() -> String {
    "data/newsgate.json".to_string()
}
fn default_user_agent() -> String {
    "newsgate/0.1".to_string()
}
fn default_fetch_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_cycle_interval_mins")]
    pub cycle_interval_mins: u64,
    #[serde(default = "default_store_path")]
    pub store_path: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default)]
    pub poller: PollerSettings,
    #[serde(default)]
    pub filter: FilterSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub dedup: DedupSettings,
    #[serde(default)]
    pub classifier: ClassifierSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults must deserialize")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    pub batch_width: usize,
    pub per_source_cap: usize,
    pub max_attempts: u32,
    pub backoff_secs: u64,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            batch_width: 5,
            per_source_cap: 5,
            max_attempts: 3,
            backoff_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub workers: usize,
    pub timeout_secs: u64,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            workers: 3,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub batch_size: usize,
    pub item_delay_ms: u64,
    pub batch_delay_ms: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            item_delay_ms: 1_000,
            batch_delay_ms: 5_000,
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub capacity: usize,
    pub reset_hours: u64,
    pub retention_days: i64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            reset_hours: 24,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    pub enabled: bool,
    /// "openai" (case-insensitive); anything else runs disabled.
    pub provider: String,
    pub model: Option<String>,
    /// "ENV" means: read from OPENAI_API_KEY.
    pub api_key: String,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "openai".to_string(),
            model: None,
            api_key: "ENV".to_string(),
        }
    }
}

impl AppConfig {
    /// Load using env var + fallback path; missing file means defaults.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("NEWSGATE_CONFIG points to non-existent path"));
            }
            return Self::load_from(&pb);
        }
        let default = PathBuf::from(DEFAULT_PATH);
        if default.exists() {
            return Self::load_from(&default);
        }
        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let mut cfg: AppConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        cfg.sanitize();
        Ok(cfg)
    }

    fn sanitize(&mut self) {
        self.cycle_interval_mins = self.cycle_interval_mins.max(1);
        self.poller.batch_width = self.poller.batch_width.clamp(1, 64);
        self.poller.per_source_cap = self.poller.per_source_cap.max(1);
        self.poller.max_attempts = self.poller.max_attempts.clamp(1, 10);
        self.filter.workers = self.filter.workers.clamp(1, 32);
        self.filter.timeout_secs = self.filter.timeout_secs.max(1);
        self.dispatch.batch_size = self.dispatch.batch_size.max(1);
        self.dispatch.max_attempts = self.dispatch.max_attempts.clamp(1, 10);
        self.dedup.capacity = self.dedup.capacity.max(100);
        self.dedup.reset_hours = self.dedup.reset_hours.max(1);
        self.dedup.retention_days = self.dedup.retention_days.max(1);
        self.classifier.provider = self.classifier.provider.to_lowercase();
    }

    /// Resolve the classifier API key; "ENV" defers to OPENAI_API_KEY.
    pub fn classifier_api_key(&self) -> Result<String> {
        if self.classifier.api_key.trim().eq_ignore_ascii_case("env") {
            env::var("OPENAI_API_KEY").map_err(|_| anyhow!("Missing OPENAI_API_KEY env var"))
        } else {
            Ok(self.classifier.api_key.clone())
        }
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_mins * 60)
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            batch_width: self.poller.batch_width,
            per_source_cap: self.poller.per_source_cap,
            max_attempts: self.poller.max_attempts,
            backoff_base: Duration::from_secs(self.poller.backoff_secs),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            batch_size: self.dispatch.batch_size,
            item_delay: Duration::from_millis(self.dispatch.item_delay_ms),
            batch_delay: Duration::from_millis(self.dispatch.batch_delay_ms),
            max_attempts: self.dispatch.max_attempts,
            backoff_base: Duration::from_millis(self.dispatch.backoff_ms),
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            capacity: self.dedup.capacity,
            reset_interval: Duration::from_secs(self.dedup.reset_hours * 3600),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            filter_timeout: Duration::from_secs(self.filter.timeout_secs),
        }
    }
}
