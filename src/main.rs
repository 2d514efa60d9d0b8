//! newsgate — Binary Entrypoint
//! Wires the store, poller, filter and dispatcher together and runs the
//! scheduler on its periodic trigger until the process is stopped.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use newsgate::classify::{Classifier, DisabledClassifier, OpenAiClassifier};
use newsgate::config::AppConfig;
use newsgate::dedup::Deduplicator;
use newsgate::dispatch::Dispatcher;
use newsgate::filter::{FilterManager, FilterQueue};
use newsgate::notify::WebhookChannel;
use newsgate::poller::Poller;
use newsgate::scheduler::Scheduler;
use newsgate::sources::RssFeedReader;
use newsgate::store::{JsonStore, Store};

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("newsgate=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

fn build_classifier(cfg: &AppConfig) -> Arc<dyn Classifier> {
    if !cfg.classifier.enabled {
        return Arc::new(DisabledClassifier);
    }
    match cfg.classifier.provider.as_str() {
        "openai" => match cfg.classifier_api_key() {
            Ok(key) => Arc::new(OpenAiClassifier::new(key, cfg.classifier.model.as_deref())),
            Err(e) => {
                tracing::warn!(error = %e, "classifier key unavailable, running disabled");
                Arc::new(DisabledClassifier)
            }
        },
        other => {
            tracing::warn!(provider = other, "unknown classifier provider, running disabled");
            Arc::new(DisabledClassifier)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load_default()?;
    info!(
        store = %cfg.store_path,
        interval_mins = cfg.cycle_interval_mins,
        classifier = %cfg.classifier.provider,
        classifier_enabled = cfg.classifier.enabled,
        "newsgate starting"
    );

    let store: Arc<dyn Store> =
        Arc::new(JsonStore::open(&cfg.store_path, cfg.dedup.retention_days)?);
    let reader = Arc::new(RssFeedReader::new(
        &cfg.user_agent,
        Duration::from_secs(cfg.fetch_timeout_secs),
    ));
    let classifier = build_classifier(&cfg);
    let channel = Arc::new(WebhookChannel::new());

    let dedup = Arc::new(Deduplicator::new(Arc::clone(&store), cfg.dedup_config()));
    let poller = Arc::new(Poller::new(
        reader,
        Arc::clone(&store),
        dedup,
        cfg.poller_config(),
    ));
    let manager = Arc::new(FilterManager::new(classifier, Arc::clone(&store)));
    let queue = Arc::new(FilterQueue::new(manager, cfg.filter.workers));
    let dispatcher = Arc::new(Dispatcher::new(channel, cfg.dispatch_config()));

    let scheduler = Arc::new(Scheduler::new(
        store,
        poller,
        queue,
        dispatcher,
        cfg.scheduler_config(),
    ));
    let ticker = Arc::clone(&scheduler).spawn(cfg.cycle_interval());

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    ticker.abort();
    Ok(())
}
