// src/filter/mod.rs
//! Two-stage filter. Stage A is a synchronous, exact keyword exclusion —
//! cheap and deterministic, so it runs first and short-circuits without a
//! remote call. Stage B asks the remote classifier and is advisory: any
//! failure to obtain or parse a well-formed response degrades to accept.
//! Losing an item silently is worse than over-posting, so the filter is
//! fail-open, never fail-closed.

pub mod queue;

use std::sync::Arc;

use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::classify::Classifier;
use crate::error::PipelineError;
use crate::item::{CandidateItem, FilterDecision};
use crate::normalize::normalize_text;
use crate::store::Store;

pub use queue::FilterQueue;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "filter_stage_a_rejects_total",
            "Items rejected by keyword exclusion without a remote call."
        );
        describe_counter!("filter_accepts_total", "Items accepted by the filter.");
        describe_counter!(
            "filter_rejects_total",
            "Items rejected by semantic classification."
        );
        describe_counter!(
            "filter_fallback_accepts_total",
            "Fail-open accepts after a missing or malformed classifier response."
        );
    });
}

pub struct FilterManager {
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn Store>,
}

impl FilterManager {
    pub fn new(classifier: Arc<dyn Classifier>, store: Arc<dyn Store>) -> Self {
        ensure_metrics_described();
        Self { classifier, store }
    }

    /// Combined decision for one item. Stage A rejection short-circuits;
    /// otherwise Stage B's result is final.
    pub async fn should_post(&self, item: &CandidateItem) -> FilterDecision {
        let rules = match self.store.exclusion_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                // No rules beats no items: proceed with an empty rule set.
                warn!(error = %e, "failed to load exclusion rules, skipping Stage A");
                Vec::new()
            }
        };
        let keywords: Vec<String> = rules
            .iter()
            .filter(|r| r.active)
            .map(|r| r.keyword.clone())
            .collect();

        if let Some(matched) = stage_a(item, &keywords) {
            counter!("filter_stage_a_rejects_total").increment(1);
            debug!(item = %item.id, keyword = %matched, "stage A keyword rejection");
            return FilterDecision {
                accept: false,
                reason: format!("matched exclusion keyword \"{matched}\""),
                confidence: 100,
                category: "Excluded".to_string(),
            };
        }

        let decision = self.stage_b(item, &keywords).await;
        if decision.accept {
            counter!("filter_accepts_total").increment(1);
        } else {
            counter!("filter_rejects_total").increment(1);
        }
        decision
    }

    async fn stage_b(&self, item: &CandidateItem, keywords: &[String]) -> FilterDecision {
        let prompt = build_prompt(item, keywords);
        match self.classifier.classify(&prompt).await {
            Some(text) => parse_decision(&text),
            None => {
                counter!("filter_fallback_accepts_total").increment(1);
                debug!(item = %item.id, "classifier gave no signal, failing open");
                fallback_accept("no classifier signal; failing open")
            }
        }
    }
}

/// Stage A: case-insensitive substring match of any active keyword against
/// the normalized title+body. Returns the matched keyword.
fn stage_a<'a>(item: &CandidateItem, keywords: &'a [String]) -> Option<&'a str> {
    if keywords.is_empty() {
        return None;
    }
    let haystack = normalize_text(&format!("{} {}", item.title, item.body)).to_lowercase();
    keywords
        .iter()
        .map(String::as_str)
        .find(|kw| !kw.trim().is_empty() && haystack.contains(kw.trim().to_lowercase().as_str()))
}

fn build_prompt(item: &CandidateItem, keywords: &[String]) -> String {
    let excluded = if keywords.is_empty() {
        "(none)".to_string()
    } else {
        keywords.join(", ")
    };
    format!(
        "Decide whether this news item should be posted.\n\
         Excluded topics (already rejected when matched literally, use them \
         as context for borderline semantic matches): {excluded}\n\n\
         Title: {}\n\
         Body: {}\n\n\
         Reply with one JSON object: {{\"decision\": bool, \"confidence\": 0-100, \
         \"reason\": string, \"category\": string}}",
        item.title,
        normalize_text(&item.body),
    )
}

/// Raw shape of the classifier reply; everything optional so partially
/// well-formed responses still parse.
#[derive(Debug, Deserialize)]
struct RawDecision {
    decision: Option<bool>,
    confidence: Option<i64>,
    reason: Option<String>,
    category: Option<String>,
}

/// Parse a classifier response into a decision. Strips enclosing code
/// fences, then coerces missing/out-of-range fields to safe defaults; a
/// completely unparseable response fails open with confidence 0.
pub fn parse_decision(text: &str) -> FilterDecision {
    let stripped = strip_code_fences(text);
    let raw: RawDecision = match serde_json::from_str(stripped) {
        Ok(raw) => raw,
        Err(e) => {
            let err = PipelineError::FilterParse(e.to_string());
            warn!(error = %err, "classifier response unparseable, failing open");
            counter!("filter_fallback_accepts_total").increment(1);
            return fallback_accept("classifier response unparseable; failing open");
        }
    };

    let confidence = match raw.confidence {
        Some(c) if (0..=100).contains(&c) => c as u8,
        _ => 50,
    };
    FilterDecision {
        accept: raw.decision.unwrap_or(true),
        reason: raw
            .reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "classification completed".to_string()),
        confidence,
        category: raw
            .category
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| "Unknown".to_string()),
    }
}

fn fallback_accept(reason: &str) -> FilterDecision {
    FilterDecision {
        accept: true,
        reason: reason.to_string(),
        confidence: 0,
        category: "Unknown".to_string(),
    }
}

/// Models love fencing their JSON. Accepts ```json ... ``` and bare ```.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}
