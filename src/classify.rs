// src/classify.rs
//! Remote classifier seam. The pipeline only ever sees `Option<String>`:
//! `None` means "no signal" and is never propagated as a hard error —
//! the filter fails open on it.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Ask the model for a raw text response to `prompt`.
    async fn classify(&self, prompt: &str) -> Option<String>;
    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str;
}

pub type DynClassifier = Arc<dyn Classifier>;

/// OpenAI chat-completions provider. Requires an API key; an empty key
/// turns every call into "no signal".
pub struct OpenAiClassifier {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiClassifier {
    pub fn new(api_key: String, model_override: Option<&str>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("newsgate/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(20))
            .build()
            .expect("reqwest client");
        let model = model_override.unwrap_or("gpt-4o-mini").to_string();
        Self {
            http,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(&self, prompt: &str) -> Option<String> {
        if self.api_key.is_empty() {
            return None;
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let sys = "You classify news items for relevance. Respond with ONE JSON object \
                   with keys: decision (bool), confidence (0-100), reason (short string), \
                   category (single label). Output only the JSON object.";
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: sys,
                },
                Msg {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.2,
            max_tokens: 200,
        };

        let resp = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .ok()?;

        if !resp.status().is_success() {
            warn!(status = %resp.status(), "classifier returned non-success status");
            return None;
        }
        let body: Resp = resp.json().await.ok()?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.trim())
            .unwrap_or("");
        if content.is_empty() {
            None
        } else {
            Some(content.to_string())
        }
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

/// Returns `None` always; used when classification is disabled. The filter
/// then accepts everything Stage A lets through.
pub struct DisabledClassifier;

#[async_trait]
impl Classifier for DisabledClassifier {
    async fn classify(&self, _prompt: &str) -> Option<String> {
        None
    }
    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

/// Fixed-response classifier for tests. Counts calls so tests can assert
/// the Stage A short-circuit never reached the remote.
pub struct MockClassifier {
    response: Option<String>,
    calls: Mutex<usize>,
}

impl MockClassifier {
    pub fn returning(response: Option<&str>) -> Self {
        Self {
            response: response.map(str::to_string),
            calls: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().expect("mock counter poisoned")
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify(&self, _prompt: &str) -> Option<String> {
        *self.calls.lock().expect("mock counter poisoned") += 1;
        self.response.clone()
    }
    fn provider_name(&self) -> &'static str {
        "mock"
    }
}
