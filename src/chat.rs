//! Chat channel adapter.
//!
//! Thin boundary wrapper over a Slack-style `chat.postMessage` JSON API.
//! The adapter only classifies the transport outcome; all retry and backoff
//! policy lives in the dispatch loop.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt;
use tracing::debug;

use crate::config;

const CHAT_API_BASE: &str = "https://slack.com/api/";

/// Outcome of one send attempt, classified for the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    Sent,
    /// The server throttled us; `retry_after` is the parsed `Retry-After`
    /// header when the server supplied a usable one.
    RateLimited { retry_after: Option<u64> },
    /// Terminal failure for this message (bad target, bad payload, ...).
    Failed(String),
}

#[async_trait]
pub trait ChatService: Send + Sync {
    async fn send(
        &self,
        target: &str,
        text: &str,
        options: &Map<String, Value>,
    ) -> Result<ChatOutcome>;
}

#[derive(Clone)]
pub struct ChatClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    error: Option<String>,
}

impl ChatClient {
    pub fn new(token: String) -> Self {
        let base_url = Url::parse(CHAT_API_BASE).expect("valid default chat URL");
        Self::with_base_url(token, base_url)
    }

    pub fn with_base_url(token: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("notifyd/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
        }
    }

    pub fn from_config(cfg: &config::Chat) -> Result<Self> {
        let base_url = match &cfg.base_url {
            Some(url) => Url::parse(url).context("invalid chat.base_url")?,
            None => Url::parse(CHAT_API_BASE).expect("valid default chat URL"),
        };
        Ok(Self::with_base_url(cfg.api_token.clone(), base_url))
    }
}

#[async_trait]
impl ChatService for ChatClient {
    async fn send(
        &self,
        target: &str,
        text: &str,
        options: &Map<String, Value>,
    ) -> Result<ChatOutcome> {
        let endpoint = self
            .base_url
            .join("chat.postMessage")
            .context("invalid chat base URL")?;

        // text is still required for message previews even when structured
        // blocks are present.
        let mut body = options.clone();
        body.insert("channel".into(), json!(target));
        body.insert("text".into(), json!(text));

        let res = self
            .http
            .post(endpoint)
            .bearer_auth(&self.token)
            .json(&Value::Object(body))
            .send()
            .await
            .context("failed to reach chat API")?;

        let retry_after = res
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        let api: ApiResponse = res
            .json()
            .await
            .context("failed to decode chat API response")?;

        debug!(channel = target, ok = api.ok, error = ?api.error, "chat send attempt");

        if api.ok {
            return Ok(ChatOutcome::Sent);
        }
        match api.error.as_deref() {
            Some("ratelimited") => Ok(ChatOutcome::RateLimited { retry_after }),
            Some(reason) => Ok(ChatOutcome::Failed(reason.to_string())),
            None => Ok(ChatOutcome::Failed("unknown error".to_string())),
        }
    }
}
