//! HTTP JSON feed source.
//!
//! Issues `GET {url}?{query_param}={topic}` and reads items from the
//! response. The response may be a bare array or an object wrapping the
//! array in `items`, `articles`, or `results`. Item fields are read
//! leniently, so both simple feeds and NewsAPI-style payloads work:
//!
//! | Field | Accepted keys |
//! |-------|---------------|
//! | title | `title` |
//! | body | `body`, `description`, `summary`, `snippet`, `content` |
//! | url | `url`, `link` |
//! | published | `published_at`, `publishedAt`, `date` (RFC 3339) |
//! | relevance | `relevance`, `score` |
//!
//! Items without a title are skipped. A missing or unparseable date
//! becomes the fetch time.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use excuse_harness_core::models::SourceItem;
use excuse_harness_core::{PipelineError, PipelineResult};

use crate::capabilities::SourceCapability;
use crate::config::SourceConfig;

pub struct HttpSource {
    name: String,
    url: String,
    query_param: String,
    trust_weight: f64,
    api_key_env: Option<String>,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(name: &str, config: &SourceConfig) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            url: config.url.clone(),
            query_param: config.query_param.clone(),
            trust_weight: config.trust_weight,
            api_key_env: config.api_key_env.clone(),
            client: reqwest::Client::builder().build()?,
        })
    }

    fn error(&self, reason: impl std::fmt::Display) -> PipelineError {
        PipelineError::SourceError {
            source_name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

fn first_str<'a>(obj: &'a serde_json::Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| obj.get(*k).and_then(|v| v.as_str()))
        .find(|s| !s.trim().is_empty())
}

fn first_f64(obj: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| obj.get(*k).and_then(|v| v.as_f64()))
}

/// Parse a feed payload into items attributed to `origin`.
pub fn parse_feed(origin: &str, json: &serde_json::Value, now: DateTime<Utc>) -> Vec<SourceItem> {
    let items = match json {
        serde_json::Value::Array(a) => Some(a),
        other => ["items", "articles", "results"]
            .iter()
            .find_map(|k| other.get(*k).and_then(|v| v.as_array())),
    };
    let Some(items) = items else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|obj| {
            let title = first_str(obj, &["title"])?.trim().to_string();
            let published_at = first_str(obj, &["published_at", "publishedAt", "date"])
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or(now);
            Some(SourceItem {
                origin: origin.to_string(),
                title,
                body: first_str(obj, &["body", "description", "summary", "snippet", "content"])
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
                url: first_str(obj, &["url", "link"]).map(str::to_string),
                published_at,
                relevance: first_f64(obj, &["relevance", "score"])
                    .unwrap_or(0.0)
                    .clamp(0.0, 1.0),
            })
        })
        .collect()
}

#[async_trait]
impl SourceCapability for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn trust_weight(&self) -> f64 {
        self.trust_weight
    }

    async fn fetch(&self, topic: &str, timeout: Duration) -> PipelineResult<Vec<SourceItem>> {
        let mut req = self
            .client
            .get(&self.url)
            .query(&[(self.query_param.as_str(), topic)])
            .timeout(timeout);
        if let Some(var) = &self.api_key_env {
            let key = std::env::var(var).map_err(|_| self.error(format!("{} not set", var)))?;
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::SourceTimeout {
                    source_name: self.name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                self.error(e)
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.error(format!("HTTP {}", status)));
        }
        let json: serde_json::Value = response.json().await.map_err(|e| self.error(e))?;
        let items = parse_feed(&self.name, &json, Utc::now());
        tracing::debug!(source = %self.name, items = items.len(), "fetched feed");
        Ok(items)
    }
}
