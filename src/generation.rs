//! Chat-completions generation adapter.
//!
//! [`ChatGenerator`] implements [`GenerationCapability`] against any
//! OpenAI-compatible `POST {base}/chat/completions` endpoint. That covers
//! OpenAI itself and Ollama's `/v1` compatibility layer.
//!
//! | Provider | Default base URL | Auth |
//! |----------|------------------|------|
//! | `openai` | `https://api.openai.com/v1` | `OPENAI_API_KEY` bearer token |
//! | `ollama` | `http://localhost:11434/v1` | none |
//!
//! The model is asked for a JSON object. Replies are parsed leniently: a
//! bare object, a fenced code block, or the first `{…}` span found in the
//! text are all accepted.
//!
//! Candidate reply shape:
//!
//! ```json
//! {"excuses": [{"text": "...", "plausibility_score": 0.8, "creativity_score": 0.6,
//!               "risk_level": "low", "explanation": "...", "news_index": 1}]}
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use excuse_harness_core::models::{
    CandidateExcuse, DraftedMessage, EvidenceBundle, ExcuseRequest, Novelty, RiskLevel,
};
use excuse_harness_core::{PipelineError, PipelineResult};

use crate::capabilities::{GenerationCapability, GenerationContext};
use crate::config::GenerationConfig;
use crate::http;

const CAPABILITY: &str = "generation";

const CANDIDATE_PROMPT: &str = r#"You write believable, clever excuses for everyday situations.
Where it helps, anchor an excuse to one of the numbered news items provided.
Return ONLY a JSON object of the form:
{"excuses": [{"text": "...", "plausibility_score": 0.0-1.0, "creativity_score": 0.0-1.0,
  "risk_level": "low" | "medium" | "high", "explanation": "...", "news_index": <number or null>}]}
Produce at most {max} excuses."#;

const DRAFT_PROMPT: &str = r#"You draft short messages that deliver an excuse to a recipient.
Match the requested tone. Return ONLY a JSON object of the form:
{"subject": "..." or null, "body": "...", "alternatives": ["...", "..."]}"#;

pub struct ChatGenerator {
    provider: String,
    model: String,
    endpoint: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl ChatGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let (default_base, default_model) = match config.provider.as_str() {
            "openai" => {
                // Verify API key is available
                if std::env::var("OPENAI_API_KEY").is_err() {
                    anyhow::bail!("OPENAI_API_KEY environment variable not set");
                }
                ("https://api.openai.com/v1", "gpt-4o-mini")
            }
            "ollama" => ("http://localhost:11434/v1", "llama3.2:3b"),
            other => anyhow::bail!("Unknown generation provider: {}", other),
        };
        let base = config.url.as_deref().unwrap_or(default_base);

        Ok(Self {
            provider: config.provider.clone(),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| default_model.to_string()),
            endpoint: format!("{}/chat/completions", base.trim_end_matches('/')),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client: http::client(Duration::from_secs(config.timeout_secs))?,
        })
    }

    async fn chat(&self, system: &str, user: &str) -> PipelineResult<serde_json::Value> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let mut req = self.client.post(&self.endpoint).json(&body);
        if self.provider == "openai" {
            req = req.bearer_auth(http::api_key(CAPABILITY, "OPENAI_API_KEY")?);
        }

        tracing::debug!(model = %self.model, endpoint = %self.endpoint, "chat completion request");
        let response = req
            .send()
            .await
            .map_err(|e| http::transport_error(CAPABILITY, e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(http::status_error(CAPABILITY, status, &text));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| http::transport_error(CAPABILITY, e))?;

        let content = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| malformed("missing choices[0].message.content"))?;
        extract_json(content).ok_or_else(|| malformed("reply is not JSON"))
    }
}

fn malformed(what: &str) -> PipelineError {
    PipelineError::capability_unavailable(CAPABILITY, format!("invalid response: {}", what))
}

/// Find a JSON object in a model reply.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(v);
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.find("```") {
            if let Ok(v) = serde_json::from_str(rest[..end].trim()) {
                return Some(v);
            }
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

pub fn candidate_prompt(context: &GenerationContext) -> String {
    let request = &context.request;
    let mut msg = format!("Situation: {}\n", request.situation.trim());
    if let Some(ctx) = &request.context {
        msg.push_str(&format!("Context: {}\n", ctx));
    }
    if let Some(recipient) = &request.recipient {
        msg.push_str(&format!("Recipient: {}\n", recipient));
    }
    msg.push_str(&format!("Tone: {}\n", request.tone.as_str()));
    if let Some(cat) = request.news_category {
        msg.push_str(&format!("Preferred news type: {}\n", cat.as_str()));
    }
    if !context.references.is_empty() {
        msg.push_str(&format!(
            "\n--- Available News Articles ({}) ---\n",
            context.references.len()
        ));
        for (i, item) in context.references.iter().enumerate() {
            msg.push_str(&format!("\n{}. {} ({})\n", i + 1, item.title, item.origin));
            if !item.body.is_empty() {
                let summary: String = item.body.chars().take(400).collect();
                msg.push_str(&format!("   {}\n", summary));
            }
        }
    }
    msg
}

#[derive(Debug, Deserialize)]
struct RawCandidates {
    #[serde(default)]
    excuses: Vec<RawCandidate>,
}

#[derive(Debug, Deserialize)]
struct RawCandidate {
    #[serde(default)]
    text: String,
    #[serde(default = "half")]
    plausibility_score: f64,
    #[serde(default = "half")]
    creativity_score: f64,
    #[serde(default)]
    risk_level: Option<String>,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    news_index: Option<usize>,
}

fn half() -> f64 {
    0.5
}

fn parse_risk(s: Option<&str>) -> RiskLevel {
    match s.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        Some("low") => RiskLevel::Low,
        Some("high") => RiskLevel::High,
        _ => RiskLevel::Medium,
    }
}

/// Turn a candidate reply into [`CandidateExcuse`]s, dropping blank ones.
pub fn parse_candidates(
    value: serde_json::Value,
    context: &GenerationContext,
) -> PipelineResult<Vec<CandidateExcuse>> {
    let raw: RawCandidates =
        serde_json::from_value(value).map_err(|e| malformed(&e.to_string()))?;
    Ok(raw
        .excuses
        .into_iter()
        .filter(|c| !c.text.trim().is_empty())
        .map(|c| CandidateExcuse {
            id: uuid::Uuid::new_v4().to_string(),
            text: c.text.trim().to_string(),
            plausibility: c.plausibility_score.clamp(0.0, 1.0),
            creativity: c.creativity_score.clamp(0.0, 1.0),
            risk: parse_risk(c.risk_level.as_deref()),
            explanation: c.explanation,
            news_reference: c
                .news_index
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| context.references.get(i).cloned()),
            novelty: Novelty::Unchecked,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct RawDraft {
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    alternatives: Vec<String>,
}

pub fn parse_draft(
    value: serde_json::Value,
    request: &ExcuseRequest,
    excuse: &CandidateExcuse,
) -> PipelineResult<DraftedMessage> {
    let raw: RawDraft = serde_json::from_value(value).map_err(|e| malformed(&e.to_string()))?;
    if raw.body.trim().is_empty() {
        return Err(malformed("draft body is empty"));
    }
    Ok(DraftedMessage {
        excuse_id: excuse.id.clone(),
        recipient_type: request
            .recipient
            .clone()
            .unwrap_or_else(|| "recipient".to_string()),
        tone: request.tone,
        subject: raw.subject.filter(|s| !s.trim().is_empty()),
        body: raw.body.trim().to_string(),
        alternatives: raw.alternatives,
    })
}

#[async_trait]
impl GenerationCapability for ChatGenerator {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn generate(&self, context: &GenerationContext) -> PipelineResult<Vec<CandidateExcuse>> {
        let system = CANDIDATE_PROMPT.replace("{max}", &context.max_candidates.to_string());
        let reply = self.chat(&system, &candidate_prompt(context)).await?;
        parse_candidates(reply, context)
    }

    async fn draft(
        &self,
        request: &ExcuseRequest,
        excuse: &CandidateExcuse,
        evidence: &EvidenceBundle,
        notes: Option<&str>,
    ) -> PipelineResult<DraftedMessage> {
        let mut user = format!(
            "Excuse: {}\nRecipient: {}\nTone: {}\nSituation: {}\n",
            excuse.text,
            request.recipient.as_deref().unwrap_or("unspecified"),
            request.tone.as_str(),
            request.situation.trim(),
        );
        if !evidence.is_empty() {
            user.push_str("Supporting evidence:\n");
            for item in &evidence.items {
                user.push_str(&format!("- {}: {}\n", item.description, item.content));
            }
        }
        if let Some(notes) = notes {
            user.push_str(&format!("\nReviewer notes on the previous draft: {}\n", notes));
        }
        let reply = self.chat(DRAFT_PROMPT, &user).await?;
        parse_draft(reply, request, excuse)
    }
}
