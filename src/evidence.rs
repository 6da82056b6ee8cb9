//! Evidence built from the excuse's own reference material.
//!
//! [`ReferenceEvidenceBuilder`] needs no external service. For a candidate
//! anchored to a news item it emits a [`EvidenceKind::Link`] to the article
//! and a short [`EvidenceKind::Document`] summarising it; any candidate with
//! an explanation also gets a document restating that explanation.
//! Screenshots and images are left to custom [`EvidenceCapability`]
//! implementations.

use async_trait::async_trait;

use excuse_harness_core::models::{CandidateExcuse, Evidence, EvidenceBundle, EvidenceKind};
use excuse_harness_core::PipelineResult;

use crate::capabilities::EvidenceCapability;

#[derive(Debug, Default, Clone)]
pub struct ReferenceEvidenceBuilder;

impl ReferenceEvidenceBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn assemble(excuse: &CandidateExcuse) -> EvidenceBundle {
        let mut items = Vec::new();

        if let Some(news) = &excuse.news_reference {
            let credibility = (0.5 + 0.5 * news.relevance).clamp(0.0, 1.0);
            if let Some(url) = &news.url {
                items.push(Evidence {
                    kind: EvidenceKind::Link,
                    content: url.clone(),
                    description: format!("{} ({})", news.title, news.origin),
                    credibility,
                });
            }
            let mut summary = format!(
                "{}\nPublished {} by {}.",
                news.title,
                news.published_at.format("%Y-%m-%d %H:%M UTC"),
                news.origin
            );
            if !news.body.is_empty() {
                summary.push_str("\n\n");
                summary.push_str(&news.body);
            }
            items.push(Evidence {
                kind: EvidenceKind::Document,
                content: summary,
                description: "News summary".to_string(),
                credibility,
            });
        }

        if !excuse.explanation.trim().is_empty() {
            items.push(Evidence {
                kind: EvidenceKind::Document,
                content: excuse.explanation.trim().to_string(),
                description: "Background notes".to_string(),
                credibility: excuse.plausibility.clamp(0.0, 1.0),
            });
        }

        EvidenceBundle {
            excuse_id: excuse.id.clone(),
            items,
        }
    }
}

#[async_trait]
impl EvidenceCapability for ReferenceEvidenceBuilder {
    async fn build(&self, excuse: &CandidateExcuse) -> PipelineResult<EvidenceBundle> {
        Ok(Self::assemble(excuse))
    }
}
