//! Pipeline run state machine and snapshots.
//!
//! A [`RunSnapshot`] is the caller-visible view of one run. Only the
//! orchestrator mutates it, always through [`RunSnapshot::transition`],
//! which rejects edges not in the table below.
//!
//! ```text
//! Collecting → Filtering → Generating → AwaitingSelection
//!     → BuildingEvidence → Drafting → AwaitingReview → Persisting → Completed
//!                             ▲              │
//!                             └── redraft ───┘
//!
//! any non-terminal state ──▶ Aborted { reason }
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use excuse_harness_core::models::{
    Artifact, CandidateExcuse, CollectionResult, DraftedMessage, EvidenceBundle, ExcuseRequest,
    SourceItem,
};
use excuse_harness_core::{PipelineError, PipelineResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Collecting,
    Filtering,
    Generating,
    AwaitingSelection,
    BuildingEvidence,
    Drafting,
    AwaitingReview,
    Persisting,
    Completed,
    Aborted { reason: PipelineError },
}

impl RunState {
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Collecting => "collecting",
            RunState::Filtering => "filtering",
            RunState::Generating => "generating",
            RunState::AwaitingSelection => "awaiting_selection",
            RunState::BuildingEvidence => "building_evidence",
            RunState::Drafting => "drafting",
            RunState::AwaitingReview => "awaiting_review",
            RunState::Persisting => "persisting",
            RunState::Completed => "completed",
            RunState::Aborted { .. } => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted { .. })
    }

    /// States that wait on the caller rather than on work.
    pub fn is_waiting(&self) -> bool {
        matches!(self, RunState::AwaitingSelection | RunState::AwaitingReview)
    }

    pub fn can_transition_to(&self, next: &RunState) -> bool {
        use RunState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Aborted { .. })
                | (Collecting, Filtering)
                | (Filtering, Generating)
                | (Generating, AwaitingSelection)
                | (AwaitingSelection, BuildingEvidence)
                | (BuildingEvidence, Drafting)
                | (Drafting, AwaitingReview)
                | (AwaitingReview, Drafting)
                | (AwaitingReview, Persisting)
                | (Persisting, Completed)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Aborted { reason } => write!(f, "aborted ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// A caller's verdict on a drafted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    /// Draft again, passing `notes` to the generation capability.
    Redraft { notes: String },
    Reject,
}

/// Entry in a run's stage history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub id: String,
    pub fingerprint: String,
    pub request: ExcuseRequest,
    pub state: RunState,
    pub history: Vec<StageRecord>,
    #[serde(default)]
    pub collection: Option<CollectionResult>,
    /// Reference material handed to generation after filtering.
    #[serde(default)]
    pub references: Vec<SourceItem>,
    #[serde(default)]
    pub candidates: Vec<CandidateExcuse>,
    #[serde(default)]
    pub selected: Option<CandidateExcuse>,
    #[serde(default)]
    pub evidence: Option<EvidenceBundle>,
    #[serde(default)]
    pub message: Option<DraftedMessage>,
    /// Number of drafts produced, including redrafts.
    #[serde(default)]
    pub drafts: u32,
    #[serde(default)]
    pub artifact: Option<Artifact>,
    /// Retries performed, by capability label.
    #[serde(default)]
    pub retries: BTreeMap<String, u32>,
    /// Features skipped because a shared store was unavailable.
    #[serde(default)]
    pub degraded: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn new(id: String, fingerprint: String, request: ExcuseRequest, now: DateTime<Utc>) -> Self {
        Self {
            id,
            fingerprint,
            request,
            state: RunState::Collecting,
            history: vec![StageRecord {
                stage: RunState::Collecting.name().to_string(),
                entered_at: now,
            }],
            collection: None,
            references: Vec::new(),
            candidates: Vec::new(),
            selected: None,
            evidence: None,
            message: None,
            drafts: 0,
            artifact: None,
            retries: BTreeMap::new(),
            degraded: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: RunState, now: DateTime<Utc>) -> PipelineResult<()> {
        if !self.state.can_transition_to(&next) {
            return Err(PipelineError::InvalidState {
                reason: format!("cannot move run {} from {} to {}", self.id, self.state, next),
            });
        }
        self.history.push(StageRecord {
            stage: next.name().to_string(),
            entered_at: now,
        });
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn abort_reason(&self) -> Option<&PipelineError> {
        match &self.state {
            RunState::Aborted { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn add_retries(&mut self, label: &str, retries: u32) {
        if retries > 0 {
            *self.retries.entry(label.to_string()).or_default() += retries;
        }
    }

    pub fn note_degraded(&mut self, note: impl Into<String>) {
        self.degraded.push(note.into());
    }

    pub fn candidate(&self, id: &str) -> Option<&CandidateExcuse> {
        self.candidates.iter().find(|c| c.id == id)
    }
}
