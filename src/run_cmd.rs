//! `exh run` and `exh similar`: drive one run from the terminal.
//!
//! `exh run` starts a run, waits for candidates, selects one (by 1-based
//! position, default the first), then shows the draft. With `--approve`
//! the draft is accepted immediately; otherwise the command reads a
//! decision from stdin: `a` approves, `r <notes>` redrafts, `x` rejects.

use anyhow::{bail, Result};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, BufReader};

use excuse_harness_core::models::{ArtifactCategory, ExcuseRequest, NewsCategory, Tone};

use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::run::{ReviewDecision, RunSnapshot, RunState};
use crate::stores::build_orchestrator;

/// Options for `exh run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub situation: String,
    pub context: Option<String>,
    pub recipient: Option<String>,
    pub tone: Option<String>,
    pub news_category: Option<String>,
    pub no_evidence: bool,
    pub pick: Option<usize>,
    pub approve: bool,
}

/// Parse a snake_case enum name, e.g. `"international_absurd"`.
fn parse_name<T: DeserializeOwned>(what: &str, value: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase()))
        .map_err(|_| anyhow::anyhow!("Unknown {}: '{}'", what, value))
}

pub fn build_request(opts: &RunOptions) -> Result<ExcuseRequest> {
    let mut request = ExcuseRequest::new(opts.situation.clone());
    request.context = opts.context.clone();
    request.recipient = opts.recipient.clone();
    if let Some(tone) = &opts.tone {
        request.tone = parse_name::<Tone>("tone", tone)?;
    }
    if let Some(cat) = &opts.news_category {
        request.news_category = Some(parse_name::<NewsCategory>("news category", cat)?);
    }
    request.include_evidence = !opts.no_evidence;
    Ok(request)
}

pub async fn run_excuse(config: &Config, opts: RunOptions) -> Result<()> {
    let request = build_request(&opts)?;
    let (orchestrator, stores) = build_orchestrator(config).await?;
    let result = drive(&orchestrator, request, &opts).await;
    stores.close().await;
    result
}

async fn drive(orchestrator: &Orchestrator, request: ExcuseRequest, opts: &RunOptions) -> Result<()> {
    let run_id = orchestrator.start_run(request)?;
    println!("run {}", run_id);

    let snap = orchestrator.wait_until_idle(&run_id).await?;
    finished(&snap)?;
    print_candidates(&snap);

    let pick = opts.pick.unwrap_or(1);
    let Some(candidate) = pick.checked_sub(1).and_then(|i| snap.candidates.get(i)) else {
        orchestrator.cancel_run(&run_id)?;
        bail!("--pick {} is out of range (1..={})", pick, snap.candidates.len());
    };
    orchestrator.select_candidate(&run_id, &candidate.id)?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let snap = orchestrator
            .wait_for(&run_id, |s| {
                s.state == RunState::AwaitingReview || s.state.is_terminal()
            })
            .await?;
        finished(&snap)?;
        print_draft(&snap);

        let decision = if opts.approve {
            ReviewDecision::Approve
        } else {
            println!("\n[a]pprove, [r]edraft <notes>, or [x] reject?");
            let line = stdin.next_line().await?.unwrap_or_default();
            match parse_decision(&line) {
                Some(d) => d,
                None => {
                    println!("Unrecognised answer; rejecting.");
                    ReviewDecision::Reject
                }
            }
        };
        let redraft = matches!(decision, ReviewDecision::Redraft { .. });
        let drafts = snap.drafts;
        orchestrator.submit_review(&run_id, decision)?;
        if !redraft {
            break;
        }
        orchestrator
            .wait_for(&run_id, |s| s.drafts > drafts || s.state.is_terminal())
            .await?;
    }

    let snap = orchestrator
        .wait_for(&run_id, |s| s.state.is_terminal())
        .await?;
    finished(&snap)?;
    if let Some(artifact) = &snap.artifact {
        println!("\nSaved artifact {}", artifact.id);
    }
    for note in &snap.degraded {
        println!("note: {}", note);
    }
    Ok(())
}

pub fn parse_decision(line: &str) -> Option<ReviewDecision> {
    let line = line.trim();
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    match head.to_lowercase().as_str() {
        "a" | "approve" | "y" | "yes" => Some(ReviewDecision::Approve),
        "r" | "redraft" => Some(ReviewDecision::Redraft {
            notes: rest.trim().to_string(),
        }),
        "x" | "reject" | "n" | "no" => Some(ReviewDecision::Reject),
        _ => None,
    }
}

fn finished(snap: &RunSnapshot) -> Result<()> {
    if let Some(reason) = snap.abort_reason() {
        bail!("run {} aborted: {}", snap.id, reason);
    }
    Ok(())
}

fn print_candidates(snap: &RunSnapshot) {
    println!("\n{} candidate(s):", snap.candidates.len());
    for (i, c) in snap.candidates.iter().enumerate() {
        println!(
            "{}. [plausibility {:.2}  creativity {:.2}  risk {:?}  {:?}]",
            i + 1,
            c.plausibility,
            c.creativity,
            c.risk,
            c.novelty
        );
        println!("   {}", c.text);
        if let Some(news) = &c.news_reference {
            println!("   news: {} ({})", news.title, news.origin);
        }
    }
}

fn print_draft(snap: &RunSnapshot) {
    let Some(message) = &snap.message else {
        return;
    };
    println!("\n--- draft {} ---", snap.drafts);
    if let Some(subject) = &message.subject {
        println!("Subject: {}", subject);
    }
    println!("{}", message.body);
    if let Some(evidence) = &snap.evidence {
        if !evidence.is_empty() {
            println!("\nEvidence:");
            for e in &evidence.items {
                println!("  - {:?}: {} ({:.2})", e.kind, e.description, e.credibility);
            }
        }
    }
}

/// `exh similar`: print past artifacts close to `text`.
pub async fn run_similar(
    config: &Config,
    text: &str,
    limit: Option<usize>,
    category: Option<&str>,
) -> Result<()> {
    let category = match category {
        Some(c) => Some(
            ArtifactCategory::parse(c)
                .ok_or_else(|| anyhow::anyhow!("Unknown category: '{}'", c))?,
        ),
        None => None,
    };
    let (orchestrator, stores) = build_orchestrator(config).await?;
    let hits = orchestrator
        .find_similar(text, limit.unwrap_or(config.memory.similar_limit), category)
        .await;
    stores.close().await;
    let hits = hits?;

    if hits.is_empty() {
        println!("No similar artifacts.");
        return Ok(());
    }
    for hit in hits {
        let text = hit
            .payload
            .pointer("/excuse/text")
            .or_else(|| hit.payload.pointer("/message/body"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        println!(
            "{:.3}  {:<8} {}  {}",
            hit.similarity,
            hit.metadata.category.as_str(),
            hit.metadata.created_at.format("%Y-%m-%d"),
            text
        );
    }
    Ok(())
}
