//! # Excuse Harness
//!
//! A pipeline harness for generating context-backed excuses: fresh news is
//! collected from several sources, a generation capability proposes
//! candidates, the caller picks one, evidence and a message are drafted,
//! and the approved result is remembered so later runs avoid repeating it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────────┐   ┌──────────────┐
//! │   Sources    │──▶│     Orchestrator      │──▶│ Vector Memory│
//! │ HTTP / custom│   │ collect → generate →  │   │ SQLite / RAM │
//! └──────────────┘   │ select → evidence →   │   └──────────────┘
//!                    │ draft → review →      │   ┌──────────────┐
//! ┌──────────────┐   │ persist               │──▶│ Cache Layer  │
//! │ Generation / │◀──│                       │   │ single-flight│
//! │ Evidence     │   └──────────┬────────────┘   └──────────────┘
//! └──────────────┘              │
//!                      ┌────────┴────────┐
//!                      ▼                 ▼
//!                 ┌──────────┐     ┌──────────┐
//!                 │   CLI    │     │   HTTP   │
//!                 │  (exh)   │     │  (axum)  │
//!                 └──────────┘     └──────────┘
//! ```
//!
//! Runtime-free logic (models, errors, fingerprinting, merge, store
//! traits) lives in the `excuse-harness-core` crate.
//!
//! ## Quick Start
//!
//! ```bash
//! exh init
//! exh sources
//! exh run "late to standup" --tone casual --news national_absurd
//! exh similar "goose on the motorway"
//! exh serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`cache`] | Single-flight cache layer with TTL policy |
//! | [`sqlite_cache`] | SQLite cache backend |
//! | [`memory_store`] | SQLite vector memory |
//! | [`stores`] | Opening and closing the shared stores |
//! | [`collector`] | Parallel source fan-out with quorum |
//! | [`retry`] | Retry policy for capability calls |
//! | [`capabilities`] | Capability traits and source registry |
//! | [`source_http`] | HTTP JSON feed source |
//! | [`generation`] | Chat-completions generation adapter |
//! | [`embedding`] | HTTP embedding providers |
//! | [`evidence`] | Evidence from reference material |
//! | [`http`] | Shared reqwest helpers |
//! | [`run`] | Run state machine and snapshots |
//! | [`orchestrator`] | Pipeline orchestrator |
//! | [`export`] | Vector memory export/import |
//! | [`server`] | HTTP API |

pub mod cache;
pub mod capabilities;
pub mod collector;
pub mod config;
pub mod db;
pub mod embedding;
pub mod evidence;
pub mod export;
pub mod generation;
pub mod http;
pub mod memory_store;
pub mod migrate;
pub mod orchestrator;
pub mod retry;
pub mod run;
pub mod run_cmd;
pub mod server;
pub mod source_http;
pub mod sources;
pub mod sqlite_cache;
pub mod stores;

pub use orchestrator::{Orchestrator, PipelineSettings};
pub use run::{ReviewDecision, RunSnapshot, RunState};
