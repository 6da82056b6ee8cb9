//! # Excuse Harness Core
//!
//! Shared, runtime-free logic for Excuse Harness: data models, the error
//! taxonomy, request fingerprinting, text similarity, collection merge
//! algorithms, the cache backend abstraction, vector memory, and the
//! embedding trait.
//!
//! This crate contains no tokio, sqlx, network, or filesystem
//! dependencies. Everything that needs a runtime (single-flight caching,
//! source fan-out, the pipeline orchestrator) lives in the `excuse-harness`
//! app crate and is built on top of the traits defined here.

pub mod cache;
pub mod clock;
pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod memory;
pub mod merge;
pub mod models;
pub mod text;

pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use fingerprint::{fingerprint, topic_fingerprint, Fingerprint};
