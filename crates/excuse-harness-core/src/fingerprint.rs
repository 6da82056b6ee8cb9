//! Request fingerprinting.
//!
//! A [`Fingerprint`] is the SHA-256 digest of a request's normalized fields
//! and is used as the cache key and as deduplication metadata in vector
//! memory. Normalization collapses whitespace, lowercases text, and buckets
//! `requested_at` to the hour, so requests issued moments apart about the
//! same thing share a key.
//!
//! Fields are length-prefixed before hashing, which keeps
//! `("ab", "c")` and `("a", "bc")` from colliding.
//!
//! # Example
//!
//! ```rust
//! use excuse_harness_core::fingerprint::fingerprint;
//! use excuse_harness_core::models::ExcuseRequest;
//!
//! let a = ExcuseRequest::new("Late to   the meeting");
//! let mut b = a.clone();
//! b.situation = "late to the meeting ".to_string();
//! assert_eq!(fingerprint(&a, None).unwrap(), fingerprint(&b, None).unwrap());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, PipelineResult};
use crate::models::ExcuseRequest;
use crate::text::normalize_text;

/// Width of the freshness bucket applied to `requested_at`.
pub const TIME_BUCKET_SECS: i64 = 3600;

/// Longest accepted value for any single free-text field.
pub const MAX_FIELD_BYTES: usize = 4096;

/// Hex-encoded SHA-256 content key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a stored fingerprint, checking that it is 64 hex characters.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// Derive a child key, e.g. for per-candidate evidence.
    pub fn derive(&self, label: &str) -> Fingerprint {
        let mut hasher = Sha256::new();
        hash_field(&mut hasher, &self.0);
        hash_field(&mut hasher, label);
        Fingerprint(hex::encode(hasher.finalize()))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Start of the hour bucket containing `ts`, in seconds since the epoch.
pub fn time_bucket(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(TIME_BUCKET_SECS)
}

/// Fingerprint every request field that influences generation.
///
/// Returns `InvalidRequest` if the situation is blank or any text field
/// exceeds [`MAX_FIELD_BYTES`].
pub fn fingerprint(request: &ExcuseRequest, salt: Option<&str>) -> PipelineResult<Fingerprint> {
    validate(request)?;

    let mut hasher = Sha256::new();
    hash_field(&mut hasher, "request/v1");
    hash_field(&mut hasher, &normalize_text(&request.situation));
    hash_optional(&mut hasher, request.context.as_deref());
    hash_optional(&mut hasher, request.recipient.as_deref());
    hash_field(&mut hasher, request.tone.as_str());
    hash_field(
        &mut hasher,
        request.news_category.map(|c| c.as_str()).unwrap_or(""),
    );
    hash_field(&mut hasher, if request.include_evidence { "1" } else { "0" });
    hasher.update(time_bucket(request.requested_at).to_le_bytes());
    hash_field(&mut hasher, salt.unwrap_or(""));

    Ok(Fingerprint(hex::encode(hasher.finalize())))
}

/// Fingerprint only the fields that determine which reference material is
/// collected (situation, news category, time bucket).
///
/// Requests that differ only in tone or recipient share collected material.
pub fn topic_fingerprint(request: &ExcuseRequest) -> PipelineResult<Fingerprint> {
    validate(request)?;

    let mut hasher = Sha256::new();
    hash_field(&mut hasher, "topic/v1");
    hash_field(&mut hasher, &normalize_text(&request.topic()));
    hasher.update(time_bucket(request.requested_at).to_le_bytes());

    Ok(Fingerprint(hex::encode(hasher.finalize())))
}

fn validate(request: &ExcuseRequest) -> PipelineResult<()> {
    if request.situation.trim().is_empty() {
        return Err(PipelineError::invalid_request("situation must not be empty"));
    }
    let fields = [
        ("situation", Some(request.situation.as_str())),
        ("context", request.context.as_deref()),
        ("recipient", request.recipient.as_deref()),
    ];
    for (name, value) in fields {
        if let Some(v) = value {
            if v.len() > MAX_FIELD_BYTES {
                return Err(PipelineError::invalid_request(format!(
                    "{} exceeds {} bytes",
                    name, MAX_FIELD_BYTES
                )));
            }
        }
    }
    Ok(())
}

fn hash_field(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

fn hash_optional(hasher: &mut Sha256, value: Option<&str>) {
    // Blank optional fields hash the same as absent ones.
    let normalized = value.map(normalize_text).unwrap_or_default();
    hash_field(hasher, &normalized);
}
