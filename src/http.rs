//! Shared HTTP plumbing for the reqwest-based adapters.
//!
//! Maps transport failures and HTTP status codes onto the pipeline error
//! taxonomy so the retry policy can decide what to retry:
//!
//! | Response | Error |
//! |----------|-------|
//! | 429 | `RateLimited` |
//! | 5xx, network error | `CapabilityUnavailable` |
//! | other 4xx | `InvalidRequest` |

use std::time::Duration;

use excuse_harness_core::PipelineError;

pub fn client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

pub fn status_error(capability: &str, status: reqwest::StatusCode, body: &str) -> PipelineError {
    let snippet: String = body.chars().take(200).collect();
    if status.as_u16() == 429 {
        PipelineError::RateLimited {
            capability: capability.to_string(),
        }
    } else if status.is_server_error() {
        PipelineError::capability_unavailable(capability, format!("HTTP {}: {}", status, snippet))
    } else {
        PipelineError::invalid_request(format!("{} rejected request ({}): {}", capability, status, snippet))
    }
}

pub fn transport_error(capability: &str, err: reqwest::Error) -> PipelineError {
    PipelineError::capability_unavailable(capability, err)
}

/// Read the API key from `var`, or fail as unavailable.
pub fn api_key(capability: &str, var: &str) -> Result<String, PipelineError> {
    std::env::var(var).map_err(|_| {
        PipelineError::capability_unavailable(capability, format!("{} not set", var))
    })
}
