use std::time::Duration;

use thiserror::Error;

/// Errors raised inside a site visit.
///
/// Step-level failures are reported through the progress stream and never
/// reach the caller; everything in here either aborts a single operation or,
/// once it crosses the orchestrator, the whole visit.
#[derive(Debug, Error)]
pub enum ScoutError {
    #[error("browser error: {0}")]
    Browser(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("decision backend error: {0}")]
    Decision(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    VisitFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ScoutError {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScoutError>;
