//! Client-visible error taxonomy.
//!
//! Internal plumbing uses `anyhow`; these are the conditions that cross the
//! registry boundary and end up in an HTTP response body.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    /// The source could not be opened. Nothing was registered or spawned.
    #[error("failed to open stream source {origin}: {reason}")]
    SourceUnavailable { origin: String, reason: String },

    #[error("stream with id {0} already exists")]
    AlreadyExists(String),

    #[error("stream {0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl StreamError {
    pub fn source_unavailable(origin: &str, err: &anyhow::Error) -> Self {
        Self::SourceUnavailable {
            origin: origin.to_string(),
            reason: format!("{err:#}"),
        }
    }

    /// Stable machine-readable code for response bodies.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "SourceUnavailable",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::NotFound(_) => "NotFound",
            Self::InvalidRequest(_) => "InvalidRequest",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            _ => 400,
        }
    }
}
