#![forbid(unsafe_code)]

//! Error taxonomy shared by the metadata query and the download workers.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GrabError {
    /// Required request input is missing or unusable.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{tool} did not answer within {}s", .timeout.as_secs())]
    UpstreamTimeout { tool: String, timeout: Duration },

    #[error("could not parse {tool} output: {detail}")]
    UpstreamMalformed { tool: String, detail: String },

    #[error("{tool} failed: {detail}")]
    UpstreamFailure { tool: String, detail: String },

    #[error("local file error: {0}")]
    LocalIo(String),

    #[error("cancelled")]
    Cancelled,
}

impl GrabError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn failure(tool: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::UpstreamFailure {
            tool: tool.into(),
            detail: detail.into(),
        }
    }

    /// Short machine-readable label used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamMalformed { .. } => "upstream_malformed",
            Self::UpstreamFailure { .. } => "upstream_failure",
            Self::LocalIo(_) => "local_io",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<std::io::Error> for GrabError {
    fn from(err: std::io::Error) -> Self {
        Self::LocalIo(err.to_string())
    }
}

pub type GrabResult<T> = Result<T, GrabError>;
