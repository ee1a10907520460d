use thiserror::Error;

use crate::net::RetryError;

/// Per-fund failure kinds. None of these abort a batch; the fund boundary
/// turns them into the record's `error` field.
#[derive(Debug, Error)]
pub enum FundError {
    #[error("no fund matched '{query}'")]
    NotFound { query: String },

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("no document published: {0}")]
    NoDocument(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("cache unavailable: {0}")]
    CacheIo(String),

    #[error("source structure drift: {0}")]
    StructuralDrift(String),
}

impl FundError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::NoDocument(_) => "no_document",
            Self::InvalidDocument(_) => "invalid_document",
            Self::CacheIo(_) => "cache_io",
            Self::StructuralDrift(_) => "structural_drift",
        }
    }
}

impl From<RetryError> for FundError {
    fn from(error: RetryError) -> Self {
        Self::SourceUnavailable(error.to_string())
    }
}
