use std::fmt;

use thiserror::Error;

use crate::progress::ProgressReport;

/// Where a failed model call was issued from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSite {
    Chunk(usize),
    Reconciliation,
    Judgment(String),
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallSite::Chunk(index) => write!(f, "chunk {index}"),
            CallSite::Reconciliation => write!(f, "reconciliation"),
            CallSite::Judgment(doc_id) => write!(f, "judgment of document {doc_id}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ChatlabelError {
    #[error("model call failed at {site}: {message}")]
    ModelCallFailed { site: CallSite, message: String },
    #[error("document source unavailable after {} documents: {message}", progress.processed)]
    SourceUnavailable {
        message: String,
        progress: ProgressReport,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("mutation of document {doc_id} failed: {message}")]
    MutationFailed { doc_id: String, message: String },
    #[error("invalid transcript: {0}")]
    Transcript(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChatlabelError>;

impl ChatlabelError {
    pub fn model_call(site: CallSite, err: anyhow::Error) -> Self {
        Self::ModelCallFailed {
            site,
            message: format!("{err:#}"),
        }
    }

    pub fn source(progress: ProgressReport, err: anyhow::Error) -> Self {
        Self::SourceUnavailable {
            message: format!("{err:#}"),
            progress,
        }
    }

    /// Partial progress carried by the error, if any.
    pub fn progress(&self) -> Option<&ProgressReport> {
        match self {
            Self::SourceUnavailable { progress, .. } => Some(progress),
            _ => None,
        }
    }
}
