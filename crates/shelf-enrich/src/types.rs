//! Core data types for enrichment outcomes and the error taxonomy.

use serde::{Deserialize, Serialize};

/// Separator between the levels of one hierarchical taxonomy term.
pub const TERM_LEVEL_SEPARATOR: &str = " > ";

/// Separator between taxonomy terms in the output column.
pub const TERM_LIST_SEPARATOR: &str = ", ";

/// Fields extracted for one entity when enrichment succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedFields {
    /// Hierarchical terms in document order, e.g. `"Fantasy > High Fantasy"`.
    pub taxonomy: Vec<String>,
    /// Primary image URL.
    pub image: String,
}

impl EnrichedFields {
    /// Render the taxonomy the way it is written to the output column.
    pub fn taxonomy_column(&self) -> String {
        self.taxonomy.join(TERM_LIST_SEPARATOR)
    }
}

/// Terminal outcome of enriching one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnrichmentResult {
    Success {
        fields: EnrichedFields,
        attempts: u32,
    },
    /// The document was fetched but a required field was missing.
    PartialFailure { reason: String, attempts: u32 },
    FetchFailure { reason: String, attempts: u32 },
}

impl EnrichmentResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Number of fetch attempts spent on this entity.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. }
            | Self::PartialFailure { attempts, .. }
            | Self::FetchFailure { attempts, .. } => *attempts,
        }
    }

    /// Failure reason, `None` on success.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::PartialFailure { reason, .. } | Self::FetchFailure { reason, .. } => {
                Some(reason)
            }
        }
    }
}

/// Running counters. Observability only, never used for control decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub done: usize,
    pub failed: usize,
}

impl Progress {
    pub fn merged(&self) -> usize {
        self.done + self.failed
    }
}

/// Final report of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    /// Requests issued through the identity provider, retries included.
    pub requests: u64,
    pub rotations: u64,
    pub elapsed_ms: u64,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

/// A required field was missing from a fetched document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionGap {
    pub missing_taxonomy: bool,
    pub missing_image: bool,
}

impl std::fmt::Display for ExtractionGap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.missing_taxonomy, self.missing_image) {
            (true, true) => write!(f, "taxonomy and image missing"),
            (true, false) => write!(f, "taxonomy missing"),
            (false, true) => write!(f, "image missing"),
            (false, false) => write!(f, "no field missing"),
        }
    }
}

/// Failure of the anonymizing network's control channel. Always job-fatal.
#[derive(thiserror::Error, Debug)]
pub enum RotationError {
    #[error("cannot reach control port at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("control port authentication failed: {0}")]
    Authentication(String),

    #[error("circuit not established after {attempts} checks")]
    CircuitNotEstablished { attempts: u32 },

    #[error("control protocol error: {0}")]
    Protocol(String),

    #[error("failed to build session client: {0}")]
    Session(String),
}

/// Failure of a single fetch attempt.
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    /// Session acquisition failed while rotating identity.
    #[error("identity rotation failed: {0}")]
    Identity(#[from] RotationError),
}

impl FetchError {
    /// Whether the error must abort the whole job instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Identity(_))
    }
}

/// All job-level errors.
#[derive(thiserror::Error, Debug)]
pub enum EnrichError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Rotation(#[from] RotationError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },

    #[error("column not found: {0}")]
    MissingColumn(String),

    #[error("row {0} was already merged")]
    DuplicateMerge(usize),

    #[error("row {0} is outside the dataset")]
    UnknownRow(usize),
}

pub type EnrichResult<T> = Result<T, EnrichError>;
