use thiserror::Error;

/// Error taxonomy for the ingestion pipeline.
///
/// Rule-load failures are fatal at startup; everything else fails a
/// single request and leaves the rest of a batch untouched.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to load rules: {0}")]
    RuleLoad(String),

    #[error("failed to parse HTTP message: {0}")]
    Parse(String),

    #[error("failed to map request to graph: {0}")]
    Mapping(String),

    #[error("graph store error: {0}")]
    Persistence(String),
}

impl IngestError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::RuleLoad(_))
    }
}
