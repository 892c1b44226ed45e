//! Pipeline error taxonomy.
//!
//! The boundary that matters operationally: per-item and per-record failures
//! recover locally (retry, checkpoint as failed, or skip), while integrity
//! and infrastructure failures abort the current operation. Both kinds cross
//! module boundaries as `anyhow::Error`; this type is what `downcast_ref`
//! finds when a caller needs the distinction.

use thiserror::Error;

use crate::client::FetchError;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Source hiccup worth retrying (throttle, 5xx, network).
    #[error("transient source failure: {0}")]
    TransientSource(String),

    /// Source said no and will keep saying no (401/403/404, retries spent).
    #[error("permanent source failure: {0}")]
    PermanentSource(String),

    /// A record failing the shape contract; skipped, never fatal.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// The store rejected data the pipeline believed consistent.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("infrastructure failure: {0}")]
    FatalInfrastructure(#[from] std::io::Error),
}

impl PipelineError {
    /// True for errors that must abort the current operation rather than be
    /// absorbed into per-item bookkeeping.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::IntegrityViolation(_) | PipelineError::FatalInfrastructure(_)
        )
    }
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transient(msg) => PipelineError::TransientSource(msg),
            FetchError::Permanent(msg) => PipelineError::PermanentSource(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_integrity_and_infrastructure_are_fatal() {
        assert!(!PipelineError::TransientSource("429".into()).is_fatal());
        assert!(!PipelineError::PermanentSource("404".into()).is_fatal());
        assert!(!PipelineError::MalformedRecord("no appid".into()).is_fatal());
        assert!(PipelineError::IntegrityViolation("23505".into()).is_fatal());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert!(PipelineError::from(io).is_fatal());
    }

    #[test]
    fn fetch_errors_map_onto_the_source_variants() {
        let transient = PipelineError::from(FetchError::Transient("HTTP 429".into()));
        assert!(matches!(transient, PipelineError::TransientSource(_)));
        assert!(!transient.is_fatal());

        let permanent = PipelineError::from(FetchError::Permanent("HTTP 404".into()));
        assert!(matches!(permanent, PipelineError::PermanentSource(_)));
        assert!(!permanent.is_fatal());
    }

    #[test]
    fn io_errors_convert_into_infrastructure_failures() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: PipelineError = io.into();
        assert!(matches!(err, PipelineError::FatalInfrastructure(_)));
    }
}
