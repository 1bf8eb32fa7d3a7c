//! Job failure taxonomy.

use thiserror::Error;

use crate::convert::ConvertError;
use crate::models::JobConfigError;
use crate::rainfall::RainfallError;
use crate::repository::StoreError;
use crate::solver::SolverError;
use crate::spatial::SpatialError;

/// Why a job did not complete.
///
/// Only [`PipelineError::StoreUnavailable`] is transient; everything else is
/// final for the job.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("job configuration not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("solver failure: {0}")]
    SolverFailure(#[from] SolverError),

    #[error("data store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("data store error: {0}")]
    Store(String),

    #[error("output conversion failed: {0}")]
    Conversion(#[from] ConvertError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::StoreUnavailable(_))
    }

    /// Short label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Configuration(_) => "configuration",
            PipelineError::SolverFailure(_) => "solver_failure",
            PipelineError::StoreUnavailable(_) => "store_unavailable",
            PipelineError::Store(_) => "store",
            PipelineError::Conversion(_) => "conversion",
            PipelineError::Io(_) => "io",
            PipelineError::Panicked(_) => "panicked",
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => PipelineError::NotFound(id),
            StoreError::Unavailable(msg) => PipelineError::StoreUnavailable(msg),
            StoreError::InvalidIdentifier(_) | StoreError::InvalidRecord(_) => {
                PipelineError::Configuration(e.to_string())
            }
            StoreError::Database(_) => PipelineError::Store(e.to_string()),
        }
    }
}

impl From<SpatialError> for PipelineError {
    fn from(e: SpatialError) -> Self {
        match e {
            SpatialError::Unavailable(msg) => PipelineError::StoreUnavailable(msg),
            SpatialError::NotFound(_) | SpatialError::Grid(_) => {
                PipelineError::Configuration(e.to_string())
            }
            SpatialError::Query(_) => PipelineError::Store(e.to_string()),
        }
    }
}

impl From<JobConfigError> for PipelineError {
    fn from(e: JobConfigError) -> Self {
        PipelineError::Configuration(e.to_string())
    }
}

impl From<RainfallError> for PipelineError {
    fn from(e: RainfallError) -> Self {
        PipelineError::Configuration(e.to_string())
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_panic() {
            PipelineError::Panicked(e.to_string())
        } else {
            PipelineError::Io(std::io::Error::other(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(PipelineError::from(StoreError::Unavailable("down".into())).is_retryable());
        assert!(PipelineError::from(SpatialError::Unavailable("down".into())).is_retryable());
        assert!(!PipelineError::NotFound("x".into()).is_retryable());
        assert!(!PipelineError::Configuration("x".into()).is_retryable());
    }

    #[test]
    fn test_store_error_mapping() {
        assert!(matches!(
            PipelineError::from(StoreError::NotFound("abc".into())),
            PipelineError::NotFound(id) if id == "abc"
        ));
        assert!(matches!(
            PipelineError::from(SpatialError::NotFound("buildings".into())),
            PipelineError::Configuration(_)
        ));
        assert!(matches!(
            PipelineError::from(JobConfigError::MissingRainfall),
            PipelineError::Configuration(_)
        ));
    }
}
