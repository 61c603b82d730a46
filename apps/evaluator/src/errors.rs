use thiserror::Error;

use crate::models::job::Stage;

/// Pipeline-level error taxonomy.
///
/// Transient conditions (retrieval outages, upstream rate limits, malformed
/// model output) are contained and retried inside the component that saw
/// them; only the exhausted-retry form of each surfaces here. Input errors
/// (`InvalidReference`, `NotFound`) surface immediately to the caller.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("upstream unavailable after {attempts} attempts: {message}")]
    UpstreamUnavailable { attempts: u32, message: String },

    #[error("malformed upstream response after {attempts} attempts: {message}")]
    MalformedResponse { attempts: u32, message: String },

    /// Permanent upstream refusal (authentication, bad request). Never retried.
    #[error("upstream rejected request: {0}")]
    UpstreamRejected(String),

    #[error("{stage} stage failed ({kind}): {message}")]
    EvaluationStageFailed {
        stage: Stage,
        kind: &'static str,
        message: String,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    /// Stable machine-readable code, stored on failed jobs so operators can
    /// tell "the service is down" from "the service answered incoherently".
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidReference(_) => "invalid_reference",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::RetrievalUnavailable(_) => "retrieval_unavailable",
            PipelineError::UpstreamUnavailable { .. } => "upstream_unavailable",
            PipelineError::MalformedResponse { .. } => "malformed_response",
            PipelineError::UpstreamRejected(_) => "upstream_rejected",
            PipelineError::EvaluationStageFailed { kind, .. } => kind,
            PipelineError::Database(_) => "database_error",
            PipelineError::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        let err = PipelineError::UpstreamUnavailable {
            attempts: 3,
            message: "timeout".to_string(),
        };
        assert_eq!(err.kind(), "upstream_unavailable");

        let err = PipelineError::MalformedResponse {
            attempts: 3,
            message: "bad json".to_string(),
        };
        assert_eq!(err.kind(), "malformed_response");
    }

    #[test]
    fn test_stage_failure_carries_inner_kind() {
        let err = PipelineError::EvaluationStageFailed {
            stage: Stage::Project,
            kind: "malformed_response",
            message: "scores out of range".to_string(),
        };
        assert_eq!(err.kind(), "malformed_response");
        assert!(err.to_string().contains("project"));
    }
}
