//! Top-level error taxonomy the orchestrator and HTTP layer deal in.
//! Grounded in §7's error kinds; each variant maps to a distinct caller
//! outcome rather than a bare string.

use uuid::Uuid;

use utm_core::ValidationError;
use utm_dss::DssError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("declaration {0} not found")]
    NotFound(Uuid),

    #[error("self-deconfliction failed against {0} known flight(s)")]
    ConflictLocal(usize),

    #[error("dss call failed: {0}")]
    Dss(#[from] DssError),

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Dss(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl axum::response::IntoResponse for OrchestratorError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::ConflictLocal(_) => StatusCode::CONFLICT,
            OrchestratorError::Dss(_) => StatusCode::BAD_GATEWAY,
            OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, axum::Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
