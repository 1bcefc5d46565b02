use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use shared_types::ProxyErrorBody;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum StoreError {
    /// A newer run replaced the one being written.
    #[error("run {run_id} was superseded by {current}")]
    Superseded { run_id: String, current: String },

    #[error("no run stored for workflow {0}")]
    Missing(String),
}

/// Handler-level failures. Every variant renders as `{ error, details? }`.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("request has no query or user message")]
    MissingInput,

    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::UnknownWorkflow(_) => StatusCode::NOT_FOUND,
            ProxyError::MissingInput | ProxyError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::Store(StoreError::Superseded { .. }) => StatusCode::CONFLICT,
            ProxyError::Store(StoreError::Missing(_)) => StatusCode::NOT_FOUND,
        }
    }

    fn body(&self) -> ProxyErrorBody {
        let (error, details) = match self {
            ProxyError::UnknownWorkflow(id) => ("Unknown workflow", Some(id.clone())),
            ProxyError::MissingInput => (
                "Missing input",
                Some("provide `query` or at least one user message".to_string()),
            ),
            ProxyError::InvalidBody(details) => ("Invalid request body", Some(details.clone())),
            ProxyError::Store(err) => ("Snapshot store error", Some(err.to_string())),
        };
        ProxyErrorBody {
            error: error.to_string(),
            details,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}
