mod handlers;
mod validation;

pub use handlers::router;
pub use validation::{InputFileRequest, JobRequest, OutputFileRequest};

use crate::config::TangoConfig;
use crate::jobs::JobQueue;
use crate::pool::Preallocator;
use crate::storage::FileStore;
use crate::vmms::VmmsDriver;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueue>,
    pub pool: Arc<Preallocator>,
    pub driver: Arc<dyn VmmsDriver>,
    pub store: Arc<FileStore>,
    pub config: Arc<TangoConfig>,
    pub started_at: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("access denied")]
    Forbidden,
    #[error("{0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(e) => {
                tracing::error!("request failed: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

impl AppState {
    /// Requester keys are opaque; an empty configured list accepts any key.
    pub fn check_key(&self, key: &str) -> Result<(), ApiError> {
        let keys = &self.config.server.access_keys;
        if keys.is_empty() || keys.iter().any(|k| k == key) {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}
