use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response}
};
use errors::AdminError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String)
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE"
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

impl From<AdminError> for ApiError {
    fn from(err: AdminError) -> Self {
        match err {
            AdminError::UnknownBreaker { .. } => ApiError::NotFound(err.to_string()),
            AdminError::Storage(e) => ApiError::StorageUnavailable(e.to_string())
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
