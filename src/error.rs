use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SdkError>;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("session for {0} is not initialized")]
    NotInitialized(String),
    #[error("session for {artifact} failed to initialize: {reason}")]
    SessionFailed { artifact: String, reason: String },
    #[error("cache error: {0}")]
    Cache(String),
    #[error("failed to fetch {path}: {reason}")]
    Fetch { path: String, reason: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("index {index:?} out of bounds for tensor of shape {dims:?}")]
    IndexOutOfBounds { index: Vec<usize>, dims: Vec<usize> },
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("session worker unavailable: {0}")]
    Worker(String),
    #[error("model {0} is not loaded")]
    ModelNotLoaded(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl SdkError {
    pub(crate) fn fetch(path: &str, reason: impl ToString) -> Self {
        SdkError::Fetch {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl IntoResponse for SdkError {
    fn into_response(self) -> Response {
        let status = match self {
            SdkError::BadRequest(_)
            | SdkError::Shape(_)
            | SdkError::IndexOutOfBounds { .. }
            | SdkError::Image(_) => StatusCode::BAD_REQUEST,
            SdkError::ModelNotLoaded(_) => StatusCode::NOT_FOUND,
            SdkError::NotInitialized(_) | SdkError::Worker(_) => StatusCode::SERVICE_UNAVAILABLE,
            SdkError::Fetch { .. } | SdkError::Http(_) => StatusCode::BAD_GATEWAY,
            SdkError::Config(_)
            | SdkError::SessionFailed { .. }
            | SdkError::Cache(_)
            | SdkError::Tokenizer(_)
            | SdkError::Inference(_)
            | SdkError::Io(_)
            | SdkError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
