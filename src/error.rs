use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("already disposed")]
    AlreadyDisposed,

    #[error("internal server error")]
    Internal,
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(_: serde_json::Error) -> Self {
        AppError::Internal
    }
}

impl AppError {
    /// Message safe to hand to a client. Store internals never leak.
    pub fn public_message(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad request",
            AppError::Unauthorized => "not authenticated",
            AppError::NotFound => "not found",
            AppError::StoreUnavailable(_) => "service temporarily unavailable",
            AppError::AlreadyDisposed => "server is shutting down",
            _ => "internal server error",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::StoreUnavailable(_) | AppError::AlreadyDisposed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.public_message() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_do_not_leak_details_to_clients() {
        let err = AppError::StoreUnavailable("NOAUTH bad password at 10.0.0.3:6379".into());
        assert_eq!(err.public_message(), "service temporarily unavailable");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn redis_errors_map_to_store_unavailable() {
        let redis_err =
            redis::RedisError::from((redis::ErrorKind::IoError, "connection refused"));
        assert!(matches!(
            AppError::from(redis_err),
            AppError::StoreUnavailable(_)
        ));
    }
}
