use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use common::{req::ErrorResponse, topic::TopicError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Validation(String),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl BridgeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::Delivery(_))
    }
}

impl From<TopicError> for BridgeError {
    fn from(e: TopicError) -> Self {
        BridgeError::Validation(e.to_string())
    }
}

impl ResponseError for BridgeError {
    fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::Unauthorized => StatusCode::UNAUTHORIZED,
            BridgeError::Validation(_) => StatusCode::BAD_REQUEST,
            BridgeError::Delivery(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        // delivery details stay in the log
        let error = match self {
            BridgeError::Delivery(_) => "Failed to publish".to_string(),
            other => other.to_string(),
        };
        HttpResponse::build(self.status_code()).json(ErrorResponse { error })
    }
}
