use std::time::Duration;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use provisioner_sdk::ProvisionerError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("{0}")]
    Configuration(String),
    #[error("{0}")]
    Validation(String),
    #[error("Invalid session_id")]
    UnknownSession,
    #[error("{message}")]
    Upstream {
        status: Option<StatusCode>,
        message: String,
    },
    #[error("Too many requests")]
    RateLimited { retry_after: Duration },
    #[error("{0}")]
    Csrf(&'static str),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl BrokerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BrokerError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::Validation(_) | BrokerError::UnknownSession => StatusCode::BAD_REQUEST,
            BrokerError::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            BrokerError::Csrf(_) => StatusCode::FORBIDDEN,
            BrokerError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to a browser client.
    pub fn client_message(&self) -> String {
        match self {
            BrokerError::Transport(_) => "Server error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            BrokerError::Configuration(_) => "configuration",
            BrokerError::Validation(_) => "validation",
            BrokerError::UnknownSession => "unknown_session",
            BrokerError::Upstream { .. } => "upstream",
            BrokerError::RateLimited { .. } => "rate_limited",
            BrokerError::Csrf(_) => "csrf",
            BrokerError::Transport(_) => "transport",
        }
    }
}

impl From<ProvisionerError> for BrokerError {
    fn from(err: ProvisionerError) -> Self {
        match err {
            ProvisionerError::MissingApiKey => {
                BrokerError::Configuration("Missing Hyperbeam API key".to_string())
            }
            ProvisionerError::Http(err) => BrokerError::Transport(err.to_string()),
            ProvisionerError::Upstream { status, message } => BrokerError::Upstream {
                status: Some(status),
                message,
            },
            ProvisionerError::Malformed(message) => BrokerError::Upstream {
                status: None,
                message,
            },
        }
    }
}

/// Error rendered to clients as `{ "error": message }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    retry_after: Option<Duration>,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn method_not_allowed() -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        let retry_after = match &err {
            BrokerError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };
        Self {
            status: err.status_code(),
            message: err.client_message(),
            retry_after,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            Json(ApiErrorBody {
                error: self.message,
            }),
        )
            .into_response();
        if let Some(retry_after) = self.retry_after {
            // Round up so clients never retry inside the window.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
