use std::time::Duration;
use thiserror::Error;

/// Failure talking to the model endpoint.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvocationError {
    #[error("model call timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("rate limited (429): {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("model endpoint error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response from model endpoint: {0}")]
    InvalidResponse(String),

    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("request rejected ({status}): {message}")]
    BadRequest { status: u16, message: String },

    #[error("model client misconfigured: {0}")]
    Config(String),

    #[error("gave up after {attempts} attempts, last error: {last}")]
    Exhausted {
        attempts: usize,
        last: Box<InvocationError>,
    },
}

impl InvocationError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimited { .. } | Self::Server { .. } | Self::Network(_) | Self::InvalidResponse(_)
        )
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, retry_after: Option<Duration>, body: &str) -> Self {
        let message = truncate_message(body);
        match status {
            429 => Self::RateLimited { retry_after, message },
            401 | 403 => Self::Auth { status, message },
            408 => Self::Server { status, message },
            500..=599 => Self::Server { status, message },
            _ => Self::BadRequest { status, message },
        }
    }
}

impl From<reqwest::Error> for InvocationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else if e.is_builder() {
            Self::Config(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

fn truncate_message(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(300) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

/// Model reply that does not match the assessment schema.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("reply contains no JSON object")]
    NoJson,

    #[error("reply JSON is invalid: {0}")]
    InvalidJson(String),

    #[error("reply JSON is not an object")]
    NotAnObject,

    #[error("required field '{0}' is missing")]
    MissingField(&'static str),

    #[error("required field '{0}' is empty")]
    EmptyField(&'static str),

    #[error("field '{field}' must be {expected}")]
    WrongType { field: &'static str, expected: &'static str },

    #[error("verdict '{0}' is not one of sufficient, insufficient, indeterminate")]
    UnknownVerdict(String),
}
