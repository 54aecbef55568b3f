use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of body characters kept on a [`Failure`] for diagnostics.
pub const BODY_EXCERPT_LIMIT: usize = 5000;

/// Retry metadata surfaced on failures when retries were attempted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryMetadata {
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Structured validation/build error returned by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "{}: {}", field, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<String> for ValidationError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ValidationError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Application-level error carried inside an otherwise successful payload
/// (for example one failed query of a batch).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct APIError {
    pub code: Option<i64>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
}

impl APIError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            raw_body: None,
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }
}

impl fmt::Display for APIError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "api error {}: {}", code, self.message)
        } else {
            write!(f, "api error: {}", self.message)
        }
    }
}

impl std::error::Error for APIError {}

/// Classified failure kinds produced by the response classifier and the
/// session validator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 5xx responses kept coming after the retry budget was spent.
    RetryExhausted,
    /// A 3xx response without a `Location` header.
    MalformedRedirect,
    /// Redirected to a login, checkpoint or recovery page.
    LoginRedirect,
    /// The body is an HTML login/checkpoint page.
    HtmlLoginPage,
    /// The body failed to parse and looks like a login form.
    HtmlLoginPageParseFail,
    /// The body failed to parse as JSON.
    JsonParse,
    /// Unexpected non-200 status.
    Http,
    /// The payload carries a "not logged in" application error.
    NotLoggedIn,
    /// Redirect chain exceeded the configured bound.
    TooManyRedirects,
    /// The account is held at a security checkpoint.
    Checkpoint,
    /// 401/403 from a probe.
    Unauthorized,
    /// No cookie jar entry for the identity cookie.
    MissingSession,
}

impl FailureKind {
    /// Whether the failure means the session is no longer usable and an outer
    /// layer should re-authenticate.
    pub fn is_auth_failure(self) -> bool {
        matches!(
            self,
            FailureKind::LoginRedirect
                | FailureKind::HtmlLoginPage
                | FailureKind::HtmlLoginPageParseFail
                | FailureKind::NotLoggedIn
                | FailureKind::Checkpoint
                | FailureKind::Unauthorized
                | FailureKind::MissingSession
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::RetryExhausted => "retry_exhausted",
            FailureKind::MalformedRedirect => "malformed_redirect",
            FailureKind::LoginRedirect => "login_redirect",
            FailureKind::HtmlLoginPage => "html_login_page",
            FailureKind::HtmlLoginPageParseFail => "html_login_page_parse_fail",
            FailureKind::JsonParse => "json_parse_error",
            FailureKind::Http => "http_error",
            FailureKind::NotLoggedIn => "not_logged_in",
            FailureKind::TooManyRedirects => "too_many_redirects",
            FailureKind::Checkpoint => "checkpoint",
            FailureKind::Unauthorized => "unauthorized",
            FailureKind::MissingSession => "missing_session",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure surfaced to callers: kind, status (if any), a truncated body
/// excerpt and the redirect target when one was involved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_excerpt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryMetadata>,
}

impl Failure {
    pub fn new(kind: FailureKind) -> Self {
        Self {
            kind,
            status: None,
            body_excerpt: None,
            location: None,
            retries: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach the body, truncated to [`BODY_EXCERPT_LIMIT`] characters.
    pub fn with_body(mut self, body: &str) -> Self {
        if !body.is_empty() {
            self.body_excerpt = Some(excerpt(body));
        }
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_retries(mut self, retries: Option<RetryMetadata>) -> Self {
        self.retries = retries;
        self
    }

    pub fn is_auth_failure(&self) -> bool {
        self.kind.is_auth_failure()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, &self.location) {
            (Some(status), Some(location)) => {
                write!(f, "{} ({}) -> {}", self.kind, status, location)
            }
            (Some(status), None) => write!(f, "{} ({})", self.kind, status),
            (None, Some(location)) => write!(f, "{} -> {}", self.kind, location),
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Failure {}

/// First [`BODY_EXCERPT_LIMIT`] characters of `body`, split on a char boundary.
pub(crate) fn excerpt(body: &str) -> String {
    match body.char_indices().nth(BODY_EXCERPT_LIMIT) {
        Some((idx, _)) => body[..idx].to_string(),
        None => body.to_string(),
    }
}

/// Convenience alias for fallible client results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Transport-level error (timeouts, DNS/TLS/connectivity).
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    #[source]
    pub source: Option<reqwest::Error>,
    pub retries: Option<RetryMetadata>,
}

impl TransportError {
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_request() || err.is_body() {
            TransportErrorKind::Request
        } else {
            TransportErrorKind::Other
        };
        Self {
            kind,
            message: err.to_string(),
            source: Some(err),
            retries: None,
        }
    }
}

/// Broad transport error kinds for classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Request,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Request => "request",
            TransportErrorKind::Other => "transport",
        };
        write!(f, "{label}")
    }
}

/// Unified error type surfaced by the client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Api(#[from] APIError),

    #[error("{0}")]
    Failure(#[from] Failure),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("publish failed on {topic}: {message}")]
    Publish { topic: String, message: String },
}

impl Error {
    /// The classified failure kind, when this error came from the classifier
    /// or the session validator.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Error::Failure(failure) => Some(failure.kind),
            _ => None,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        self.failure_kind().is_some_and(FailureKind::is_auth_failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_formats_with_field() {
        let err = ValidationError::new("is required").with_field("message_id");
        assert_eq!(err.to_string(), "message_id: is required");
    }

    #[test]
    fn failure_keeps_status_location_and_excerpt() {
        let body = "x".repeat(BODY_EXCERPT_LIMIT + 10);
        let failure = Failure::new(FailureKind::LoginRedirect)
            .with_status(302)
            .with_location("https://example.com/login.php")
            .with_body(&body);

        assert_eq!(
            failure.to_string(),
            "login_redirect (302) -> https://example.com/login.php"
        );
        assert_eq!(
            failure.body_excerpt.as_ref().map(|b| b.len()),
            Some(BODY_EXCERPT_LIMIT)
        );
        assert!(failure.is_auth_failure());
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        let body = "é".repeat(BODY_EXCERPT_LIMIT + 1);
        assert_eq!(excerpt(&body).chars().count(), BODY_EXCERPT_LIMIT);
    }

    #[test]
    fn server_failures_are_not_auth_failures() {
        let err = Error::from(Failure::new(FailureKind::RetryExhausted).with_status(503));
        assert_eq!(err.failure_kind(), Some(FailureKind::RetryExhausted));
        assert!(!err.is_auth_failure());
    }
}
