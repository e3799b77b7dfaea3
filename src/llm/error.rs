//! Model API errors and their retry classification.
//!
//! Rate limits back off exponentially, other transient failures linearly,
//! and permanent errors are returned at once.

use std::time::Duration;

use thiserror::Error;

/// Error from a chat or embedding call.
#[derive(Debug, Clone, Error)]
#[error("{kind}{}: {message}", http_suffix(.status_code))]
pub struct LlmError {
    pub kind: LlmErrorKind,
    /// Upstream HTTP status, when there was a response
    pub status_code: Option<u16>,
    pub message: String,
    /// Delay requested by the provider's `Retry-After` header
    pub retry_after: Option<Duration>,
}

fn http_suffix(status_code: &Option<u16>) -> String {
    status_code
        .map(|code| format!(" (HTTP {})", code))
        .unwrap_or_default()
}

impl LlmError {
    fn of(kind: LlmErrorKind, status_code: Option<u16>, message: String) -> Self {
        Self {
            kind,
            status_code,
            message,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::of(LlmErrorKind::RateLimited, Some(429), message)
        }
    }

    pub fn server_error(status_code: u16, message: String) -> Self {
        Self::of(LlmErrorKind::ServerError, Some(status_code), message)
    }

    /// A 4xx other than 429.
    pub fn client_error(status_code: u16, message: String) -> Self {
        Self::of(LlmErrorKind::ClientError, Some(status_code), message)
    }

    pub fn network_error(message: String) -> Self {
        Self::of(LlmErrorKind::NetworkError, None, message)
    }

    /// The provider answered but the body was unusable.
    pub fn parse_error(message: String) -> Self {
        Self::of(LlmErrorKind::ParseError, None, message)
    }

    /// Map a non-2xx response to an error.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        match classify_http_status(status) {
            LlmErrorKind::RateLimited => Self::rate_limited(body.to_string(), retry_after),
            LlmErrorKind::ClientError => Self::client_error(status, body.to_string()),
            _ => Self::server_error(status, body.to_string()),
        }
    }

    pub fn from_reqwest(e: reqwest::Error) -> Self {
        let what = if e.is_timeout() {
            "Request timed out"
        } else if e.is_connect() {
            "Could not connect"
        } else {
            "Request failed"
        };
        Self::network_error(format!("{}: {}", what, e))
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == LlmErrorKind::RateLimited
    }

    /// Whether another attempt could succeed.
    ///
    /// Bad requests and auth failures are final. Everything else, including
    /// garbled bodies, gets another try.
    pub fn is_retryable(&self) -> bool {
        if self.kind != LlmErrorKind::ClientError {
            return true;
        }
        !matches!(self.status_code, Some(400 | 401 | 403 | 404))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LlmErrorKind {
    #[error("Rate limited")]
    RateLimited,
    #[error("Server error")]
    ServerError,
    #[error("Client error")]
    ClientError,
    #[error("Network error")]
    NetworkError,
    #[error("Parse error")]
    ParseError,
}

pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}

/// `Retry-After` in its delta-seconds form.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_classify() {
        assert_eq!(classify_http_status(429), LlmErrorKind::RateLimited);
        assert_eq!(classify_http_status(503), LlmErrorKind::ServerError);
        assert_eq!(classify_http_status(401), LlmErrorKind::ClientError);
        assert_eq!(classify_http_status(302), LlmErrorKind::ServerError);
    }

    #[test]
    fn auth_failures_are_final() {
        for status in [400, 401, 403, 404] {
            assert!(!LlmError::client_error(status, "final".into()).is_retryable());
        }
        assert!(LlmError::client_error(408, "slow".into()).is_retryable());
        assert!(LlmError::parse_error("garbled".into()).is_retryable());
        assert!(LlmError::from_status(429, "slow down", None).is_rate_limited());
    }

    #[test]
    fn display_includes_status_when_known() {
        let err = LlmError::server_error(502, "bad gateway".into());
        assert_eq!(err.to_string(), "Server error (HTTP 502): bad gateway");
        let err = LlmError::network_error("refused".into());
        assert_eq!(err.to_string(), "Network error: refused");
    }
}
