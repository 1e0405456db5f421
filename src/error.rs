//! Error taxonomy for the acquisition and publishing pipeline
//!
//! Low-level errors (`FetchError` from the provider client, `LoginError` from
//! the browser driver) are classified into `PipelineError` at the fetcher and
//! session boundaries. Only `PipelineError` reaches the orchestrator.

use thiserror::Error;

/// Errors that end (or are recorded against) a refresh cycle
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("authorization expired: {0}")]
    AuthorizationExpired(String),

    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("unusable upstream data: {0}")]
    UpstreamData(String),

    #[error("render failed: {0}")]
    Render(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("refresh timed out after {0}s")]
    Timeout(u64),

    #[error("a refresh is already running")]
    AlreadyRunning,
}

impl PipelineError {
    /// Stable identifier recorded in refresh history
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::TransientNetwork(_) => "transient_network",
            PipelineError::AuthorizationExpired(_) => "authorization_expired",
            PipelineError::LoginFailed(_) => "login_failed",
            PipelineError::UpstreamData(_) => "upstream_data",
            PipelineError::Render(_) => "render",
            PipelineError::Publish(_) => "publish",
            PipelineError::Timeout(_) => "timeout",
            PipelineError::AlreadyRunning => "already_running",
        }
    }

    /// Whether the error is tied to the session and should not be absorbed
    /// as a per-channel warning
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            PipelineError::AuthorizationExpired(_) | PipelineError::LoginFailed(_)
        )
    }
}

/// Errors from a single provider API call (after retries)
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("session rejected by provider (HTTP {0})")]
    Unauthorized(u16),

    #[error("malformed response: {0}")]
    Parse(String),
}

impl FetchError {
    /// Statuses worth another attempt with backoff
    pub fn is_retryable_status(status: u16) -> bool {
        matches!(status, 408 | 425 | 429 | 500 | 502 | 503 | 504)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Parse(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Network(msg) => PipelineError::TransientNetwork(msg),
            FetchError::Http { status, body } if FetchError::is_retryable_status(status) => {
                PipelineError::TransientNetwork(format!("HTTP {}: {}", status, body))
            }
            FetchError::Http { status, body } => {
                PipelineError::UpstreamData(format!("HTTP {}: {}", status, body))
            }
            FetchError::Unauthorized(status) => {
                PipelineError::AuthorizationExpired(format!("HTTP {}", status))
            }
            FetchError::Parse(msg) => PipelineError::UpstreamData(msg),
        }
    }
}

/// Errors from a browser login attempt
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("login timed out: {0}")]
    Timeout(String),

    #[error("login form element not found: {0}")]
    SelectorNotFound(String),

    #[error("credentials rejected: {0}")]
    CredentialsRejected(String),

    #[error("browser error: {0}")]
    Browser(String),
}

impl From<LoginError> for PipelineError {
    fn from(err: LoginError) -> Self {
        PipelineError::LoginFailed(err.to_string())
    }
}

/// Detect an "expired session" payload returned with a 2xx or 4xx status.
///
/// Entitlement answers ("not authorized for this channel") are not session
/// expiry and must not match.
pub fn is_session_expired_payload(value: &serde_json::Value) -> bool {
    const MARKERS: [&str; 7] = [
        "expired",
        "invalid_token",
        "invalid token",
        "unauthenticated",
        "not authenticated",
        "session invalid",
        "reauth",
    ];

    let obj = match value.as_object() {
        Some(o) => o,
        None => return false,
    };

    ["errorCode", "code", "message", "error", "errorMessage"]
        .iter()
        .filter_map(|key| obj.get(*key))
        .filter_map(|v| match v {
            serde_json::Value::String(s) => Some(s.to_ascii_lowercase()),
            serde_json::Value::Object(inner) => inner
                .get("message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_ascii_lowercase()),
            _ => None,
        })
        .any(|text| MARKERS.iter().any(|m| text.contains(m)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_strings() {
        assert_eq!(PipelineError::Timeout(5).kind(), "timeout");
        assert_eq!(PipelineError::AlreadyRunning.kind(), "already_running");
        assert_eq!(
            PipelineError::LoginFailed("x".into()).kind(),
            "login_failed"
        );
    }

    #[test]
    fn test_fetch_error_classification() {
        let e: PipelineError = FetchError::Unauthorized(401).into();
        assert!(matches!(e, PipelineError::AuthorizationExpired(_)));

        let e: PipelineError = FetchError::Http {
            status: 503,
            body: String::new(),
        }
        .into();
        assert_eq!(e.kind(), "transient_network");

        let e: PipelineError = FetchError::Http {
            status: 404,
            body: String::new(),
        }
        .into();
        assert_eq!(e.kind(), "upstream_data");
    }

    #[test]
    fn test_session_expired_payload() {
        assert!(is_session_expired_payload(
            &json!({"errorCode": "TOKEN_EXPIRED"})
        ));
        assert!(is_session_expired_payload(
            &json!({"error": {"message": "Session expired, please sign in"}})
        ));
        assert!(is_session_expired_payload(
            &json!({"code": "UNAUTHENTICATED"})
        ));
        assert!(!is_session_expired_payload(
            &json!({"message": "User is not authorized for this channel"})
        ));
        assert!(!is_session_expired_payload(
            &json!({"errorCode": "UNAUTHORIZED_CHANNEL"})
        ));
        assert!(!is_session_expired_payload(&json!({"channels": []})));
        assert!(!is_session_expired_payload(&json!([1, 2])));
    }
}
