use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Browser cookie captured during login
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    "/".to_string()
}

impl Cookie {
    /// Whether this cookie would be sent to `host`
    pub fn matches_host(&self, host: &str) -> bool {
        let domain = self.domain.trim_start_matches('.');
        if domain.is_empty() {
            return false;
        }
        host == domain || host.ends_with(&format!(".{}", domain))
    }
}

/// Authentication material produced by a browser login.
///
/// Replaced wholesale on re-authentication, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionArtifact {
    pub session_id: Uuid,
    pub account_id: String,
    /// Bearer token without the "Bearer " prefix
    pub authorization: String,
    pub cookies: Vec<Cookie>,
    pub client_context: String,
    pub fis_properties: String,
    /// Provider request the token was captured from
    pub request_url: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<DateTime<Utc>>,
}

impl SessionArtifact {
    /// `Cookie` header value for requests to `host`
    pub fn cookie_header(&self, host: &str) -> Option<String> {
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| c.matches_host(host))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }
}

/// Raw capture handed back by a login driver
#[derive(Debug, Clone, Default)]
pub struct CapturedAuth {
    /// Authorization header value, possibly with "Bearer " prefix
    pub authorization: String,
    pub request_url: String,
    pub cookies: Vec<Cookie>,
}
