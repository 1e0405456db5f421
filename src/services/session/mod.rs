//! Session lifecycle: load, validate, log in, invalidate
//!
//! The manager owns the only copy of the current `SessionArtifact`. Callers
//! get an `Arc` snapshot; a re-login swaps in a new artifact and never mutates
//! the old one, so a stale snapshot stays internally consistent.

pub mod browser;
pub mod cdp;
pub mod store;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{LoginError, PipelineError};
use crate::models::{CapturedAuth, SessionArtifact};
use crate::services::credentials::CredentialStore;
use crate::services::metrics;

pub use browser::{ChromeLoginDriver, LoginDriver};
pub use store::SessionStore;

/// Image sizes requested with schedule calls when the capture has none
pub const DEFAULT_FIS_PROPERTIES: &str = "bg-fplayer=2048*1152|iconic=250*144";

/// Freshness and retry rules
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub max_age: ChronoDuration,
    pub expiry_skew: ChronoDuration,
    pub login_attempts: u32,
    pub retry_delay: Duration,
}

impl SessionPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_age: ChronoDuration::hours(config.session_max_age_hours),
            expiry_skew: ChronoDuration::seconds(config.session_expiry_skew_secs),
            login_attempts: config.login_attempts.max(1),
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Proactive staleness: too old, or the token is about to expire
    pub fn is_fresh(&self, artifact: &SessionArtifact, now: DateTime<Utc>) -> bool {
        if now - artifact.acquired_at >= self.max_age {
            return false;
        }
        match artifact.token_expires_at {
            Some(exp) => exp - self.expiry_skew > now,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Fresh,
    Stale,
    Absent,
}

/// Session summary for the status endpoint (no secrets)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct SessionSlot {
    loaded: bool,
    current: Option<Arc<SessionArtifact>>,
    /// Set when the provider rejected `current`
    rejected: bool,
}

/// Copy of the slot readable while a login holds the slot lock
#[derive(Default, Clone)]
struct SlotSnapshot {
    current: Option<Arc<SessionArtifact>>,
    rejected: bool,
}

pub struct SessionManager {
    credentials: CredentialStore,
    driver: Arc<dyn LoginDriver>,
    store: SessionStore,
    policy: SessionPolicy,
    slot: Mutex<SessionSlot>,
    snapshot: RwLock<SlotSnapshot>,
}

impl SessionManager {
    pub fn new(
        credentials: CredentialStore,
        driver: Arc<dyn LoginDriver>,
        store: SessionStore,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            credentials,
            driver,
            store,
            policy,
            slot: Mutex::new(SessionSlot::default()),
            snapshot: RwLock::new(SlotSnapshot::default()),
        }
    }

    /// Mirror the slot for `info`; call after every slot change
    fn publish(&self, slot: &SessionSlot) {
        if let Ok(mut snapshot) = self.snapshot.write() {
            *snapshot = SlotSnapshot {
                current: slot.current.clone(),
                rejected: slot.rejected,
            };
        }
    }

    /// Return a usable session, logging in if there is none.
    ///
    /// The slot lock is held across the login, so concurrent callers wait for
    /// the in-flight login and reuse its artifact.
    pub async fn ensure_session(&self) -> Result<Arc<SessionArtifact>, PipelineError> {
        let mut slot = self.slot.lock().await;

        if !slot.loaded {
            slot.current = self.store.load().await.map(Arc::new);
            slot.loaded = true;
            self.publish(&slot);
            if slot.current.is_some() {
                tracing::info!("Loaded persisted session from {}", self.store.path().display());
            }
        }

        if let Some(current) = &slot.current {
            if !slot.rejected && self.policy.is_fresh(current, Utc::now()) {
                return Ok(current.clone());
            }
            tracing::info!(
                acquired_at = %current.acquired_at,
                rejected = slot.rejected,
                "Session is stale, re-authenticating"
            );
        }

        match self.login_with_retries().await {
            Ok(artifact) => {
                let artifact = Arc::new(artifact);
                if let Err(e) = self.store.save(&artifact).await {
                    tracing::warn!("Session captured but not persisted: {:#}", e);
                }
                slot.current = Some(artifact.clone());
                slot.rejected = false;
                self.publish(&slot);
                Ok(artifact)
            }
            Err(e) => {
                slot.current = None;
                slot.rejected = false;
                self.publish(&slot);
                if let Err(remove_err) = self.store.remove().await {
                    tracing::warn!("{:#}", remove_err);
                }
                Err(e)
            }
        }
    }

    async fn login_with_retries(&self) -> Result<SessionArtifact, PipelineError> {
        let attempts = self.policy.login_attempts;
        let mut last_err: Option<LoginError> = None;

        for attempt in 1..=attempts {
            tracing::info!(attempt, attempts, "Starting browser login");
            match self.driver.login(self.credentials.get()).await {
                Ok(captured) => match build_artifact(captured, &self.credentials.account_id(), Utc::now()) {
                    Ok(artifact) => {
                        metrics::LOGINS_TOTAL.with_label_values(&["success"]).inc();
                        tracing::info!(
                            session_id = %artifact.session_id,
                            token_expires_at = ?artifact.token_expires_at,
                            "Login succeeded"
                        );
                        return Ok(artifact);
                    }
                    Err(e) => last_err = Some(e),
                },
                Err(e) => last_err = Some(e),
            }

            metrics::LOGINS_TOTAL.with_label_values(&["failure"]).inc();
            if let Some(e) = &last_err {
                tracing::warn!(attempt, "Login attempt failed: {}", e);
            }
            if attempt < attempts {
                tokio::time::sleep(self.policy.retry_delay * attempt).await;
            }
        }

        Err(last_err
            .map(PipelineError::from)
            .unwrap_or_else(|| PipelineError::LoginFailed("no login attempt made".to_string())))
    }

    /// Mark `artifact` stale after the provider rejected it.
    ///
    /// Ignored when `artifact` is no longer the current one, so a burst of
    /// rejections against the same token causes one re-login.
    pub async fn report_unauthorized(&self, artifact: &SessionArtifact) -> bool {
        let mut slot = self.slot.lock().await;
        match &slot.current {
            Some(current) if current.session_id == artifact.session_id => {
                if !slot.rejected {
                    tracing::warn!(session_id = %artifact.session_id, "Provider rejected session");
                }
                slot.rejected = true;
                self.publish(&slot);
                true
            }
            _ => false,
        }
    }

    /// Drop the current session; the next `ensure_session` logs in
    pub async fn invalidate(&self) -> Result<(), PipelineError> {
        let mut slot = self.slot.lock().await;
        slot.current = None;
        slot.rejected = false;
        slot.loaded = true;
        self.publish(&slot);
        self.store
            .remove()
            .await
            .map_err(|e| PipelineError::Publish(format!("{:#}", e)))?;
        tracing::info!("Session invalidated");
        Ok(())
    }

    /// Status summary. Never waits on an in-flight login.
    pub async fn info(&self) -> SessionInfo {
        let snapshot = self
            .snapshot
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        match &snapshot.current {
            Some(a) => SessionInfo {
                state: if !snapshot.rejected && self.policy.is_fresh(a, Utc::now()) {
                    SessionState::Fresh
                } else {
                    SessionState::Stale
                },
                acquired_at: Some(a.acquired_at),
                token_expires_at: a.token_expires_at,
            },
            None => SessionInfo {
                state: SessionState::Absent,
                acquired_at: None,
                token_expires_at: None,
            },
        }
    }
}

/// Turn a raw browser capture into a session artifact
pub fn build_artifact(
    captured: CapturedAuth,
    account_id: &str,
    now: DateTime<Utc>,
) -> Result<SessionArtifact, LoginError> {
    let raw = captured.authorization.trim();
    let token = match raw.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        // A scheme word on its own carries no token
        None if raw.eq_ignore_ascii_case("bearer") => "",
        _ => raw,
    }
    .to_string();
    if token.is_empty() {
        return Err(LoginError::Browser("captured request had no bearer token".to_string()));
    }

    let query: Vec<(String, String)> = url::Url::parse(&captured.request_url)
        .map(|u| u.query_pairs().into_owned().collect())
        .unwrap_or_default();
    let param = |name: &str| {
        query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .filter(|v| !v.is_empty())
    };

    let client_context = param("clientContext").unwrap_or_else(|| {
        tracing::warn!("Captured request carries no clientContext");
        String::new()
    });
    let fis_properties = param("fisProperties").unwrap_or_else(|| DEFAULT_FIS_PROPERTIES.to_string());

    Ok(SessionArtifact {
        session_id: Uuid::new_v4(),
        account_id: account_id.to_string(),
        token_expires_at: jwt_expiry(&token),
        authorization: token,
        cookies: captured.cookies,
        client_context,
        fis_properties,
        request_url: captured.request_url,
        acquired_at: now,
    })
}

/// `exp` claim of a JWT, if the token is one
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::Cookie;
    use crate::services::credentials::Credentials;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Login driver that counts calls and fails the first `fail_first` of them
    pub(crate) struct FakeDriver {
        pub calls: AtomicUsize,
        pub fail_first: usize,
        pub delay: Duration,
    }

    impl FakeDriver {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first: 0,
                delay: Duration::from_millis(0),
            }
        }
    }

    #[async_trait]
    impl LoginDriver for FakeDriver {
        async fn login(&self, _credentials: &Credentials) -> Result<CapturedAuth, LoginError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if n < self.fail_first {
                return Err(LoginError::SelectorNotFound("input[type=\"email\"]".to_string()));
            }
            Ok(CapturedAuth {
                authorization: format!("Bearer token-{}", n),
                request_url: "https://api.cld.dtvce.com/discovery/metadata/channel/v5/service/allchannels?sort=OrdCh%3DASC&clientContext=ctx-1".to_string(),
                cookies: vec![Cookie {
                    name: "s".to_string(),
                    value: "1".to_string(),
                    domain: ".dtvce.com".to_string(),
                    path: "/".to_string(),
                }],
            })
        }
    }

    pub(crate) fn test_policy() -> SessionPolicy {
        SessionPolicy {
            max_age: ChronoDuration::hours(12),
            expiry_skew: ChronoDuration::seconds(300),
            login_attempts: 3,
            retry_delay: Duration::from_millis(0),
        }
    }

    pub(crate) fn manager(dir: &std::path::Path, driver: Arc<FakeDriver>) -> SessionManager {
        SessionManager::new(
            CredentialStore::new("viewer@example.com", "pw"),
            driver,
            SessionStore::new(dir.join("session.json")),
            test_policy(),
        )
    }

    fn jwt_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{}}}"#, exp));
        format!("{}.{}.sig", header, payload)
    }

    #[test]
    fn test_build_artifact_extracts_context() {
        let captured = CapturedAuth {
            authorization: "Bearer abc".to_string(),
            request_url: "https://api.cld.dtvce.com/right/authorization/channel/v1?ccid=5&clientContext=proximity%3Dnear".to_string(),
            cookies: vec![],
        };
        let a = build_artifact(captured, "acct", Utc::now()).unwrap();
        assert_eq!(a.authorization, "abc");
        assert_eq!(a.client_context, "proximity=near");
        assert_eq!(a.fis_properties, DEFAULT_FIS_PROPERTIES);
        assert!(a.token_expires_at.is_none());
    }

    #[test]
    fn test_build_artifact_requires_token() {
        let captured = CapturedAuth {
            authorization: "Bearer ".to_string(),
            ..CapturedAuth::default()
        };
        assert!(build_artifact(captured, "acct", Utc::now()).is_err());

        let captured = CapturedAuth {
            authorization: "bearer".to_string(),
            ..CapturedAuth::default()
        };
        assert!(build_artifact(captured, "acct", Utc::now()).is_err());
    }

    #[test]
    fn test_build_artifact_strips_scheme_case_insensitively() {
        for header in ["BEARER abc", "Bearer   abc ", "abc"] {
            let captured = CapturedAuth {
                authorization: header.to_string(),
                ..CapturedAuth::default()
            };
            assert_eq!(build_artifact(captured, "acct", Utc::now()).unwrap().authorization, "abc");
        }
    }

    #[tokio::test]
    async fn test_info_does_not_wait_for_login() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeDriver::new();
        fake.delay = Duration::from_secs(3);
        let sessions = Arc::new(manager(dir.path(), Arc::new(fake)));

        let login = {
            let s = sessions.clone();
            tokio::spawn(async move { s.ensure_session().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let info = tokio::time::timeout(Duration::from_millis(500), sessions.info())
            .await
            .expect("info blocked behind the login");
        assert_eq!(info.state, SessionState::Absent);

        login.abort();
    }

    #[tokio::test]
    async fn test_info_tracks_login_and_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = manager(dir.path(), Arc::new(FakeDriver::new()));

        let artifact = sessions.ensure_session().await.unwrap();
        let info = sessions.info().await;
        assert_eq!(info.state, SessionState::Fresh);
        assert_eq!(info.acquired_at, Some(artifact.acquired_at));

        sessions.report_unauthorized(&artifact).await;
        assert_eq!(sessions.info().await.state, SessionState::Stale);
    }

    #[test]
    fn test_jwt_expiry_and_freshness() {
        let now = Utc::now();
        let exp = now.timestamp() + 120;
        let token = jwt_with_exp(exp);
        assert_eq!(jwt_expiry(&token).map(|d| d.timestamp()), Some(exp));
        assert!(jwt_expiry("opaque-token").is_none());

        let artifact = build_artifact(
            CapturedAuth {
                authorization: format!("Bearer {}", token),
                ..CapturedAuth::default()
            },
            "acct",
            now,
        )
        .unwrap();

        // Expires within the 300s skew
        assert!(!test_policy().is_fresh(&artifact, now));

        let mut long_lived = artifact.clone();
        long_lived.token_expires_at = Some(now + ChronoDuration::hours(6));
        assert!(test_policy().is_fresh(&long_lived, now));
        assert!(!test_policy().is_fresh(&long_lived, now + ChronoDuration::hours(13)));
    }

    #[tokio::test]
    async fn test_logs_in_once_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new());
        let sessions = manager(dir.path(), driver.clone());

        let first = sessions.ensure_session().await.unwrap();
        let second = sessions.ensure_session().await.unwrap();
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.client_context, "ctx-1");

        // A fresh manager picks the persisted artifact up without logging in
        let driver2 = Arc::new(FakeDriver::new());
        let reloaded = manager(dir.path(), driver2.clone());
        let third = reloaded.ensure_session().await.unwrap();
        assert_eq!(third.session_id, first.session_id);
        assert_eq!(driver2.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_login() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeDriver::new();
        fake.delay = Duration::from_millis(50);
        let driver = Arc::new(fake);
        let sessions = Arc::new(manager(dir.path(), driver.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = sessions.clone();
            handles.push(tokio::spawn(async move { s.ensure_session().await }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap().session_id);
        }

        assert_eq!(driver.calls.load(Ordering::SeqCst), 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_report_unauthorized_ignores_replaced_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new());
        let sessions = manager(dir.path(), driver.clone());

        let old = sessions.ensure_session().await.unwrap();
        assert!(sessions.report_unauthorized(&old).await);
        // Second report against the same token is still accepted but harmless
        assert!(sessions.report_unauthorized(&old).await);

        let new = sessions.ensure_session().await.unwrap();
        assert_ne!(old.session_id, new.session_id);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 2);

        // Late rejection of the old token must not discard the new one
        assert!(!sessions.report_unauthorized(&old).await);
        let still = sessions.ensure_session().await.unwrap();
        assert_eq!(still.session_id, new.session_id);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_by_age_triggers_login() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));
        let mut old = build_artifact(
            CapturedAuth {
                authorization: "Bearer old".to_string(),
                ..CapturedAuth::default()
            },
            "acct",
            Utc::now() - ChronoDuration::hours(13),
        )
        .unwrap();
        old.client_context = "old".to_string();
        store.save(&old).await.unwrap();

        let driver = Arc::new(FakeDriver::new());
        let sessions = manager(dir.path(), driver.clone());
        let current = sessions.ensure_session().await.unwrap();
        assert_ne!(current.session_id, old.session_id);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_login() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new());
        let sessions = manager(dir.path(), driver.clone());

        sessions.ensure_session().await.unwrap();
        sessions.invalidate().await.unwrap();
        assert!(!dir.path().join("session.json").exists());
        assert_eq!(sessions.info().await.state, SessionState::Absent);

        sessions.ensure_session().await.unwrap();
        assert_eq!(driver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_login_retries_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeDriver::new();
        fake.fail_first = 10;
        let driver = Arc::new(fake);
        let sessions = manager(dir.path(), driver.clone());

        let err = sessions.ensure_session().await.unwrap_err();
        assert_eq!(err.kind(), "login_failed");
        assert_eq!(driver.calls.load(Ordering::SeqCst), 3);
        assert!(!dir.path().join("session.json").exists());
    }

    #[tokio::test]
    async fn test_login_recovers_within_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeDriver::new();
        fake.fail_first = 2;
        let driver = Arc::new(fake);
        let sessions = manager(dir.path(), driver.clone());

        assert!(sessions.ensure_session().await.is_ok());
        assert_eq!(driver.calls.load(Ordering::SeqCst), 3);
    }
}
