//! Browser-driven login against the provider web portal

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};

use super::cdp::{header_value, BrowserProcess, CdpConnection, CdpEvent, LaunchOptions};
use crate::config::Config;
use crate::error::LoginError;
use crate::models::{CapturedAuth, Cookie};
use crate::services::credentials::Credentials;

pub const GUIDE_URL: &str = "https://stream.directv.com/guide";

/// Requests whose Authorization header is the session token
const AUTH_MARKERS: [&str; 2] = [
    "/right/authorization/channel/v1",
    "/discovery/metadata/channel/v5/service/allchannels",
];

const EMAIL_SELECTOR: &str = r#"input[type="email"]"#;
const PASSWORD_SELECTOR: &str = r#"input[type="password"]"#;

/// Something that can log in and hand back the captured auth material
#[async_trait]
pub trait LoginDriver: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<CapturedAuth, LoginError>;
}

/// Login driver backed by headless Chromium over DevTools
pub struct ChromeLoginDriver {
    launch: LaunchOptions,
    page_timeout: Duration,
}

impl ChromeLoginDriver {
    pub fn new(config: &Config) -> Self {
        Self {
            launch: LaunchOptions {
                executable: config.browser_path.clone(),
                profile_dir: config.browser_profile_dir(),
                headless: config.browser_headless,
                user_agent: config.user_agent.clone(),
                startup_timeout: Duration::from_secs(30),
            },
            page_timeout: Duration::from_secs(config.login_timeout_secs),
        }
    }

    async fn run(
        &self,
        browser: &BrowserProcess,
        credentials: &Credentials,
    ) -> Result<CapturedAuth, LoginError> {
        let (cdp, events) = CdpConnection::connect(browser.ws_url()).await?;

        let target = cdp
            .call("Target.createTarget", json!({ "url": "about:blank" }), None)
            .await?;
        let target_id = target
            .get("targetId")
            .and_then(|t| t.as_str())
            .ok_or_else(|| LoginError::Browser("createTarget returned no targetId".to_string()))?
            .to_string();

        let attached = cdp
            .call(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                None,
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(|s| s.as_str())
            .ok_or_else(|| LoginError::Browser("attachToTarget returned no sessionId".to_string()))?
            .to_string();

        // Start capturing before anything is requested
        let (capture_tx, mut capture_rx) = watch::channel(None::<(String, String)>);
        let capture_task = tokio::spawn(capture_authorization(events, capture_tx));

        let page = Page {
            cdp: &cdp,
            session_id: &session_id,
        };
        page.call("Network.enable", json!({})).await?;
        page.call("Page.enable", json!({})).await?;

        tracing::info!("Navigating to provider guide");
        page.call("Page.navigate", json!({ "url": GUIDE_URL })).await?;
        sleep(Duration::from_secs(3)).await;

        let current = page.location().await?;
        if is_login_page(&current) {
            tracing::info!("Login page detected, submitting credentials");
            self.submit_credentials(&page, credentials, &capture_rx).await?;
        } else {
            tracing::info!("Existing browser session reused");
        }

        // Wait for the guide to call an authorized endpoint
        let (request_url, authorization) = wait_for_capture(&mut capture_rx, self.page_timeout)
            .await
            .ok_or_else(|| {
                LoginError::Timeout("no authorized provider request observed".to_string())
            })?;
        capture_task.abort();

        let cookies = read_cookies(&cdp).await.unwrap_or_else(|e| {
            tracing::warn!("Could not read browser cookies: {}", e);
            Vec::new()
        });

        let _ = cdp.call("Browser.close", json!({}), None).await;

        Ok(CapturedAuth {
            authorization,
            request_url,
            cookies,
        })
    }

    async fn submit_credentials(
        &self,
        page: &Page<'_>,
        credentials: &Credentials,
        capture_rx: &watch::Receiver<Option<(String, String)>>,
    ) -> Result<(), LoginError> {
        page.wait_for_selector(EMAIL_SELECTOR, Duration::from_secs(10))
            .await?;
        page.fill(EMAIL_SELECTOR, &credentials.username).await?;
        page.press_enter().await?;
        sleep(Duration::from_secs(2)).await;

        page.wait_for_selector(PASSWORD_SELECTOR, Duration::from_secs(10))
            .await?;
        page.fill(PASSWORD_SELECTOR, &credentials.password).await?;
        page.press_enter().await?;
        tracing::info!("Credentials submitted");

        // Redirect back to the guide, bounded at 45s
        let deadline = Instant::now() + Duration::from_secs(45);
        loop {
            let captured = capture_rx.borrow().is_some();
            if captured {
                return Ok(());
            }
            let url = page.location().await?;
            if url.contains("stream.directv.com") && !is_login_page(&url) {
                tracing::info!("Login redirect complete");
                return Ok(());
            }
            if Instant::now() >= deadline {
                let message = page.login_error_text().await.unwrap_or_default();
                return Err(if is_login_page(&url) {
                    LoginError::CredentialsRejected(if message.is_empty() {
                        "still on sign-in page after submit".to_string()
                    } else {
                        message
                    })
                } else {
                    LoginError::Timeout(format!("no redirect to guide (at {})", url))
                });
            }
            sleep(Duration::from_millis(500)).await;
        }
    }
}

#[async_trait]
impl LoginDriver for ChromeLoginDriver {
    async fn login(&self, credentials: &Credentials) -> Result<CapturedAuth, LoginError> {
        let browser = BrowserProcess::launch(&self.launch).await?;
        let overall = self.page_timeout + Duration::from_secs(90);

        let result = match tokio::time::timeout(overall, self.run(&browser, credentials)).await {
            Ok(r) => r,
            Err(_) => Err(LoginError::Timeout(format!(
                "login did not finish within {}s",
                overall.as_secs()
            ))),
        };

        browser.kill().await;
        result
    }
}

/// Commands scoped to the attached page session
struct Page<'a> {
    cdp: &'a CdpConnection,
    session_id: &'a str,
}

impl Page<'_> {
    async fn call(&self, method: &str, params: Value) -> Result<Value, LoginError> {
        self.cdp.call(method, params, Some(self.session_id)).await
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, LoginError> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true, "awaitPromise": true }),
            )
            .await?;
        if let Some(exc) = result.get("exceptionDetails") {
            return Err(LoginError::Browser(format!("script error: {}", exc)));
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn location(&self) -> Result<String, LoginError> {
        Ok(self
            .evaluate("window.location.href")
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<(), LoginError> {
        let expression = format!(
            "(() => {{ const el = document.querySelector({}); \
             return !!el && el.offsetParent !== null; }})()",
            js_string(selector)
        );
        let deadline = Instant::now() + timeout;
        loop {
            if self.evaluate(&expression).await?.as_bool() == Some(true) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(LoginError::SelectorNotFound(selector.to_string()));
            }
            sleep(Duration::from_millis(250)).await;
        }
    }

    /// Set an input's value the way a user edit would, so framework
    /// listeners see the change
    async fn fill(&self, selector: &str, value: &str) -> Result<(), LoginError> {
        let expression = format!(
            "(() => {{ const el = document.querySelector({sel}); if (!el) return false; \
             el.focus(); \
             const setter = Object.getOwnPropertyDescriptor(HTMLInputElement.prototype, 'value').set; \
             setter.call(el, {val}); \
             el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
             return true; }})()",
            sel = js_string(selector),
            val = js_string(value),
        );
        match self.evaluate(&expression).await?.as_bool() {
            Some(true) => Ok(()),
            _ => Err(LoginError::SelectorNotFound(selector.to_string())),
        }
    }

    async fn press_enter(&self) -> Result<(), LoginError> {
        for kind in ["keyDown", "keyUp"] {
            let mut params = json!({
                "type": kind,
                "key": "Enter",
                "code": "Enter",
                "windowsVirtualKeyCode": 13,
                "nativeVirtualKeyCode": 13,
            });
            if kind == "keyDown" {
                params["text"] = Value::String("\r".to_string());
            }
            self.call("Input.dispatchKeyEvent", params).await?;
        }
        Ok(())
    }

    async fn login_error_text(&self) -> Result<String, LoginError> {
        let value = self
            .evaluate(
                "(() => { const el = document.querySelector('[role=\"alert\"], .error, .errorMessage'); \
                 return el ? el.innerText.trim() : ''; })()",
            )
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

pub fn is_login_page(url: &str) -> bool {
    url.contains("identity.directv.com") && url.contains("weblogin")
}

fn is_auth_request(url: &str) -> bool {
    AUTH_MARKERS.iter().any(|m| url.contains(m))
}

/// Watch network events for the first authorized provider request.
///
/// Headers added by the page script show up on `requestWillBeSent`; headers
/// added by the network stack only on the matching `ExtraInfo` event, which
/// may arrive in either order.
async fn capture_authorization(
    mut events: mpsc::UnboundedReceiver<CdpEvent>,
    tx: watch::Sender<Option<(String, String)>>,
) {
    let mut urls: HashMap<String, String> = HashMap::new();
    let mut extra: HashMap<String, String> = HashMap::new();

    while let Some(event) = events.recv().await {
        let request_id = event
            .params
            .get("requestId")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string();

        match event.method.as_str() {
            "Network.requestWillBeSent" => {
                let request = match event.params.get("request") {
                    Some(r) => r,
                    None => continue,
                };
                let url = request.get("url").and_then(|u| u.as_str()).unwrap_or_default();
                if !is_auth_request(url) {
                    continue;
                }
                let auth = request
                    .get("headers")
                    .and_then(|h| header_value(h, "authorization"))
                    .map(String::from)
                    .or_else(|| extra.remove(&request_id));
                match auth {
                    Some(auth) if !auth.trim().is_empty() => {
                        tracing::info!("Captured authorization from {}", truncate(url, 80));
                        let _ = tx.send(Some((url.to_string(), auth)));
                        return;
                    }
                    _ => {
                        urls.insert(request_id, url.to_string());
                    }
                }
            }
            "Network.requestWillBeSentExtraInfo" => {
                let auth = event
                    .params
                    .get("headers")
                    .and_then(|h| header_value(h, "authorization"))
                    .map(String::from);
                if let Some(auth) = auth.filter(|a| !a.trim().is_empty()) {
                    if let Some(url) = urls.remove(&request_id) {
                        tracing::info!("Captured authorization from {}", truncate(&url, 80));
                        let _ = tx.send(Some((url, auth)));
                        return;
                    }
                    extra.insert(request_id, auth);
                }
            }
            _ => {}
        }
    }
}

async fn wait_for_capture(
    rx: &mut watch::Receiver<Option<(String, String)>>,
    timeout: Duration,
) -> Option<(String, String)> {
    let waited = tokio::time::timeout(timeout, async {
        loop {
            let current = rx.borrow().clone();
            if current.is_some() {
                return current;
            }
            if rx.changed().await.is_err() {
                let last = rx.borrow().clone();
                return last;
            }
        }
    })
    .await;
    waited.ok().flatten()
}

async fn read_cookies(cdp: &CdpConnection) -> Result<Vec<Cookie>, LoginError> {
    let result = cdp.call("Storage.getCookies", json!({}), None).await?;
    Ok(parse_cookies(&result))
}

fn parse_cookies(result: &Value) -> Vec<Cookie> {
    result
        .get("cookies")
        .and_then(|c| c.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|c| {
                    Some(Cookie {
                        name: c.get("name")?.as_str()?.to_string(),
                        value: c.get("value")?.as_str()?.to_string(),
                        domain: c.get("domain")?.as_str()?.to_string(),
                        path: c
                            .get("path")
                            .and_then(|p| p.as_str())
                            .unwrap_or("/")
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(method: &str, params: Value) -> CdpEvent {
        CdpEvent {
            method: method.to_string(),
            params,
            session_id: Some("S".to_string()),
        }
    }

    #[test]
    fn test_login_page_detection() {
        assert!(is_login_page(
            "https://identity.directv.com/weblogin/login?client=x"
        ));
        assert!(!is_login_page("https://stream.directv.com/guide"));
    }

    #[tokio::test]
    async fn test_capture_from_request_headers() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = watch::channel(None);

        events_tx
            .send(event(
                "Network.requestWillBeSent",
                json!({"requestId": "1", "request": {"url": "https://stream.directv.com/app.js", "headers": {"Authorization": "Bearer nope"}}}),
            ))
            .unwrap();
        events_tx
            .send(event(
                "Network.requestWillBeSent",
                json!({"requestId": "2", "request": {"url": "https://api.cld.dtvce.com/discovery/metadata/channel/v5/service/allchannels?clientContext=abc", "headers": {"authorization": "Bearer good"}}}),
            ))
            .unwrap();

        tokio::spawn(capture_authorization(events_rx, tx));
        let (url, auth) = wait_for_capture(&mut rx, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(url.contains("allchannels"));
        assert_eq!(auth, "Bearer good");
    }

    #[tokio::test]
    async fn test_capture_from_extra_info_before_request() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = watch::channel(None);

        events_tx
            .send(event(
                "Network.requestWillBeSentExtraInfo",
                json!({"requestId": "7", "headers": {"authorization": "Bearer late"}}),
            ))
            .unwrap();
        events_tx
            .send(event(
                "Network.requestWillBeSent",
                json!({"requestId": "7", "request": {"url": "https://api.cld.dtvce.com/right/authorization/channel/v1?ccid=1", "headers": {}}}),
            ))
            .unwrap();

        tokio::spawn(capture_authorization(events_rx, tx));
        let (_, auth) = wait_for_capture(&mut rx, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(auth, "Bearer late");
    }

    #[test]
    fn test_parse_cookies_skips_incomplete() {
        let cookies = parse_cookies(&json!({"cookies": [
            {"name": "a", "value": "1", "domain": ".directv.com", "path": "/"},
            {"name": "b", "value": "2"}
        ]}));
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].domain, ".directv.com");
    }
}
