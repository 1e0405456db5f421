//! Minimal Chrome DevTools Protocol client
//!
//! Launches a Chromium process with remote debugging enabled and speaks CDP
//! over its browser WebSocket. Commands are correlated to responses by id;
//! everything without an id is forwarded as an event.

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::LoginError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

const DEVTOOLS_BANNER: &str = "DevTools listening on ";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for starting the browser
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub executable: String,
    pub profile_dir: std::path::PathBuf,
    pub headless: bool,
    pub user_agent: String,
    pub startup_timeout: Duration,
}

/// Running browser process; killed when dropped
pub struct BrowserProcess {
    child: Child,
    ws_url: String,
}

impl BrowserProcess {
    pub async fn launch(opts: &LaunchOptions) -> Result<Self, LoginError> {
        tokio::fs::create_dir_all(&opts.profile_dir)
            .await
            .map_err(|e| LoginError::Browser(format!("profile dir: {}", e)))?;

        let mut cmd = Command::new(&opts.executable);
        cmd.args(launch_args(opts, &opts.profile_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            LoginError::Browser(format!("failed to start {}: {}", opts.executable, e))
        })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| LoginError::Browser("browser stderr unavailable".to_string()))?;
        let mut lines = BufReader::new(stderr).lines();

        let ws_url = tokio::time::timeout(opts.startup_timeout, async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(url) = parse_devtools_banner(&line) {
                    return Some(url);
                }
            }
            None
        })
        .await
        .map_err(|_| LoginError::Timeout("browser did not expose a DevTools endpoint".to_string()))?
        .ok_or_else(|| LoginError::Browser("browser exited before DevTools was ready".to_string()))?;

        // Keep draining stderr so the browser never blocks on a full pipe
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::trace!(target: "browser", "{}", line);
            }
        });

        tracing::debug!("Browser DevTools endpoint: {}", ws_url);
        Ok(Self { child, ws_url })
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub async fn kill(mut self) {
        let _ = self.child.kill().await;
    }
}

fn launch_args(opts: &LaunchOptions, profile_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "--remote-debugging-port=0".to_string(),
        format!("--user-data-dir={}", profile_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--no-sandbox".to_string(),
        format!("--user-agent={}", opts.user_agent),
        "--window-size=1366,900".to_string(),
    ];
    if opts.headless {
        args.push("--headless=new".to_string());
    }
    args.push("about:blank".to_string());
    args
}

/// Extract the WebSocket URL from Chromium's startup banner
pub fn parse_devtools_banner(line: &str) -> Option<String> {
    let idx = line.find(DEVTOOLS_BANNER)?;
    let url = line[idx + DEVTOOLS_BANNER.len()..].trim();
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Some(url.to_string())
    } else {
        None
    }
}

/// Event pushed by the browser
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Connection to the browser endpoint
pub struct CdpConnection {
    sink: Mutex<SplitSink<WsStream, Message>>,
    pending: Pending,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl CdpConnection {
    pub async fn connect(ws_url: &str) -> Result<(Self, mpsc::UnboundedReceiver<CdpEvent>), LoginError> {
        let (stream, _resp) = connect_async(ws_url)
            .await
            .map_err(|e| LoginError::Browser(format!("DevTools connect failed: {}", e)))?;
        let (sink, mut read) = stream.split();

        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(txt)) => txt,
                    Ok(Message::Binary(bin)) => match String::from_utf8(bin) {
                        Ok(s) => s,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::debug!("DevTools socket closed: {:?}", frame);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!("DevTools socket error: {}", e);
                        break;
                    }
                };

                let value: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(_) => continue,
                };

                if let Some(id) = value.get("id").and_then(|v| v.as_u64()) {
                    let waiter = reader_pending.lock().ok().and_then(|mut p| p.remove(&id));
                    if let Some(tx) = waiter {
                        let _ = tx.send(split_response(value));
                    }
                } else if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
                    let event = CdpEvent {
                        method: method.to_string(),
                        params: value.get("params").cloned().unwrap_or(Value::Null),
                        session_id: value
                            .get("sessionId")
                            .and_then(|s| s.as_str())
                            .map(String::from),
                    };
                    if events_tx.send(event).is_err() {
                        // Nobody listens for events any more; responses still matter
                        continue;
                    }
                }
            }

            // Fail everything still waiting
            if let Ok(mut p) = reader_pending.lock() {
                for (_, tx) in p.drain() {
                    let _ = tx.send(Err("DevTools connection closed".to_string()));
                }
            }
        });

        Ok((
            Self {
                sink: Mutex::new(sink),
                pending,
                next_id: AtomicU64::new(1),
                reader,
            },
            events_rx,
        ))
    }

    /// Send a command and wait for its result
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value, LoginError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut message = json!({ "id": id, "method": method, "params": params });
        if let Some(sid) = session_id {
            message["sessionId"] = Value::String(sid.to_string());
        }

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| LoginError::Browser("DevTools state poisoned".to_string()))?
            .insert(id, tx);

        {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Text(message.to_string()))
                .await
                .map_err(|e| LoginError::Browser(format!("{} send failed: {}", method, e)))?;
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(msg))) => Err(LoginError::Browser(format!("{}: {}", method, msg))),
            Ok(Err(_)) => Err(LoginError::Browser(format!("{}: connection dropped", method))),
            Err(_) => {
                if let Ok(mut p) = self.pending.lock() {
                    p.remove(&id);
                }
                Err(LoginError::Timeout(format!("{} got no response", method)))
            }
        }
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn split_response(value: Value) -> Result<Value, String> {
    if let Some(err) = value.get("error") {
        let msg = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        return Err(msg.to_string());
    }
    Ok(value.get("result").cloned().unwrap_or(Value::Null))
}

/// Case-insensitive header lookup in a CDP headers object
pub fn header_value<'a>(headers: &'a Value, name: &str) -> Option<&'a str> {
    headers
        .as_object()?
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| v.as_str())
}
