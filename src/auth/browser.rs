//! Interactive login driver.
//!
//! Launches a visible Chrome/Chromium window on the Teams web app with a
//! persistent profile, waits until the signed-in UI is rendered, then dumps
//! the page's `localStorage` through the DevTools protocol.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::BrokerError;

/// Elements that only exist once the user is signed in
const SIGNED_IN_MARKERS: &str = ".app-bar-text, .fui-Button__icon";
const LOCAL_STORAGE_DUMP: &str = "JSON.stringify(Object.assign({}, window.localStorage))";
const DEVTOOLS_BANNER: &str = "DevTools listening on ";

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Source of the signed-in page's client-side storage
#[async_trait]
pub trait LoginDriver: Send + Sync {
    /// Run an interactive login and return the page's `localStorage` entries.
    /// Waits as long as the user needs; the caller bounds it.
    async fn capture_local_storage(&self) -> Result<HashMap<String, String>, BrokerError>;
}

/// `LoginDriver` backed by a real Chrome/Chromium process
pub struct ChromeLoginDriver {
    executable: String,
    profile_dir: PathBuf,
    start_url: String,
    poll_interval: Duration,
    http: reqwest::Client,
}

impl ChromeLoginDriver {
    pub fn new(executable: String, profile_dir: PathBuf, start_url: String) -> Self {
        Self {
            executable,
            profile_dir,
            start_url,
            poll_interval: Duration::from_millis(500),
            http: reqwest::Client::new(),
        }
    }

    fn spawn_browser(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.executable);
        cmd.arg("--remote-debugging-port=0")
            .arg(format!("--user-data-dir={}", self.profile_dir.display()))
            .arg("--window-size=600,600")
            .arg("--hide-scrollbars")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg(format!("--app={}", self.start_url))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn()
            .with_context(|| format!("Failed to launch browser: {}", self.executable))
    }

    /// Address of the first page target, retried while the window is opening
    async fn page_socket_url(&self, devtools_host: &str) -> Result<String, BrokerError> {
        let list_url = format!("http://{}/json/list", devtools_host);

        for _ in 0..40 {
            let targets: Vec<TargetInfo> = match self.http.get(&list_url).send().await {
                Ok(resp) => resp.json().await.unwrap_or_default(),
                Err(e) => {
                    tracing::debug!(error = %e, "DevTools target list not ready");
                    Vec::new()
                }
            };

            if let Some(url) = targets
                .into_iter()
                .find(|t| t.kind == "page")
                .and_then(|t| t.web_socket_debugger_url)
            {
                return Ok(url);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        Err(BrokerError::LoginAborted(
            "browser opened no page to log in with".to_string(),
        ))
    }

    async fn close_browser(&self, browser_ws: &str, mut child: Child) {
        match connect_async(browser_ws).await {
            Ok((stream, _)) => {
                let mut session = DevToolsSession::new(stream);
                if let Err(e) = session.call("Browser.close", json!({})).await {
                    tracing::debug!(error = %e, "Browser.close failed");
                }
            }
            Err(e) => tracing::debug!(error = %e, "Could not reach browser endpoint to close it"),
        }

        // Give the browser time to flush the profile before killing it
        if tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .is_err()
        {
            tracing::warn!("Browser did not exit after Browser.close, killing it");
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
impl LoginDriver for ChromeLoginDriver {
    async fn capture_local_storage(&self) -> Result<HashMap<String, String>, BrokerError> {
        tracing::info!("Opening login window at {}", self.start_url);
        let mut child = self.spawn_browser()?;

        let stderr = child
            .stderr
            .take()
            .context("Failed to capture browser stderr")?;
        let mut lines = BufReader::new(stderr).lines();

        let browser_ws = loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(url) = devtools_url_from_banner(&line) {
                        break url;
                    }
                }
                Ok(None) | Err(_) => {
                    return Err(BrokerError::LoginAborted(
                        "browser exited before DevTools became available".to_string(),
                    ))
                }
            }
        };

        // Keep draining stderr so the browser never blocks on a full pipe
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::trace!(target: "browser", "{}", line);
            }
        });

        let host = devtools_host(&browser_ws).ok_or_else(|| {
            BrokerError::LoginAborted(format!("unexpected DevTools address: {}", browser_ws))
        })?;
        let page_ws = self.page_socket_url(host).await?;

        let (stream, _) = connect_async(&page_ws)
            .await
            .context("Failed to connect to the login page")?;
        let mut page = DevToolsSession::new(stream);

        tracing::info!("Waiting for the user to finish logging in...");
        let marker_query = format!(
            "document.querySelectorAll('{}').length",
            SIGNED_IN_MARKERS
        );
        loop {
            let count = page.evaluate(&marker_query).await?;
            if count.as_ref().and_then(Value::as_u64).unwrap_or(0) > 0 {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        tracing::info!("Login detected, reading local storage");
        let dump = page
            .evaluate(LOCAL_STORAGE_DUMP)
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| {
                BrokerError::LoginAborted("local storage was not readable".to_string())
            })?;
        drop(page);

        self.close_browser(&browser_ws, child).await;

        let storage: HashMap<String, String> =
            serde_json::from_str(&dump).context("Failed to parse local storage dump")?;
        Ok(storage)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetInfo {
    #[serde(rename = "type")]
    kind: String,
    web_socket_debugger_url: Option<String>,
}

/// Minimal DevTools protocol client over one websocket
struct DevToolsSession {
    stream: WsStream,
    next_id: u64,
}

impl DevToolsSession {
    fn new(stream: WsStream) -> Self {
        Self { stream, next_id: 1 }
    }

    /// Send a command and wait for the reply with the same id, skipping events
    async fn call(&mut self, method: &str, params: Value) -> Result<Value, BrokerError> {
        let id = self.next_id;
        self.next_id += 1;

        let command = json!({ "id": id, "method": method, "params": params });
        self.stream
            .send(Message::Text(command.to_string()))
            .await
            .map_err(|e| BrokerError::LoginAborted(format!("browser window closed: {}", e)))?;

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let reply: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    if reply.get("id").and_then(Value::as_u64) == Some(id) {
                        return Ok(reply);
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(BrokerError::LoginAborted(
                        "browser window closed".to_string(),
                    ))
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(BrokerError::LoginAborted(format!(
                        "browser connection lost: {}",
                        e
                    )))
                }
            }
        }
    }

    /// Evaluate an expression in the page. `None` when it threw or the page
    /// was mid-navigation.
    async fn evaluate(&mut self, expression: &str) -> Result<Option<Value>, BrokerError> {
        let reply = self
            .call(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true }),
            )
            .await?;

        if reply.get("error").is_some() || reply.pointer("/result/exceptionDetails").is_some() {
            return Ok(None);
        }
        Ok(reply.pointer("/result/result/value").cloned())
    }
}

/// `ws://127.0.0.1:PORT/devtools/browser/ID` from Chrome's startup banner
fn devtools_url_from_banner(line: &str) -> Option<String> {
    line.find(DEVTOOLS_BANNER)
        .map(|pos| line[pos + DEVTOOLS_BANNER.len()..].trim().to_string())
        .filter(|url| url.starts_with("ws://"))
}

fn devtools_host(ws_url: &str) -> Option<&str> {
    ws_url
        .strip_prefix("ws://")
        .and_then(|rest| rest.split('/').next())
        .filter(|host| !host.is_empty())
}
