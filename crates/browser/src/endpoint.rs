//! Browser remote-debugging endpoints.
//!
//! A [`DebugConnector`] opens a [`DebugSession`] against one port; the
//! production implementation talks CDP to Chrome/Chromium/Edge.

use async_trait::async_trait;
use browserlink_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cdp::{CdpClient, CdpEvent};

/// A console or log entry observed in the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub source: String,
    pub level: String,
    pub text: String,
}

impl LogEntry {
    /// Parse `Runtime.consoleAPICalled` and `Log.entryAdded` events.
    pub fn from_cdp(event: &CdpEvent) -> Option<Self> {
        match event.method.as_str() {
            "Runtime.consoleAPICalled" => {
                let level = event.params.get("type").and_then(|v| v.as_str()).unwrap_or("log");
                let text = event
                    .params
                    .get("args")
                    .and_then(|v| v.as_array())
                    .map(|args| {
                        args.iter()
                            .map(render_remote_object)
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .unwrap_or_default();
                Some(Self {
                    source: "console".to_string(),
                    level: level.to_string(),
                    text,
                })
            }
            "Log.entryAdded" => {
                let entry = event.params.get("entry")?;
                let field = |name: &str| {
                    entry
                        .get(name)
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string()
                };
                Some(Self {
                    source: field("source"),
                    level: field("level"),
                    text: field("text"),
                })
            }
            _ => None,
        }
    }
}

fn render_remote_object(arg: &Value) -> String {
    match arg.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => arg
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("undefined")
            .to_string(),
    }
}

/// A live connection to one browser's debugging surface.
#[async_trait]
pub trait DebugSession: Send + Sync {
    /// Base64-encoded PNG of the current page.
    async fn capture_screenshot(&self) -> Result<String>;

    /// Console/log entries. Can be taken once per session.
    async fn take_log_events(&self) -> Option<mpsc::Receiver<LogEntry>>;

    /// Resolves when the connection drops.
    async fn closed(&self);

    async fn close(&self);
}

#[async_trait]
pub trait DebugConnector: Send + Sync {
    /// Open a session on `host:port`, failing fast if nothing answers there.
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn DebugSession>>;
}

/// Connects through the `/json/version` + `/json/list` discovery endpoints.
pub struct CdpConnector {
    http: reqwest::Client,
    probe_timeout: Duration,
    command_timeout: Duration,
}

impl CdpConnector {
    pub fn new(probe_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            probe_timeout,
            command_timeout,
        }
    }

    /// Check that a debugging endpoint answers on `port`.
    async fn probe_version(&self, host: &str, port: u16) -> Result<Value> {
        let url = format!("http://{}:{}/json/version", host, port);
        let resp = self
            .http
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", url, e)))?;
        resp.json::<Value>()
            .await
            .map_err(|e| Error::Connection(format!("{}: invalid response: {}", url, e)))
    }

    /// Find the first page target's WebSocket URL.
    /// Retries a few times since the page target may not appear immediately.
    async fn page_ws_url(&self, host: &str, port: u16) -> Result<String> {
        let url = format!("http://{}:{}/json/list", host, port);

        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }

            let resp = match self.http.get(&url).timeout(self.probe_timeout).send().await {
                Ok(r) => r,
                Err(_) => continue,
            };
            let targets: Vec<Value> = match resp.json().await {
                Ok(t) => t,
                Err(_) => continue,
            };

            if let Some(ws_url) = first_page_ws_url(&targets) {
                return Ok(ws_url);
            }
        }

        Err(Error::Connection(format!("No page target on port {}", port)))
    }
}

fn first_page_ws_url(targets: &[Value]) -> Option<String> {
    targets
        .iter()
        .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("page"))
        .find_map(|t| t.get("webSocketDebuggerUrl").and_then(|v| v.as_str()))
        .map(str::to_string)
}

#[async_trait]
impl DebugConnector for CdpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn DebugSession>> {
        let version = self.probe_version(host, port).await?;
        debug!(
            port,
            browser = version.get("Browser").and_then(|v| v.as_str()).unwrap_or("unknown"),
            "Debug endpoint answered"
        );

        let page_ws_url = self.page_ws_url(host, port).await?;
        let client = CdpClient::connect(&page_ws_url, self.command_timeout).await?;

        let events = client
            .subscribe_events(&["Runtime.consoleAPICalled", "Log.entryAdded"])
            .await;
        client.enable_domain("Page").await?;
        client.enable_domain("Runtime").await?;
        client.enable_domain("Log").await.ok(); // optional, not every browser has it

        info!(port, ws_url = %page_ws_url, "CDP connection established (page target)");
        Ok(Arc::new(CdpSession::new(client, events)))
    }
}

pub struct CdpSession {
    client: CdpClient,
    logs: Mutex<Option<mpsc::Receiver<LogEntry>>>,
    translator: JoinHandle<()>,
}

impl CdpSession {
    fn new(client: CdpClient, mut events: mpsc::Receiver<CdpEvent>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let translator = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Some(entry) = LogEntry::from_cdp(&event) {
                    if tx.send(entry).await.is_err() {
                        break;
                    }
                }
            }
        });
        Self {
            client,
            logs: Mutex::new(Some(rx)),
            translator,
        }
    }
}

#[async_trait]
impl DebugSession for CdpSession {
    async fn capture_screenshot(&self) -> Result<String> {
        self.client.screenshot().await
    }

    async fn take_log_events(&self) -> Option<mpsc::Receiver<LogEntry>> {
        self.logs.lock().await.take()
    }

    async fn closed(&self) {
        self.client.closed().await
    }

    async fn close(&self) {
        self.client.close();
        self.translator.abort();
    }
}
