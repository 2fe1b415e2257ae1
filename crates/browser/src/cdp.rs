//! Low-level Chrome DevTools Protocol (CDP) client over WebSocket.
//!
//! Communicates with a Chrome/Chromium instance via its debugging WebSocket endpoint.
//! Supports sending commands, receiving responses, and handling events.

use browserlink_core::{Error, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, warn};

/// An event pushed by the browser, e.g. `Runtime.consoleAPICalled`.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type ListenerMap = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<CdpEvent>>>>>;

/// A CDP WebSocket client that can send commands and receive responses/events.
pub struct CdpClient {
    /// Sender to write messages to the WebSocket.
    ws_tx: mpsc::Sender<String>,
    /// Pending command responses, keyed by request ID.
    pending: PendingMap,
    /// Auto-incrementing command ID.
    next_id: AtomicU64,
    /// Event listeners (domain.event -> channels).
    event_listeners: ListenerMap,
    command_timeout: Duration,
    /// Flips to `true` once the socket is gone.
    closed: watch::Receiver<bool>,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a Chrome CDP WebSocket endpoint.
    pub async fn connect(ws_url: &str, command_timeout: Duration) -> Result<Self> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| Error::Connection(format!("CDP endpoint {}: {}", ws_url, e)))?;

        let (mut ws_sink, mut ws_stream_read) = ws_stream.split();

        // Channel for outgoing messages
        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();

        let event_listeners: ListenerMap = Arc::new(Mutex::new(HashMap::new()));
        let events_clone = event_listeners.clone();

        let (closed_tx, closed_rx) = watch::channel(false);

        // Writer task: owns the sink, forwards messages from channel
        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("CDP WebSocket write error: {}", e);
                    break;
                }
            }
        });

        // Reader task: reads from WebSocket, dispatches responses and events
        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = ws_stream_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            debug!("Ignoring non-JSON CDP frame");
                            continue;
                        };
                        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                            // This is a command response
                            let mut pending = pending_clone.lock().await;
                            if let Some(tx) = pending.remove(&id) {
                                let _ = tx.send(val);
                            }
                        } else if let Some(method) = val.get("method").and_then(|v| v.as_str()) {
                            let listeners = events_clone.lock().await;
                            if let Some(senders) = listeners.get(method) {
                                let event = CdpEvent {
                                    method: method.to_string(),
                                    params: val.get("params").cloned().unwrap_or(Value::Null),
                                };
                                for tx in senders {
                                    let _ = tx.try_send(event.clone());
                                }
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by browser");
                        break;
                    }
                    Err(e) => {
                        warn!("CDP WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            // Dropping the senders wakes every waiter with a closed channel.
            pending_clone.lock().await.clear();
            events_clone.lock().await.clear();
            let _ = closed_tx.send(true);
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            event_listeners,
            command_timeout,
            closed: closed_rx,
            reader_handle,
            writer_handle,
        })
    }

    /// Send a CDP command and wait for the response.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::ConnectionLost("CDP connection closed".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        if self.ws_tx.send(msg.to_string()).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Error::TransportClosed);
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.get("error") {
                    Err(Error::Cdp(format!("{} failed: {}", method, error)))
                } else {
                    Ok(response.get("result").cloned().unwrap_or(Value::Null))
                }
            }
            Ok(Err(_)) => Err(Error::ConnectionLost(format!(
                "CDP connection closed while waiting for '{}'",
                method
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::Timeout(format!(
                    "CDP command '{}' timed out after {:?}",
                    method, self.command_timeout
                )))
            }
        }
    }

    /// Subscribe to several CDP events on one receiver.
    pub async fn subscribe_events(&self, methods: &[&str]) -> mpsc::Receiver<CdpEvent> {
        let (tx, rx) = mpsc::channel(256);
        let mut listeners = self.event_listeners.lock().await;
        for method in methods {
            listeners
                .entry(method.to_string())
                .or_insert_with(Vec::new)
                .push(tx.clone());
        }
        rx
    }

    /// Enable a CDP domain (e.g., "Page", "Runtime", "Log").
    pub async fn enable_domain(&self, domain: &str) -> Result<()> {
        self.send_command(&format!("{}.enable", domain), json!({}))
            .await?;
        Ok(())
    }

    /// Take a screenshot and return base64-encoded PNG data.
    pub async fn screenshot(&self) -> Result<String> {
        let result = self
            .send_command("Page.captureScreenshot", json!({"format": "png"}))
            .await?;
        result
            .get("data")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Cdp("No screenshot data returned".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.reader_handle.is_finished()
    }

    /// Resolves once the WebSocket has gone away.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn close(&self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.close();
    }
}
