//! Background bridge between the controlling server and one browser's
//! remote-debugging endpoint.
//!
//! Each daemon owns a supervision task that adopts the first reachable
//! candidate port, counts console/log entries, optionally forwards them to the
//! server, and serves screenshot captures while connected.
//!
//! ```text
//! Starting --(port adopted)--> Connected --(socket lost)--> Disconnected
//!    |                             ^                            |
//!    |                             +----(auto reconnect)--------+
//!    +--(no reachable port)--> Stopped <--(stop)-- any state
//! ```

use browserlink_core::{AgentRegistration, DaemonConfig, Error, Message, Paths, Result};
use browserlink_session::{TransportChannel, TransportSender};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::CaptureStore;
use crate::endpoint::{DebugConnector, DebugSession, LogEntry};

/// Lifecycle of a daemon. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Starting,
    Connected,
    Disconnected,
    Stopped,
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonState::Starting => write!(f, "starting"),
            DaemonState::Connected => write!(f, "connected"),
            DaemonState::Disconnected => write!(f, "disconnected"),
            DaemonState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DaemonId(String);

impl DaemonId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, used in file names and log lines.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl Default for DaemonId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DaemonId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DaemonId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Point-in-time view of a daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonRecord {
    pub id: DaemonId,
    pub target_address: String,
    pub candidate_ports: Vec<u16>,
    pub state: DaemonState,
    pub active_port: Option<u16>,
    pub log_count: u64,
    pub last_capture: Option<PathBuf>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub debug_host: String,
    /// Used when a daemon is started without candidate ports.
    pub default_ports: Vec<u16>,
    pub capture_dir: PathBuf,
    pub capture_timeout: Duration,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub forward_logs: bool,
    /// Bound on connecting the log uplink to the server.
    pub uplink_timeout: Duration,
}

impl DaemonOptions {
    pub fn from_config(config: &DaemonConfig, paths: &Paths) -> Self {
        Self {
            debug_host: config.debug_host.clone(),
            default_ports: config.candidate_ports.clone(),
            capture_dir: config.capture_dir(paths),
            capture_timeout: config.capture_timeout(),
            auto_reconnect: config.auto_reconnect,
            reconnect_delay: Duration::from_secs(1),
            forward_logs: config.forward_logs,
            uplink_timeout: config.probe_timeout().max(Duration::from_secs(1)),
        }
    }
}

#[derive(Default)]
struct Link {
    session: Option<Arc<dyn DebugSession>>,
    active_port: Option<u16>,
    last_capture: Option<PathBuf>,
    last_error: Option<String>,
}

struct Inner {
    id: DaemonId,
    target_address: String,
    candidate_ports: Vec<u16>,
    options: DaemonOptions,
    connector: Arc<dyn DebugConnector>,
    state: watch::Sender<DaemonState>,
    link: Mutex<Link>,
    uplink: Mutex<Option<TransportChannel>>,
    log_count: AtomicU64,
    captures: CaptureStore,
    stop: CancellationToken,
    started_at: DateTime<Utc>,
}

enum PumpEnd {
    Stopped,
    Lost,
}

/// Handle to a running daemon. Clones share the same daemon.
#[derive(Clone)]
pub struct BrowserBridgeDaemon {
    inner: Arc<Inner>,
}

impl BrowserBridgeDaemon {
    /// Create a daemon in `Starting` and spawn its supervision task.
    pub fn spawn(
        target_address: &str,
        candidate_ports: Vec<u16>,
        options: DaemonOptions,
        connector: Arc<dyn DebugConnector>,
    ) -> Self {
        let id = DaemonId::new();
        let candidate_ports = if candidate_ports.is_empty() {
            options.default_ports.clone()
        } else {
            candidate_ports
        };
        let captures = CaptureStore::new(options.capture_dir.clone(), id.short());
        let (state, _) = watch::channel(DaemonState::Starting);

        let daemon = Self {
            inner: Arc::new(Inner {
                id,
                target_address: target_address.to_string(),
                candidate_ports,
                options,
                connector,
                state,
                link: Mutex::new(Link::default()),
                uplink: Mutex::new(None),
                log_count: AtomicU64::new(0),
                captures,
                stop: CancellationToken::new(),
                started_at: Utc::now(),
            }),
        };

        info!(
            daemon = %daemon.inner.id,
            target = %daemon.inner.target_address,
            ports = ?daemon.inner.candidate_ports,
            "Daemon starting"
        );
        tokio::spawn(daemon.clone().supervise());
        daemon
    }

    pub fn id(&self) -> &DaemonId {
        &self.inner.id
    }

    pub fn target_address(&self) -> &str {
        &self.inner.target_address
    }

    pub fn state(&self) -> DaemonState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<DaemonState> {
        self.inner.state.subscribe()
    }

    /// Resolves once the daemon has left `Starting`, with the state it reached.
    pub async fn wait_ready(&self) -> DaemonState {
        let mut rx = self.inner.state.subscribe();
        let reached = match rx.wait_for(|s| *s != DaemonState::Starting).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        reached
    }

    /// Console/log entries seen since the current connection was established.
    pub fn log_count(&self) -> u64 {
        self.inner.log_count.load(Ordering::SeqCst)
    }

    pub async fn active_port(&self) -> Option<u16> {
        self.inner.link.lock().await.active_port
    }

    pub async fn last_capture(&self) -> Option<PathBuf> {
        self.inner.link.lock().await.last_capture.clone()
    }

    pub async fn record(&self) -> DaemonRecord {
        let link = self.inner.link.lock().await;
        DaemonRecord {
            id: self.inner.id.clone(),
            target_address: self.inner.target_address.clone(),
            candidate_ports: self.inner.candidate_ports.clone(),
            state: self.state(),
            active_port: link.active_port,
            log_count: self.log_count(),
            last_capture: link.last_capture.clone(),
            last_error: link.last_error.clone(),
            started_at: self.inner.started_at,
        }
    }

    /// Capture the current page and store it under `label`.
    pub async fn capture_screenshot(&self, label: &str) -> Result<PathBuf> {
        let session = {
            let link = self.inner.link.lock().await;
            let state = self.state();
            match (&link.session, state) {
                (Some(session), DaemonState::Connected) => session.clone(),
                _ => return Err(Error::NotConnected(state.to_string())),
            }
        };

        let limit = self.inner.options.capture_timeout;
        let data = tokio::select! {
            biased;
            _ = self.inner.stop.cancelled() => return Err(Error::DaemonStopped),
            result = tokio::time::timeout(limit, session.capture_screenshot()) => match result {
                Ok(data) => data?,
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "screenshot not captured within {:?}",
                        limit
                    )))
                }
            },
        };

        self.store_capture(label, &data).await
    }

    /// Persist a captured image. Images that arrive after `stop` are dropped;
    /// a write already under way when `stop` lands still completes.
    async fn store_capture(&self, label: &str, data: &str) -> Result<PathBuf> {
        if self.inner.stop.is_cancelled() {
            return Err(Error::DaemonStopped);
        }
        let path = self.inner.captures.store(label, data).await?;
        self.inner.link.lock().await.last_capture = Some(path.clone());
        info!(daemon = %self.inner.id, path = %path.display(), "Screenshot captured");
        Ok(path)
    }

    /// Stop the daemon and release its connections. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stop.is_cancelled() {
            return;
        }
        self.inner.stop.cancel();
        self.set_state(DaemonState::Stopped);

        let session = {
            let mut link = self.inner.link.lock().await;
            link.active_port = None;
            link.session.take()
        };
        if let Some(session) = session {
            session.close().await;
        }
        if let Some(uplink) = self.inner.uplink.lock().await.take() {
            uplink.close();
        }
        info!(daemon = %self.inner.id, "Daemon stopped");
    }

    /// Returns false when the transition was refused (terminal or unchanged).
    fn set_state(&self, next: DaemonState) -> bool {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == DaemonState::Stopped || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(daemon = %self.inner.id, state = %next, "Daemon state changed");
        }
        changed
    }

    async fn supervise(self) {
        loop {
            let selected = tokio::select! {
                biased;
                _ = self.inner.stop.cancelled() => return,
                result = self.select_port() => result,
            };

            let (port, session) = match selected {
                Ok(adopted) => adopted,
                Err(e) => {
                    self.inner.link.lock().await.last_error = Some(e.to_string());
                    if self.state() == DaemonState::Starting {
                        warn!(daemon = %self.inner.id, error = %e, "Daemon could not connect");
                        self.set_state(DaemonState::Stopped);
                        return;
                    }
                    debug!(daemon = %self.inner.id, error = %e, "Reconnect attempt failed");
                    if !self.pause_before_reconnect().await {
                        return;
                    }
                    continue;
                }
            };

            if !self.install(port, session.clone()).await {
                session.close().await;
                return;
            }

            let uplink = self.uplink().await;
            match self.pump(&session, uplink.as_ref()).await {
                PumpEnd::Stopped => return,
                PumpEnd::Lost => {}
            }

            {
                let mut link = self.inner.link.lock().await;
                link.session = None;
                link.active_port = None;
                link.last_error = Some(format!("connection to debug port {} lost", port));
            }
            warn!(daemon = %self.inner.id, port, "Browser connection lost");
            self.set_state(DaemonState::Disconnected);

            if !self.inner.options.auto_reconnect || !self.pause_before_reconnect().await {
                return;
            }
        }
    }

    /// Try each candidate port in order; the first that answers wins.
    async fn select_port(&self) -> Result<(u16, Arc<dyn DebugSession>)> {
        let host = &self.inner.options.debug_host;
        for &port in &self.inner.candidate_ports {
            match self.inner.connector.connect(host, port).await {
                Ok(session) => return Ok((port, session)),
                Err(e) => {
                    debug!(daemon = %self.inner.id, port, error = %e, "Debug port unavailable")
                }
            }
        }
        Err(Error::NoReachablePort(self.inner.candidate_ports.clone()))
    }

    /// Publish a fresh connection. Refused once the daemon has been stopped.
    async fn install(&self, port: u16, session: Arc<dyn DebugSession>) -> bool {
        let mut link = self.inner.link.lock().await;
        if self.inner.stop.is_cancelled() {
            return false;
        }
        link.session = Some(session);
        link.active_port = Some(port);
        link.last_error = None;
        self.inner.log_count.store(0, Ordering::SeqCst);
        drop(link);

        self.set_state(DaemonState::Connected);
        info!(daemon = %self.inner.id, port, "Debug port adopted");
        true
    }

    async fn pump(&self, session: &Arc<dyn DebugSession>, uplink: Option<&TransportSender>) -> PumpEnd {
        let mut logs = session.take_log_events().await;
        loop {
            tokio::select! {
                biased;
                _ = self.inner.stop.cancelled() => return PumpEnd::Stopped,
                _ = session.closed() => {
                    return if self.inner.stop.is_cancelled() {
                        PumpEnd::Stopped
                    } else {
                        PumpEnd::Lost
                    };
                }
                entry = next_log(&mut logs) => match entry {
                    Some(entry) => self.on_log(entry, uplink).await,
                    None => logs = None,
                },
            }
        }
    }

    async fn on_log(&self, entry: LogEntry, uplink: Option<&TransportSender>) {
        self.inner.log_count.fetch_add(1, Ordering::SeqCst);
        let Some(uplink) = uplink else {
            return;
        };
        let msg = Message::log(
            Some("browser"),
            &entry.level,
            json!({
                "daemonId": self.inner.id.as_str(),
                "source": entry.source,
                "text": entry.text,
            }),
        );
        if let Err(e) = uplink.send(&msg).await {
            debug!(daemon = %self.inner.id, error = %e, "Log forwarding failed");
        }
    }

    /// Sender for the log uplink, connecting it on first use. Best effort.
    ///
    /// The lock is only held to read or publish the channel, never across the
    /// connect, so `stop` is not held up by a slow server.
    async fn uplink(&self) -> Option<TransportSender> {
        if !self.inner.options.forward_logs || self.inner.target_address.trim().is_empty() {
            return None;
        }
        {
            let uplink = self.inner.uplink.lock().await;
            if let Some(channel) = uplink.as_ref().filter(|c| c.is_connected()) {
                return Some(channel.sender());
            }
        }

        let limit = self.inner.options.uplink_timeout;
        let channel = tokio::select! {
            biased;
            _ = self.inner.stop.cancelled() => return None,
            connected = tokio::time::timeout(limit, self.connect_uplink()) => match connected {
                Ok(Ok(channel)) => channel,
                Ok(Err(e)) => {
                    warn!(daemon = %self.inner.id, error = %e, "Log uplink unavailable");
                    return None;
                }
                Err(_) => {
                    warn!(daemon = %self.inner.id, "Log uplink connect timed out");
                    return None;
                }
            },
        };

        let mut uplink = self.inner.uplink.lock().await;
        if self.inner.stop.is_cancelled() {
            channel.close();
            return None;
        }
        let sender = channel.sender();
        *uplink = Some(channel);
        Some(sender)
    }

    async fn connect_uplink(&self) -> Result<TransportChannel> {
        let mut channel = TransportChannel::connect(&self.inner.target_address).await?;
        let registration = AgentRegistration {
            agent_id: self.inner.id.to_string(),
            agent_name: format!("browserlink-daemon-{}", self.inner.id.short()),
            agent_type: "daemon".to_string(),
        };
        channel.sender().send_json(&registration).await?;

        // Nothing is expected back; keep the reader alive by draining it.
        if let Some(mut inbound) = channel.receive() {
            let id = self.inner.id.clone();
            tokio::spawn(async move {
                while let Some(frame) = inbound.recv().await {
                    debug!(
                        daemon = %id,
                        kind = ?frame.as_ref().ok().map(Message::kind),
                        "Ignoring uplink frame"
                    );
                }
            });
        }
        Ok(channel)
    }

    /// Wait out the reconnect delay. False if stopped meanwhile.
    async fn pause_before_reconnect(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.inner.stop.cancelled() => false,
            _ = tokio::time::sleep(self.inner.options.reconnect_delay) => true,
        }
    }
}

async fn next_log(logs: &mut Option<mpsc::Receiver<LogEntry>>) -> Option<LogEntry> {
    match logs {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
