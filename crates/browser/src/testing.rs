//! In-memory debug endpoints for daemon and manager tests.

use async_trait::async_trait;
use browserlink_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

use crate::endpoint::{DebugConnector, DebugSession, LogEntry};

/// 1x1 transparent PNG.
pub(crate) const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

pub(crate) struct FakeSession {
    closed: watch::Sender<bool>,
    log_tx: mpsc::Sender<LogEntry>,
    log_rx: Mutex<Option<mpsc::Receiver<LogEntry>>>,
    hang_captures: bool,
}

impl FakeSession {
    fn new(hang_captures: bool) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        let (log_tx, log_rx) = mpsc::channel(64);
        Arc::new(Self {
            closed,
            log_tx,
            log_rx: Mutex::new(Some(log_rx)),
            hang_captures,
        })
    }

    pub(crate) async fn emit_log(&self, text: &str) {
        let entry = LogEntry {
            source: "console".to_string(),
            level: "log".to_string(),
            text: text.to_string(),
        };
        self.log_tx.send(entry).await.unwrap();
    }

    /// Simulate the browser going away.
    pub(crate) fn drop_connection(&self) {
        self.closed.send_replace(true);
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl DebugSession for FakeSession {
    async fn capture_screenshot(&self) -> Result<String> {
        if self.hang_captures {
            std::future::pending::<()>().await;
        }
        Ok(PNG_B64.to_string())
    }

    async fn take_log_events(&self) -> Option<mpsc::Receiver<LogEntry>> {
        self.log_rx.lock().await.take()
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }
}

/// Accepts connections only on the configured ports and records every attempt.
pub(crate) struct FakeConnector {
    accepting: Vec<u16>,
    hang_captures: bool,
    attempts: std::sync::Mutex<Vec<u16>>,
    sessions: std::sync::Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeConnector {
    pub(crate) fn accepting(ports: &[u16]) -> Arc<Self> {
        Arc::new(Self {
            accepting: ports.to_vec(),
            hang_captures: false,
            attempts: std::sync::Mutex::new(Vec::new()),
            sessions: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Like `accepting`, but screenshots never complete.
    pub(crate) fn hanging(ports: &[u16]) -> Arc<Self> {
        Arc::new(Self {
            accepting: ports.to_vec(),
            hang_captures: true,
            attempts: std::sync::Mutex::new(Vec::new()),
            sessions: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn attempts(&self) -> Vec<u16> {
        self.attempts.lock().unwrap().clone()
    }

    pub(crate) fn session(&self, n: usize) -> Arc<FakeSession> {
        self.sessions.lock().unwrap()[n].clone()
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl DebugConnector for FakeConnector {
    async fn connect(&self, _host: &str, port: u16) -> Result<Arc<dyn DebugSession>> {
        self.attempts.lock().unwrap().push(port);
        if !self.accepting.contains(&port) {
            return Err(Error::Connection(format!("port {} refused", port)));
        }
        let session = FakeSession::new(self.hang_captures);
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

/// Poll `cond` until it holds, panicking after two seconds.
pub(crate) async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
