use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use browserlink_core::{Config, Paths};

use crate::daemon::{BrowserBridgeDaemon, DaemonId, DaemonOptions, DaemonRecord};
use crate::endpoint::{CdpConnector, DebugConnector};

/// Thread-safe registry of running browser bridge daemons.
#[derive(Clone)]
pub struct DaemonManager {
    daemons: Arc<Mutex<HashMap<DaemonId, BrowserBridgeDaemon>>>,
    connector: Arc<dyn DebugConnector>,
    options: DaemonOptions,
}

impl DaemonManager {
    pub fn new(connector: Arc<dyn DebugConnector>, options: DaemonOptions) -> Self {
        Self {
            daemons: Arc::new(Mutex::new(HashMap::new())),
            connector,
            options,
        }
    }

    /// A manager that talks CDP to real browsers.
    pub fn from_config(config: &Config, paths: &Paths) -> Self {
        let options = DaemonOptions::from_config(&config.daemon, paths);
        let connector = CdpConnector::new(config.daemon.probe_timeout(), options.capture_timeout);
        Self::new(Arc::new(connector), options)
    }

    /// Start a daemon and return its id without waiting for it to connect.
    pub async fn start(&self, target_address: &str, candidate_ports: Vec<u16>) -> DaemonId {
        let daemon = BrowserBridgeDaemon::spawn(
            target_address,
            candidate_ports,
            self.options.clone(),
            self.connector.clone(),
        );
        let id = daemon.id().clone();
        self.daemons.lock().await.insert(id.clone(), daemon);
        id
    }

    pub async fn get(&self, id: &DaemonId) -> Option<BrowserBridgeDaemon> {
        self.daemons.lock().await.get(id).cloned()
    }

    /// Stop and forget a daemon. Unknown ids are ignored.
    pub async fn stop(&self, id: &DaemonId) {
        let removed = self.daemons.lock().await.remove(id);
        match removed {
            Some(daemon) => daemon.stop().await,
            None => debug!(daemon = %id, "Stop requested for unknown daemon"),
        }
    }

    /// Records of all daemons, oldest first.
    pub async fn list(&self) -> Vec<DaemonRecord> {
        let daemons: Vec<BrowserBridgeDaemon> =
            self.daemons.lock().await.values().cloned().collect();
        let mut records = Vec::with_capacity(daemons.len());
        for daemon in daemons {
            records.push(daemon.record().await);
        }
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        records
    }

    pub async fn stop_all(&self) {
        let daemons: Vec<BrowserBridgeDaemon> =
            self.daemons.lock().await.drain().map(|(_, d)| d).collect();
        let count = daemons.len();
        for daemon in daemons {
            daemon.stop().await;
        }
        if count > 0 {
            info!(count, "Stopped all daemons");
        }
    }

    pub async fn len(&self) -> usize {
        self.daemons.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.daemons.lock().await.is_empty()
    }
}
