use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths::Paths;

/// Connection to the controlling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Announced in the registration handshake. Generated when empty.
    #[serde(default)]
    pub agent_id: String,
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Interval of the pending-request expiry sweep.
    #[serde(default = "default_expiry_tick_ms")]
    pub expiry_tick_ms: u64,
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8765".to_string()
}

fn default_agent_name() -> String {
    "browserlink".to_string()
}

fn default_agent_type() -> String {
    "browser".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_expiry_tick_ms() -> u64 {
    250
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            agent_id: String::new(),
            agent_name: default_agent_name(),
            agent_type: default_agent_type(),
            request_timeout_secs: default_request_timeout_secs(),
            expiry_tick_ms: default_expiry_tick_ms(),
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn expiry_tick(&self) -> Duration {
        Duration::from_millis(self.expiry_tick_ms.max(1))
    }
}

/// Browser bridge daemons.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Host serving the browser's remote-debugging endpoint.
    #[serde(default = "default_debug_host")]
    pub debug_host: String,
    /// Probed strictly in this order.
    #[serde(default = "default_candidate_ports")]
    pub candidate_ports: Vec<u16>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_capture_timeout_secs")]
    pub capture_timeout_secs: u64,
    /// Where screenshots are written. Defaults to `~/.browserlink/captures`.
    #[serde(default)]
    pub capture_dir: Option<String>,
    /// Re-probe the candidate ports after an unexpected disconnect.
    #[serde(default)]
    pub auto_reconnect: bool,
    /// Forward browser console entries to the controlling server as `log` messages.
    #[serde(default = "default_forward_logs")]
    pub forward_logs: bool,
}

fn default_debug_host() -> String {
    "127.0.0.1".to_string()
}

fn default_candidate_ports() -> Vec<u16> {
    vec![9222, 9223, 9229]
}

fn default_probe_timeout_ms() -> u64 {
    1500
}

fn default_capture_timeout_secs() -> u64 {
    20
}

fn default_forward_logs() -> bool {
    true
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            debug_host: default_debug_host(),
            candidate_ports: default_candidate_ports(),
            probe_timeout_ms: default_probe_timeout_ms(),
            capture_timeout_secs: default_capture_timeout_secs(),
            capture_dir: None,
            auto_reconnect: false,
            forward_logs: default_forward_logs(),
        }
    }
}

impl DaemonConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn capture_dir(&self, paths: &Paths) -> PathBuf {
        match self.capture_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => Paths::expand(dir),
            _ => paths.captures_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.server_url.trim().is_empty() {
            return Err(Error::Config("session.serverUrl must not be empty".to_string()));
        }
        if self.daemon.candidate_ports.contains(&0) {
            return Err(Error::Config("daemon.candidatePorts must not contain 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let raw = r#"{
  "session": { "serverUrl": "ws://example.com:9000" },
  "daemon": { "candidatePorts": [9333] }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.session.server_url, "ws://example.com:9000");
        assert_eq!(cfg.session.request_timeout_secs, 30);
        assert_eq!(cfg.daemon.candidate_ports, vec![9333]);
        assert_eq!(cfg.daemon.debug_host, "127.0.0.1");
        assert!(!cfg.daemon.auto_reconnect);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut cfg = Config::default();
        cfg.daemon.auto_reconnect = true;
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.daemon.auto_reconnect);
        assert_eq!(loaded.daemon.candidate_ports, vec![9222, 9223, 9229]);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let cfg = Config::load_or_default(&paths).unwrap();
        assert_eq!(cfg.session.agent_type, "browser");
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let mut cfg = Config::default();
        cfg.daemon.candidate_ports = vec![9222, 0];
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_capture_dir_override() {
        let paths = Paths::with_base(PathBuf::from("/tmp/bl"));
        let mut daemon = DaemonConfig::default();
        assert_eq!(daemon.capture_dir(&paths), PathBuf::from("/tmp/bl/captures"));
        daemon.capture_dir = Some("/srv/shots".to_string());
        assert_eq!(daemon.capture_dir(&paths), PathBuf::from("/srv/shots"));
    }
}
