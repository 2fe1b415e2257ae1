//! Browser remote-debugging bridge: CDP client, daemons and their manager.

pub mod capture;
pub mod cdp;
pub mod daemon;
pub mod endpoint;
pub mod manager;

#[cfg(test)]
pub(crate) mod testing;

pub use capture::CaptureStore;
pub use cdp::{CdpClient, CdpEvent};
pub use daemon::{BrowserBridgeDaemon, DaemonId, DaemonOptions, DaemonRecord, DaemonState};
pub use endpoint::{CdpConnector, CdpSession, DebugConnector, DebugSession, LogEntry};
pub use manager::DaemonManager;
