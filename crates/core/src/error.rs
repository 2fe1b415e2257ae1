use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The channel could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// An established channel dropped while requests were in flight.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed inbound message (missing id, unknown type, bad JSON).
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No reachable debug port among {0:?}")]
    NoReachablePort(Vec<u16>),

    #[error("Daemon not connected (state: {0})")]
    NotConnected(String),

    #[error("Daemon stopped")]
    DaemonStopped,

    /// The remote side answered with an error payload.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("CDP error: {0}")]
    Cdp(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Failures that concern the shared channel rather than a single request.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::ConnectionLost(_) | Error::TransportClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
