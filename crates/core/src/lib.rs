pub mod config;
pub mod error;
pub mod message;
pub mod paths;

pub use config::{Config, DaemonConfig, SessionConfig};
pub use error::{Error, Result};
pub use message::{
    AgentRegistration, CorrelationId, EventMessage, LogMessage, Message, MessageKind,
    ResponseMessage, TaskMessage,
};
pub use paths::Paths;
