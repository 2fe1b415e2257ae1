//! Command/response plumbing between a controlling process and the server.

pub mod client;
pub mod encoder;
pub mod post_office;
pub mod transport;

pub use client::Session;
pub use encoder::{CommandEncoder, BROWSER_JS_PREFIX};
pub use post_office::{PendingRequest, PostOffice};
pub use transport::{InboundFrame, TransportChannel, TransportSender};
