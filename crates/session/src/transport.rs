//! Persistent WebSocket channel to the controlling server.
//!
//! The socket is split into a writer task that owns the sink and a reader
//! task that owns the stream. Outbound frames go through a cloneable
//! [`TransportSender`]; inbound frames are decoded into [`Message`]s and
//! handed out once through [`TransportChannel::receive`].

use browserlink_core::{Error, Message, Result};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

/// One decoded inbound frame. Malformed frames surface as `Error::Protocol`.
pub type InboundFrame = Result<Message>;

const CHANNEL_CAPACITY: usize = 256;

/// Cloneable write half of a transport.
#[derive(Clone)]
pub struct TransportSender {
    tx: mpsc::Sender<String>,
}

impl TransportSender {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, msg: &Message) -> Result<()> {
        self.send_text(msg.encode()?).await
    }

    /// Send a non-message frame such as the registration handshake.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        self.send_text(serde_json::to_string(value)?).await
    }

    pub async fn send_text(&self, text: String) -> Result<()> {
        self.tx.send(text).await.map_err(|_| Error::TransportClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct TransportChannel {
    address: String,
    sender: TransportSender,
    inbound: Option<mpsc::Receiver<InboundFrame>>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl TransportChannel {
    /// Connect to `address`, either a `ws://`/`wss://` URL or a bare `host:port`.
    pub async fn connect(address: &str) -> Result<Self> {
        let url = normalize_address(address)?;

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", url, e)))?;

        info!(address = %url, "Transport connected");

        let (mut ws_sink, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (pong_tx, mut pong_rx) = mpsc::channel::<Vec<u8>>(8);
        let (in_tx, in_rx) = mpsc::channel::<InboundFrame>(CHANNEL_CAPACITY);

        // Writer task: owns the sink, forwards outbound text and pongs
        let writer_handle = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    text = out_rx.recv() => match text {
                        Some(text) => WsMessage::Text(text),
                        None => break,
                    },
                    Some(data) = pong_rx.recv() => WsMessage::Pong(data),
                };
                if let Err(e) = ws_sink.send(frame).await {
                    error!(error = %e, "Transport write error");
                    return;
                }
            }
            let _ = ws_sink.send(WsMessage::Close(None)).await;
            debug!("Transport writer finished");
        });

        // Reader task: owns the stream, decodes frames for the consumer
        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = ws_read.next().await {
                let frame = match msg_result {
                    Ok(WsMessage::Text(text)) => Message::decode(&text),
                    Ok(WsMessage::Ping(data)) => {
                        let _ = pong_tx.try_send(data);
                        continue;
                    }
                    Ok(WsMessage::Close(_)) => {
                        info!("Transport closed by server");
                        break;
                    }
                    Ok(WsMessage::Binary(data)) => {
                        debug!(len = data.len(), "Ignoring binary frame");
                        continue;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "Transport read error");
                        break;
                    }
                };
                if in_tx.send(frame).await.is_err() {
                    debug!("Inbound consumer dropped, stopping reader");
                    break;
                }
            }
        });

        Ok(Self {
            address: url.to_string(),
            sender: TransportSender::new(out_tx),
            inbound: Some(in_rx),
            reader_handle,
            writer_handle,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    pub async fn send(&self, msg: &Message) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::TransportClosed);
        }
        self.sender.send(msg).await
    }

    /// The inbound sequence. Available once per connection; it ends when the
    /// remote closes or the socket fails.
    pub fn receive(&mut self) -> Option<mpsc::Receiver<InboundFrame>> {
        self.inbound.take()
    }

    pub fn is_connected(&self) -> bool {
        !self.reader_handle.is_finished() && !self.writer_handle.is_finished()
    }

    pub fn close(&self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn normalize_address(address: &str) -> Result<url::Url> {
    let address = address.trim();
    let raw = if address.contains("://") {
        address.to_string()
    } else {
        format!("ws://{}", address)
    };
    let url = url::Url::parse(&raw)
        .map_err(|e| Error::Connection(format!("Invalid address '{}': {}", address, e)))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(Error::Connection(format!("Unsupported scheme '{}'", other))),
    }
}
