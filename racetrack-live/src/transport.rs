//! Transport seam between the session and the network.
//!
//! [`Connector`] opens one connection per (re)join attempt; the resulting
//! [`Transport`] moves text frames. [`WsConnector`] is the websocket
//! implementation:
//!
//! ```text
//!            ┌──────────── WsTransport ────────────┐
//! session ──►│ outgoing mpsc ──► writer task ──► ws │
//! session ◄──│ incoming mpsc ◄── reader task ◄── ws │
//!            └─────────────────────────────────────┘
//! ```
//!
//! The reader task feeds a bounded channel, so frames reach the session in
//! receipt order.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

/// Transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error("Connection timeout")]
    Timeout,
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Transport I/O error: {0}")]
    Io(String),
    /// The server refused us; never retried.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

/// A live, bidirectional frame stream.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Next inbound frame; `None` once the connection is gone.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports for a room.
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: Transport + 'static;

    async fn connect(&self, room_id: &str) -> Result<Self::Transport, TransportError>;
}

// ───────────────────────────────────────────────────────────────────
// Websocket implementation
// ───────────────────────────────────────────────────────────────────

/// Connects to `{server_url}/{room_id}`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    server_url: String,
    channel_capacity: usize,
}

impl WsConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            channel_capacity: 256,
        }
    }

    /// Capacity of the inbound frame channel.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn room_url(&self, room_id: &str) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), room_id)
    }
}

fn classify_connect_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                TransportError::Unauthorized(format!("handshake rejected with {status}"))
            } else {
                TransportError::Connect(format!("handshake failed with {status}"))
            }
        }
        other => TransportError::Connect(other.to_string()),
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, room_id: &str) -> Result<WsTransport, TransportError> {
        let url = self.room_url(room_id);
        log::debug!("Connecting to {url}");
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(classify_connect_error)?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(self.channel_capacity);
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_writer.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: forward text frames in receipt order.
        let (in_tx, in_rx) = mpsc::channel(self.channel_capacity);
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => Ok(text.as_str().to_owned()),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => Ok(text),
                        Err(_) => {
                            log::debug!("Ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => Err(TransportError::Io(e.to_string())),
                };
                let failed = frame.is_err();
                if in_tx.send(frame).await.is_err() || failed {
                    break;
                }
            }
        });

        log::info!("Connected to {url}");
        Ok(WsTransport {
            outgoing: Some(out_tx),
            incoming: in_rx,
            writer: Some(writer),
            reader,
        })
    }
}

/// Websocket connection handle. Dropping it stops both tasks.
pub struct WsTransport {
    outgoing: Option<mpsc::Sender<Message>>,
    incoming: mpsc::Receiver<Result<String, TransportError>>,
    writer: Option<JoinHandle<()>>,
    reader: JoinHandle<()>,
}

/// Upper bound on waiting for the close handshake to flush.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let tx = self.outgoing.as_ref().ok_or(TransportError::Closed)?;
        tx.send(Message::Text(frame.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.incoming.recv().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(tx) = self.outgoing.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer).await.is_err() {
                log::debug!("Close handshake did not flush in time");
            }
        }
        self.reader.abort();
        Ok(())
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        self.reader.abort();
    }
}
