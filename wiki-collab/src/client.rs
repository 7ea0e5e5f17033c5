//! WebSocket transport for talking to the relay service.
//!
//! `connect()` opens `<server_url>/<doc_id>` and spawns two tasks:
//!
//! ```text
//!  WsTransport::send() ──try_send──► mpsc ──writer task──► WebSocket
//!
//!  WebSocket ──reader task──► mpsc ──► ConnectionEvent::{Frame, Disconnected}
//! ```
//!
//! The session stays single-threaded: it pulls `ConnectionEvent`s from
//! the receiver and hands frames to `CollabSession::handle_frame`. A full
//! outgoing channel surfaces as `Backpressure`, a dead writer as `Closed`.
//!
//! Reference: Kleppmann, DDIA Chapter 5 (Replication)

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::transport::{Transport, TransportError};

/// Frames buffered between the session and the socket writer.
const CHANNEL_CAPACITY: usize = 256;

/// What the reader task reports back to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Frame(Vec<u8>),
    Disconnected,
}

/// Sending half of a live WebSocket connection.
#[derive(Debug, Clone)]
pub struct WsTransport {
    outgoing: mpsc::Sender<Vec<u8>>,
}

impl Transport for WsTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.outgoing.try_send(frame.to_vec()).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Backpressure,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

impl WsTransport {
    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }
}

/// Connect to the relay for one document.
pub async fn connect(
    server_url: &str,
    doc_id: Uuid,
) -> Result<(WsTransport, mpsc::Receiver<ConnectionEvent>), TransportError> {
    let url = format!("{}/{}", server_url.trim_end_matches('/'), doc_id);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    info!("Connected to {url}");

    let (mut ws_writer, mut ws_reader) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(CHANNEL_CAPACITY);

    // Writer task: forward outgoing channel to WebSocket
    tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if let Err(e) = ws_writer.send(Message::Binary(data.into())).await {
                warn!("WebSocket write failed: {e}");
                break;
            }
        }
        let _ = ws_writer.close().await;
        debug!("Writer task finished");
    });

    // Reader task: surface binary frames, report disconnect once
    tokio::spawn(async move {
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    if event_tx.send(ConnectionEvent::Frame(bytes)).await.is_err() {
                        return;
                    }
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    warn!("WebSocket read failed: {e}");
                    break;
                }
                Ok(_) => {}
            }
        }
        info!("Disconnected from relay");
        let _ = event_tx.send(ConnectionEvent::Disconnected).await;
    });

    Ok((WsTransport { outgoing: out_tx }, event_rx))
}
