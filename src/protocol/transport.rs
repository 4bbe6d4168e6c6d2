use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{info, warn};

use crate::error::{VoiceError, VoiceResult};

use super::messages::{Inbound, OutboundMessage};

/// What the receive side of the duplex stream yields.
#[derive(Debug)]
pub enum TransportItem {
    Message(Inbound),
    /// Connection closed or failed. Terminal: the session surfaces this as
    /// an error state and never reconnects on its own.
    Closed { reason: Option<String> },
}

/// Message-oriented duplex connection, expressed as a channel pair so the
/// session logic never touches the socket. Tests build one straight from
/// channels; production uses [`connect`].
pub struct Transport {
    pub outbound: mpsc::UnboundedSender<OutboundMessage>,
    pub inbound: mpsc::UnboundedReceiver<TransportItem>,
}

impl Transport {
    pub fn from_channels(
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        inbound: mpsc::UnboundedReceiver<TransportItem>,
    ) -> Self {
        Self { outbound, inbound }
    }
}

/// Open the WebSocket and spawn the two pump tasks.
///
/// Writer: outbound channel -> JSON text frames; dropping the sender sends
/// the closing handshake. Reader: text frames -> parsed inbound messages;
/// close/error becomes exactly one `Closed` item.
pub async fn connect(url: &str) -> VoiceResult<Transport> {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| VoiceError::Transport(format!("connect {}: {}", url, e)))?;
    info!("connected to {}", url);

    let (mut write, mut read) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportItem>();

    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    warn!("unserializable outbound message dropped: {}", e);
                    continue;
                }
            };
            if write.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = write.send(WsMessage::Close(None)).await;
    });

    tokio::spawn(async move {
        let reason = loop {
            match read.next().await {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<Inbound>(&text) {
                    Ok(msg) => {
                        if in_tx.send(TransportItem::Message(msg)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "unparseable inbound message ({}): {}",
                            e,
                            &text[..text.len().min(120)]
                        );
                    }
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    break frame.map(|f| f.reason.to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
                None => break None,
            }
        };
        let _ = in_tx.send(TransportItem::Closed { reason });
    });

    Ok(Transport {
        outbound: out_tx,
        inbound: in_rx,
    })
}
