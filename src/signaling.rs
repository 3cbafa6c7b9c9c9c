use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};

/// Everything that travels over the room channel. Frames look like
/// `{"event": "join", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SignalingMessage {
    Join {
        room: String,
        username: String,
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    Leave {
        room: String,
        username: String,
    },
    UserJoined {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    UserLeft {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    Warning {
        message: String,
    },
    Error {
        message: String,
    },
    Offer {
        room: String,
        from: String,
        to: String,
        sdp: String,
    },
    Answer {
        room: String,
        from: String,
        to: String,
        sdp: String,
    },
    IceCandidate {
        room: String,
        from: String,
        to: String,
        candidate: String,
    },
}

/// Membership and notices, consumed by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    UserJoined { peer_id: String },
    UserLeft { peer_id: String },
    Warning { message: String },
    Error { message: String },
}

/// Negotiation traffic, consumed by the peer transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Offer { from: String, to: String, sdp: String },
    Answer { from: String, to: String, sdp: String },
    IceCandidate { from: String, to: String, candidate: String },
}

impl RelayMessage {
    pub fn to(&self) -> &str {
        match self {
            RelayMessage::Offer { to, .. }
            | RelayMessage::Answer { to, .. }
            | RelayMessage::IceCandidate { to, .. } => to,
        }
    }

    pub fn into_message(self, room: &str) -> SignalingMessage {
        let room = room.to_string();
        match self {
            RelayMessage::Offer { from, to, sdp } => SignalingMessage::Offer { room, from, to, sdp },
            RelayMessage::Answer { from, to, sdp } => {
                SignalingMessage::Answer { room, from, to, sdp }
            }
            RelayMessage::IceCandidate { from, to, candidate } => SignalingMessage::IceCandidate {
                room,
                from,
                to,
                candidate,
            },
        }
    }
}

pub enum Inbound {
    Room(RoomEvent),
    Relay(RelayMessage),
    /// Messages only a client sends; the server should never echo them.
    Unexpected(SignalingMessage),
}

impl SignalingMessage {
    pub fn route(self) -> Inbound {
        match self {
            SignalingMessage::UserJoined { peer_id } => Inbound::Room(RoomEvent::UserJoined { peer_id }),
            SignalingMessage::UserLeft { peer_id } => Inbound::Room(RoomEvent::UserLeft { peer_id }),
            SignalingMessage::Warning { message } => Inbound::Room(RoomEvent::Warning { message }),
            SignalingMessage::Error { message } => Inbound::Room(RoomEvent::Error { message }),
            SignalingMessage::Offer { from, to, sdp, .. } => {
                Inbound::Relay(RelayMessage::Offer { from, to, sdp })
            }
            SignalingMessage::Answer { from, to, sdp, .. } => {
                Inbound::Relay(RelayMessage::Answer { from, to, sdp })
            }
            SignalingMessage::IceCandidate { from, to, candidate, .. } => {
                Inbound::Relay(RelayMessage::IceCandidate { from, to, candidate })
            }
            other @ (SignalingMessage::Join { .. } | SignalingMessage::Leave { .. }) => {
                Inbound::Unexpected(other)
            }
        }
    }
}

/// Send side of the room channel. Sends are fire-and-forget: success means
/// the message was queued, not that the server saw it.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, msg: SignalingMessage) -> Result<()>;
}

pub struct SignalingClient {
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

impl SignalingClient {
    /// Connects and starts the reader and writer tasks. Room events go to
    /// `room_events` in arrival order; relay traffic goes to `relay`.
    pub async fn connect<E>(
        url: &str,
        room_events: mpsc::UnboundedSender<E>,
        relay: mpsc::UnboundedSender<RelayMessage>,
    ) -> Result<Self>
    where
        E: From<RoomEvent> + Send + 'static,
    {
        let (ws_stream, _) = connect_async(url).await?;
        tracing::info!("connected to signaling server at {}", url);
        let (mut write, mut read) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<SignalingMessage>();

        // Handle outgoing messages; drains whatever is queued once the
        // client is dropped, then closes the socket.
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("failed to encode signaling message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    tracing::warn!("signaling write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!("signaling read failed: {}", e);
                        break;
                    }
                };
                let msg = match serde_json::from_str::<SignalingMessage>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!("skipping malformed signaling frame: {}", e);
                        continue;
                    }
                };
                let delivered = match msg.route() {
                    Inbound::Room(event) => room_events.send(E::from(event)).is_ok(),
                    Inbound::Relay(relay_msg) => relay.send(relay_msg).is_ok(),
                    Inbound::Unexpected(msg) => {
                        tracing::debug!("ignoring client-only message from server: {:?}", msg);
                        true
                    }
                };
                if !delivered {
                    return;
                }
            }
            tracing::info!("signaling connection closed");
            let _ = room_events.send(E::from(RoomEvent::Error {
                message: "Lost connection to the room server".to_string(),
            }));
        });

        Ok(Self { tx: outgoing_tx })
    }
}

#[async_trait]
impl SignalingChannel for SignalingClient {
    async fn send(&self, msg: SignalingMessage) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|e| Error::Signaling(format!("Failed to send message: {}", e)))
    }
}
