//! Peer transport: the seam the session uses to place and answer calls, and
//! its WebRTC implementation. Negotiation (offer, answer, ICE) is relayed
//! through the room's signaling channel.

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::AudioPlayback;
use crate::error::{Error, Result};
use crate::media::{LocalMediaStream, TrackKind};
use crate::signaling::{RelayMessage, SignalingChannel};
use crate::video::{FrameBoard, VideoPlayback};

pub type PeerId = String;
pub type CallId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub remote: PeerId,
    pub offer_sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    IncomingCall(IncomingCall),
    Track {
        call_id: CallId,
        remote: PeerId,
        track: RemoteTrack,
    },
    Closed {
        call_id: CallId,
        remote: PeerId,
    },
    Error {
        call_id: CallId,
        remote: PeerId,
        message: String,
    },
}

/// Where a transport delivers its events.
pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

#[async_trait]
pub trait CallHandle: Send + Sync {
    fn id(&self) -> CallId;
    fn remote(&self) -> &str;
    async fn close(&self);
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Obtains the local peer identity. Must succeed before any call.
    async fn open(&self) -> Result<PeerId>;

    async fn call(&self, remote: &str, local: &LocalMediaStream) -> Result<Box<dyn CallHandle>>;

    async fn answer(
        &self,
        incoming: IncomingCall,
        local: &LocalMediaStream,
    ) -> Result<Box<dyn CallHandle>>;
}

/// Where decoded remote video goes.
#[derive(Clone)]
pub struct VideoOutput {
    pub ffmpeg_path: String,
    pub frames: FrameBoard,
}

struct CallEntry {
    call_id: CallId,
    pc: Arc<RTCPeerConnection>,
    remote_description_set: bool,
}

/// Remote media being played for one call; dropping it stops playback.
#[derive(Default)]
struct Playback {
    audio: Vec<AudioPlayback>,
    video: Vec<VideoPlayback>,
}

struct Inner {
    room: String,
    ice_servers: Vec<String>,
    signaling: Arc<dyn SignalingChannel>,
    emit: EventSink,
    video: Option<VideoOutput>,
    api: SyncMutex<Option<Arc<API>>>,
    identity: SyncMutex<Option<PeerId>>,
    relay_rx: SyncMutex<Option<mpsc::UnboundedReceiver<RelayMessage>>>,
    next_call: AtomicU64,
    calls: Mutex<HashMap<PeerId, CallEntry>>,
    // Candidates that arrived before the remote description was applied.
    pending_candidates: Mutex<HashMap<PeerId, Vec<RTCIceCandidateInit>>>,
    playback: SyncMutex<HashMap<CallId, Playback>>,
}

pub struct WebRtcTransport {
    inner: Arc<Inner>,
}

impl WebRtcTransport {
    pub fn new(
        room: impl Into<String>,
        ice_servers: Vec<String>,
        signaling: Arc<dyn SignalingChannel>,
        relay_rx: mpsc::UnboundedReceiver<RelayMessage>,
        emit: EventSink,
        video: Option<VideoOutput>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                room: room.into(),
                ice_servers,
                signaling,
                emit,
                video,
                api: SyncMutex::new(None),
                identity: SyncMutex::new(None),
                relay_rx: SyncMutex::new(Some(relay_rx)),
                next_call: AtomicU64::new(1),
                calls: Mutex::new(HashMap::new()),
                pending_candidates: Mutex::new(HashMap::new()),
                playback: SyncMutex::new(HashMap::new()),
            }),
        }
    }
}

impl Inner {
    fn identity(&self) -> Result<PeerId> {
        self.identity
            .lock()
            .clone()
            .ok_or_else(|| Error::PeerIdentity("transport is not open".to_string()))
    }

    fn api(&self) -> Result<Arc<API>> {
        self.api
            .lock()
            .clone()
            .ok_or_else(|| Error::PeerIdentity("transport is not open".to_string()))
    }

    fn next_call_id(&self) -> CallId {
        self.next_call.fetch_add(1, Ordering::SeqCst)
    }

    async fn relay(&self, msg: RelayMessage) {
        if let Err(e) = self.signaling.send(msg.into_message(&self.room)).await {
            tracing::warn!("failed to relay negotiation message: {}", e);
        }
    }

    async fn new_connection(
        self: &Arc<Self>,
        call_id: CallId,
        remote: &str,
        local: &LocalMediaStream,
    ) -> Result<Arc<RTCPeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(self.api()?.new_peer_connection(config).await?);

        for track in local.tracks() {
            if let Err(e) = pc
                .add_track(track.rtc() as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                close_quietly(&pc, remote).await;
                return Err(e.into());
            }
        }

        let weak = Arc::downgrade(self);
        let remote_id = remote.to_string();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let weak = weak.clone();
                let remote = remote_id.clone();
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_remote_track(call_id, remote, track);
                    }
                })
            },
        ));

        let weak = Arc::downgrade(self);
        let remote_id = remote.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let weak = weak.clone();
            let remote = remote_id.clone();
            Box::pin(async move {
                tracing::debug!(%remote, call_id, "peer connection state: {}", state);
                if let Some(inner) = weak.upgrade() {
                    inner.on_state_change(call_id, remote, state).await;
                }
            })
        }));

        let weak = Arc::downgrade(self);
        let remote_id = remote.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            let remote = remote_id.clone();
            Box::pin(async move {
                let (Some(inner), Some(candidate)) = (weak.upgrade(), candidate) else {
                    return;
                };
                let Ok(from) = inner.identity() else {
                    return;
                };
                let encoded = candidate
                    .to_json()
                    .map_err(Error::from)
                    .and_then(|init| serde_json::to_string(&init).map_err(Error::from));
                match encoded {
                    Ok(candidate) => {
                        inner
                            .relay(RelayMessage::IceCandidate {
                                from,
                                to: remote,
                                candidate,
                            })
                            .await
                    }
                    Err(e) => tracing::warn!("failed to encode ICE candidate: {}", e),
                }
            })
        }));

        Ok(pc)
    }

    fn on_remote_track(&self, call_id: CallId, remote: PeerId, track: Arc<TrackRemote>) {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            other => {
                tracing::debug!("ignoring remote track of kind {}", other);
                return;
            }
        };

        let mime = track.codec().capability.mime_type;
        match kind {
            TrackKind::Audio if mime.eq_ignore_ascii_case(MIME_TYPE_PCMU) => {
                match AudioPlayback::start(track.clone()) {
                    Ok(playback) => self
                        .playback
                        .lock()
                        .entry(call_id)
                        .or_default()
                        .audio
                        .push(playback),
                    Err(e) => tracing::warn!("cannot play audio from {}: {}", remote, e),
                }
            }
            TrackKind::Video if mime.eq_ignore_ascii_case(MIME_TYPE_VP8) => {
                if let Some(output) = &self.video {
                    let started = VideoPlayback::start(
                        track.clone(),
                        &remote,
                        call_id,
                        &output.ffmpeg_path,
                        output.frames.clone(),
                    );
                    match started {
                        Ok(playback) => self
                            .playback
                            .lock()
                            .entry(call_id)
                            .or_default()
                            .video
                            .push(playback),
                        Err(e) => tracing::warn!("cannot show video from {}: {}", remote, e),
                    }
                }
            }
            _ => tracing::debug!("no decoder for {} {} from {}", mime, kind, remote),
        }

        (self.emit)(TransportEvent::Track {
            call_id,
            remote,
            track: RemoteTrack {
                id: track.id(),
                kind,
            },
        });
    }

    async fn on_state_change(&self, call_id: CallId, remote: PeerId, state: RTCPeerConnectionState) {
        match state {
            RTCPeerConnectionState::Failed => {
                (self.emit)(TransportEvent::Error {
                    call_id,
                    remote: remote.clone(),
                    message: "peer connection failed".to_string(),
                });
                self.forget(call_id, &remote).await;
                (self.emit)(TransportEvent::Closed { call_id, remote });
            }
            RTCPeerConnectionState::Closed => {
                self.forget(call_id, &remote).await;
                (self.emit)(TransportEvent::Closed { call_id, remote });
            }
            RTCPeerConnectionState::Disconnected => {
                tracing::info!(%remote, "peer connection disconnected, waiting for ICE");
            }
            _ => {}
        }
    }

    /// Drops bookkeeping for a call, unless a newer call to the same remote
    /// has taken its place. Candidates buffered for the remote go with it.
    async fn forget(&self, call_id: CallId, remote: &str) {
        let mut calls = self.calls.lock().await;
        if calls.get(remote).map(|c| c.call_id) == Some(call_id) {
            calls.remove(remote);
            self.pending_candidates.lock().await.remove(remote);
        }
        drop(calls);
        self.playback.lock().remove(&call_id);
    }

    async fn apply_pending_candidates(&self, remote: &str, pc: &RTCPeerConnection) {
        let pending = self.pending_candidates.lock().await.remove(remote);
        for candidate in pending.unwrap_or_default() {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!("dropping ICE candidate from {}: {}", remote, e);
            }
        }
    }

    async fn handle_relay(&self, msg: RelayMessage) -> Result<()> {
        match msg {
            RelayMessage::Offer { from, sdp, .. } => {
                (self.emit)(TransportEvent::IncomingCall(IncomingCall {
                    call_id: self.next_call_id(),
                    remote: from,
                    offer_sdp: sdp,
                }));
            }
            RelayMessage::Answer { from, sdp, .. } => {
                let answer: RTCSessionDescription = serde_json::from_str(&sdp)?;
                let pc = {
                    let mut calls = self.calls.lock().await;
                    let Some(entry) = calls.get_mut(&from) else {
                        tracing::debug!("answer from {} without a pending call", from);
                        return Ok(());
                    };
                    entry.remote_description_set = true;
                    entry.pc.clone()
                };
                pc.set_remote_description(answer).await?;
                self.apply_pending_candidates(&from, &pc).await;
            }
            RelayMessage::IceCandidate { from, candidate, .. } => {
                let candidate: RTCIceCandidateInit = serde_json::from_str(&candidate)?;
                let ready = {
                    let calls = self.calls.lock().await;
                    calls
                        .get(&from)
                        .filter(|c| c.remote_description_set)
                        .map(|c| c.pc.clone())
                };
                match ready {
                    Some(pc) => pc.add_ice_candidate(candidate).await?,
                    None => self
                        .pending_candidates
                        .lock()
                        .await
                        .entry(from)
                        .or_default()
                        .push(candidate),
                }
            }
        }
        Ok(())
    }

    /// Ends when the relay queue closes or the transport is dropped.
    async fn run_relay(weak: Weak<Self>, mut relay_rx: mpsc::UnboundedReceiver<RelayMessage>) {
        while let Some(msg) = relay_rx.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let Ok(me) = inner.identity() else {
                continue;
            };
            if msg.to() != me {
                continue;
            }
            if let Err(e) = inner.handle_relay(msg).await {
                tracing::warn!("failed to apply negotiation message: {}", e);
            }
        }
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn open(&self) -> Result<PeerId> {
        if let Ok(identity) = self.inner.identity() {
            return Ok(identity);
        }

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::PeerIdentity(e.to_string()))?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        *self.inner.api.lock() = Some(Arc::new(api));

        let identity = format!("peer-{:08x}", rand::random::<u32>());
        *self.inner.identity.lock() = Some(identity.clone());

        if let Some(relay_rx) = self.inner.relay_rx.lock().take() {
            tokio::spawn(Inner::run_relay(Arc::downgrade(&self.inner), relay_rx));
        }

        tracing::info!("peer identity {}", identity);
        Ok(identity)
    }

    async fn call(&self, remote: &str, local: &LocalMediaStream) -> Result<Box<dyn CallHandle>> {
        let from = self.inner.identity()?;
        let call_id = self.inner.next_call_id();
        let pc = self.inner.new_connection(call_id, remote, local).await?;

        let offer = match negotiate_offer(&pc).await {
            Ok(offer) => offer,
            Err(e) => {
                close_quietly(&pc, remote).await;
                return Err(e);
            }
        };

        self.inner.calls.lock().await.insert(
            remote.to_string(),
            CallEntry {
                call_id,
                pc: pc.clone(),
                remote_description_set: false,
            },
        );

        self.inner
            .relay(RelayMessage::Offer {
                from,
                to: remote.to_string(),
                sdp: offer,
            })
            .await;

        Ok(Box::new(WebRtcCall {
            call_id,
            remote: remote.to_string(),
            pc,
            inner: Arc::downgrade(&self.inner),
        }))
    }

    async fn answer(
        &self,
        incoming: IncomingCall,
        local: &LocalMediaStream,
    ) -> Result<Box<dyn CallHandle>> {
        let from = self.inner.identity()?;
        let IncomingCall {
            call_id,
            remote,
            offer_sdp,
        } = incoming;
        let offer: RTCSessionDescription = serde_json::from_str(&offer_sdp)?;

        let pc = self.inner.new_connection(call_id, &remote, local).await?;
        let answer = match negotiate_answer(&pc, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                close_quietly(&pc, &remote).await;
                return Err(e);
            }
        };

        self.inner.calls.lock().await.insert(
            remote.clone(),
            CallEntry {
                call_id,
                pc: pc.clone(),
                remote_description_set: true,
            },
        );
        self.inner.apply_pending_candidates(&remote, &pc).await;

        self.inner
            .relay(RelayMessage::Answer {
                from,
                to: remote.clone(),
                sdp: answer,
            })
            .await;

        Ok(Box::new(WebRtcCall {
            call_id,
            remote,
            pc,
            inner: Arc::downgrade(&self.inner),
        }))
    }
}

/// Sets the local offer; returns it encoded for the relay.
async fn negotiate_offer(pc: &RTCPeerConnection) -> Result<String> {
    let offer = pc.create_offer(None).await?;
    let encoded = serde_json::to_string(&offer)?;
    pc.set_local_description(offer).await?;
    Ok(encoded)
}

async fn negotiate_answer(pc: &RTCPeerConnection, offer: RTCSessionDescription) -> Result<String> {
    pc.set_remote_description(offer).await?;
    let answer = pc.create_answer(None).await?;
    let encoded = serde_json::to_string(&answer)?;
    pc.set_local_description(answer).await?;
    Ok(encoded)
}

async fn close_quietly(pc: &RTCPeerConnection, remote: &str) {
    if let Err(e) = pc.close().await {
        tracing::warn!("error closing call to {}: {}", remote, e);
    }
}

pub struct WebRtcCall {
    call_id: CallId,
    remote: PeerId,
    pc: Arc<RTCPeerConnection>,
    inner: Weak<Inner>,
}

#[async_trait]
impl CallHandle for WebRtcCall {
    fn id(&self) -> CallId {
        self.call_id
    }

    fn remote(&self) -> &str {
        &self.remote
    }

    async fn close(&self) {
        close_quietly(&self.pc, &self.remote).await;
        if let Some(inner) = self.inner.upgrade() {
            inner.forget(self.call_id, &self.remote).await;
        }
    }
}
