//! One visit to a room. The session owns the local stream, the peer table
//! and the recorder, and is driven by a single task that applies events one
//! at a time.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::connection::{CallDirection, CallState, PeerTable};
use crate::controls::{toggle_track, ControlCommand, MEDIA_UNAVAILABLE};
use crate::error::{Error, Result, Surface};
use crate::media::{LocalMediaStream, MediaConstraints, MediaDevices, TrackKind};
use crate::recorder::{DownloadSink, FfmpegRecorder, Recorder, RecorderEvent};
use crate::signaling::{RoomEvent, SignalingChannel, SignalingClient, SignalingMessage};
use crate::transport::{
    EventSink, IncomingCall, PeerId, PeerTransport, TransportEvent, VideoOutput,
    WebRtcTransport,
};
use crate::video::FrameBoard;
use crate::view::{render, Notice, NoticeLevel, RenderInput, SessionPhase, ViewModel};

const MAX_NOTICES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Room(RoomEvent),
    Transport(TransportEvent),
    Recorder(RecorderEvent),
    Command(ControlCommand),
}

impl From<RoomEvent> for SessionEvent {
    fn from(event: RoomEvent) -> Self {
        SessionEvent::Room(event)
    }
}

/// The collaborators a session is built from.
pub struct SessionParts {
    pub devices: Arc<dyn MediaDevices>,
    pub signaling: Arc<dyn SignalingChannel>,
    pub transport: Arc<dyn PeerTransport>,
    pub recorder: Recorder,
    pub constraints: MediaConstraints,
}

pub struct Session {
    room: String,
    username: String,
    phase: SessionPhase,
    identity: Option<PeerId>,
    local: Option<LocalMediaStream>,
    peers: PeerTable,
    recorder: Recorder,
    devices: Arc<dyn MediaDevices>,
    signaling: Arc<dyn SignalingChannel>,
    transport: Arc<dyn PeerTransport>,
    constraints: MediaConstraints,
    notices: Vec<Notice>,
    alert: Option<String>,
    view_tx: watch::Sender<ViewModel>,
}

impl Session {
    pub fn create(
        room: impl Into<String>,
        username: impl Into<String>,
        parts: SessionParts,
    ) -> (Self, watch::Receiver<ViewModel>) {
        let room = room.into();
        let (view_tx, view_rx) = watch::channel(ViewModel {
            room: room.clone(),
            ..Default::default()
        });
        let session = Self {
            room,
            username: username.into(),
            phase: SessionPhase::Starting,
            identity: None,
            local: None,
            peers: PeerTable::new(),
            recorder: parts.recorder,
            devices: parts.devices,
            signaling: parts.signaling,
            transport: parts.transport,
            constraints: parts.constraints,
            notices: Vec::new(),
            alert: None,
            view_tx,
        };
        (session, view_rx)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn local(&self) -> Option<&LocalMediaStream> {
        self.local.as_ref()
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn view(&self) -> ViewModel {
        self.view_tx.borrow().clone()
    }

    /// Acquires media, opens the peer identity and announces presence. A
    /// failure at any step is shown to the user and ends setup.
    pub async fn start(&mut self) {
        if self.phase != SessionPhase::Starting {
            return;
        }

        match self.devices.get_user_media(self.constraints).await {
            Ok(stream) => {
                tracing::info!(
                    "local media ready: {} audio, {} video track(s)",
                    stream.audio_tracks().count(),
                    stream.video_tracks().count()
                );
                self.local = Some(stream);
                self.refresh();
            }
            Err(e) => {
                tracing::error!("Error accessing media devices: {}", e);
                let e = match e {
                    Error::MediaAccessDenied(_) => e,
                    other => Error::MediaAccessDenied(other.to_string()),
                };
                self.fail(e);
                return;
            }
        }

        let identity = match self.transport.open().await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::error!("Peer error: {}", e);
                let e = match e {
                    Error::PeerIdentity(_) => e,
                    other => Error::PeerIdentity(other.to_string()),
                };
                self.fail(e);
                return;
            }
        };
        self.identity = Some(identity.clone());

        let join = SignalingMessage::Join {
            room: self.room.clone(),
            username: self.username.clone(),
            peer_id: identity,
        };
        if let Err(e) = self.signaling.send(join).await {
            tracing::error!("failed to announce presence: {}", e);
            self.report(e);
            self.phase = SessionPhase::Failed;
            self.refresh();
            return;
        }

        self.phase = SessionPhase::Joined;
        tracing::info!("joined room {} as {}", self.room, self.username);
        self.refresh();
    }

    pub async fn handle(&mut self, event: SessionEvent) {
        if self.phase == SessionPhase::Left {
            tracing::debug!("session left, dropping {:?}", event);
            return;
        }
        match event {
            SessionEvent::Command(command) => self.on_command(command).await,
            SessionEvent::Recorder(event) => self.on_recorder_event(event),
            SessionEvent::Room(event) if self.phase == SessionPhase::Joined => {
                self.on_room_event(event).await
            }
            SessionEvent::Transport(event) if self.phase == SessionPhase::Joined => {
                self.on_transport_event(event).await
            }
            other => tracing::debug!("not joined, dropping {:?}", other),
        }
    }

    /// Leaves the room: stops local media, closes every call and announces
    /// the departure. Terminal; later events are ignored.
    pub async fn dispose(&mut self) {
        if self.phase == SessionPhase::Left {
            return;
        }
        self.phase = SessionPhase::Left;

        // The process exits this room before the encoder could flush, so a
        // running recording is abandoned.
        if self.recorder.stop() {
            tracing::warn!("leaving while recording, recording discarded");
        }
        if let Some(local) = &self.local {
            local.stop_all();
        }
        for entry in self.peers.drain() {
            entry.handle.close().await;
        }

        let leave = SignalingMessage::Leave {
            room: self.room.clone(),
            username: self.username.clone(),
        };
        if let Err(e) = self.signaling.send(leave).await {
            tracing::warn!("failed to announce leave: {}", e);
        }

        tracing::info!("left room {}", self.room);
        self.refresh();
    }

    async fn on_room_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::UserJoined { peer_id } => self.connect_to(peer_id).await,
            RoomEvent::UserLeft { peer_id } => match self.peers.remove(&peer_id) {
                Some(entry) => {
                    entry.handle.close().await;
                    tracing::info!("{} left the room", peer_id);
                    self.refresh();
                }
                None => tracing::debug!("user_left for unknown peer {}", peer_id),
            },
            RoomEvent::Warning { message } => {
                tracing::warn!("server warning: {}", message);
                self.notify(NoticeLevel::Warning, message);
            }
            RoomEvent::Error { message } => {
                tracing::error!("server error: {}", message);
                self.notify(NoticeLevel::Error, message);
            }
        }
    }

    async fn connect_to(&mut self, peer_id: PeerId) {
        if self.identity.as_deref() == Some(peer_id.as_str()) {
            return;
        }
        if self.peers.contains(&peer_id) {
            tracing::debug!("already connected to {}, ignoring join", peer_id);
            return;
        }
        let Some(local) = self.local.as_ref() else {
            return;
        };

        match self.transport.call(&peer_id, local).await {
            Ok(handle) => {
                tracing::info!("calling {}", peer_id);
                self.peers.insert(handle, CallDirection::Outbound);
                self.refresh();
            }
            Err(e) => self.call_error(&peer_id, e.to_string()),
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::IncomingCall(incoming) => self.answer(incoming).await,
            TransportEvent::Track {
                call_id,
                remote,
                track,
            } => {
                let kind = track.kind;
                if self.peers.add_track(&remote, call_id, track) {
                    tracing::info!("receiving {} from {}", kind, remote);
                    self.refresh();
                } else {
                    tracing::debug!("track for stale call {} from {}", call_id, remote);
                }
            }
            TransportEvent::Closed { call_id, remote } => {
                if self.peers.remove_call(&remote, call_id).is_some() {
                    tracing::info!("call with {} closed", remote);
                    self.refresh();
                }
            }
            TransportEvent::Error {
                call_id,
                remote,
                message,
            } => {
                if self.peers.is_current(&remote, call_id) {
                    self.call_error(&remote, message);
                }
            }
        }
    }

    async fn answer(&mut self, incoming: IncomingCall) {
        let Some(local) = self.local.as_ref() else {
            return;
        };
        let remote = incoming.remote.clone();
        if self.keeps_outgoing_call(&remote) {
            tracing::debug!("calls with {} crossed, keeping ours", remote);
            return;
        }
        match self.transport.answer(incoming, local).await {
            Ok(handle) => {
                tracing::info!("answered call from {}", remote);
                if let Some(replaced) = self.peers.insert(handle, CallDirection::Inbound) {
                    replaced.handle.close().await;
                }
                self.refresh();
            }
            Err(e) => self.call_error(&remote, e.to_string()),
        }
    }

    /// When both sides call each other at once, the lower peer id keeps its
    /// outgoing call and the higher one answers.
    fn keeps_outgoing_call(&self, remote: &str) -> bool {
        let Some(me) = self.identity.as_deref() else {
            return false;
        };
        self.peers.get(remote).map_or(false, |entry| {
            entry.direction == CallDirection::Outbound
                && entry.state == CallState::Connecting
                && me < remote
        })
    }

    async fn on_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::ToggleMute => self.toggle(TrackKind::Audio),
            ControlCommand::ToggleVideo => self.toggle(TrackKind::Video),
            ControlCommand::ToggleRecord => self.toggle_record(),
            ControlCommand::Leave => self.dispose().await,
            ControlCommand::DismissAlert => {
                self.alert = None;
                self.refresh();
            }
        }
    }

    fn toggle(&mut self, kind: TrackKind) {
        let Some(local) = self.local.as_ref() else {
            self.show_alert(MEDIA_UNAVAILABLE.to_string());
            return;
        };
        if toggle_track(local, kind).is_some() {
            self.refresh();
        }
    }

    fn toggle_record(&mut self) {
        if self.local.is_none() {
            self.show_alert(MEDIA_UNAVAILABLE.to_string());
            return;
        }
        if self.recorder.is_recording() {
            self.recorder.stop();
            self.refresh();
            return;
        }
        match self.recorder.start(self.local.as_ref()) {
            Ok(true) => self.refresh(),
            Ok(false) => tracing::debug!("recorder busy finalizing"),
            Err(e) => {
                tracing::error!("{}", e);
                self.report(e);
            }
        }
    }

    fn on_recorder_event(&mut self, event: RecorderEvent) {
        match event {
            RecorderEvent::Data(chunk) => self.recorder.on_data(chunk),
            RecorderEvent::Stopped => match self.recorder.on_stopped() {
                Ok(Some(path)) => self.notify(
                    NoticeLevel::Info,
                    format!("Recording saved to {}", path.display()),
                ),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("failed to save recording: {}", e);
                    self.report(Error::Recording(e.to_string()));
                }
            },
        }
    }

    fn call_error(&mut self, remote: &str, message: String) {
        tracing::warn!("Call error with {}: {}", remote, message);
        self.report(Error::Call(format!("{}: {}", remote, message)));
    }

    fn fail(&mut self, error: Error) {
        self.report(error);
        self.phase = SessionPhase::Failed;
        self.refresh();
    }

    fn report(&mut self, error: Error) {
        match error.kind().surface() {
            Surface::BlockingAlert => self.show_alert(error.alert_text()),
            Surface::Notice => self.notify(NoticeLevel::Error, error.to_string()),
        }
    }

    fn show_alert(&mut self, message: String) {
        self.alert = Some(message);
        self.refresh();
    }

    fn notify(&mut self, level: NoticeLevel, message: String) {
        self.notices.push(Notice { level, message });
        if self.notices.len() > MAX_NOTICES {
            self.notices.remove(0);
        }
        self.refresh();
    }

    fn refresh(&self) {
        let view = render(RenderInput {
            room: &self.room,
            phase: self.phase,
            peers: &self.peers,
            local: self.local.as_ref(),
            recording: self.recorder.is_recording(),
            notices: &self.notices,
            alert: self.alert.as_deref(),
        });
        self.view_tx.send_replace(view);
    }
}

/// Drives a session until the user leaves.
pub async fn run(mut session: Session, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    session.start().await;
    while let Some(event) = events.recv().await {
        session.handle(event).await;
        if session.phase() == SessionPhase::Left {
            break;
        }
    }
}

/// The UI's grip on a running session.
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    view: watch::Receiver<ViewModel>,
}

impl SessionHandle {
    pub fn send(&self, command: ControlCommand) {
        if self.events.send(SessionEvent::Command(command)).is_err() {
            tracing::debug!("session already ended, dropping {:?}", command);
        }
    }

    pub fn view(&self) -> watch::Receiver<ViewModel> {
        self.view.clone()
    }
}

/// A fresh room id: the first eight characters of a v4 UUID.
pub fn new_room_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Connects to the room server and starts a session for `room` with the
/// desktop media, WebRTC and ffmpeg backends. Remote video is decoded onto
/// `frames`.
pub async fn join_room(
    config: &Config,
    room: &str,
    devices: Arc<dyn MediaDevices>,
    frames: FrameBoard,
) -> Result<SessionHandle> {
    let (events_tx, events_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (relay_tx, relay_rx) = mpsc::unbounded_channel();

    let signaling: Arc<dyn SignalingChannel> = Arc::new(
        SignalingClient::connect(&config.signaling_url, events_tx.clone(), relay_tx).await?,
    );

    let transport_tx = events_tx.clone();
    let emit: EventSink = Arc::new(move |event: TransportEvent| {
        let _ = transport_tx.send(SessionEvent::Transport(event));
    });
    let transport = Arc::new(WebRtcTransport::new(
        room,
        config.ice_servers.clone(),
        signaling.clone(),
        relay_rx,
        emit,
        Some(VideoOutput {
            ffmpeg_path: config.ffmpeg_path.clone(),
            frames,
        }),
    ));

    let recorder_tx = events_tx.clone();
    let recorder = Recorder::new(
        Box::new(FfmpegRecorder::new(config.ffmpeg_path.clone())),
        Box::new(DownloadSink::new(config.recordings_dir.clone())),
        Arc::new(move |event: RecorderEvent| {
            let _ = recorder_tx.send(SessionEvent::Recorder(event));
        }),
    );

    let (session, view) = Session::create(
        room,
        config.username.clone(),
        SessionParts {
            devices,
            signaling,
            transport,
            recorder,
            constraints: MediaConstraints {
                audio: true,
                video: config.request_video,
            },
        },
    );
    tokio::spawn(run(session, events_rx));

    Ok(SessionHandle {
        events: events_tx,
        view,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::LocalTrack;
    use crate::recorder::{
        ArtifactSink, RecorderSink, RecordingArtifact, RecordingBackend, RECORDING_FILE_NAME,
    };
    use crate::transport::{CallHandle, CallId, RemoteTrack};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeDevices {
        fail: bool,
        with_video: bool,
    }

    #[async_trait]
    impl MediaDevices for FakeDevices {
        async fn get_user_media(&self, _: MediaConstraints) -> Result<LocalMediaStream> {
            if self.fail {
                return Err(Error::MediaAccessDenied("Permission denied".into()));
            }
            let mut tracks = vec![LocalTrack::new(TrackKind::Audio, "local")];
            if self.with_video {
                tracks.push(LocalTrack::new(TrackKind::Video, "local"));
            }
            Ok(LocalMediaStream::new("local", tracks))
        }
    }

    #[derive(Default)]
    struct FakeSignaling {
        sent: Mutex<Vec<SignalingMessage>>,
    }

    #[async_trait]
    impl SignalingChannel for FakeSignaling {
        async fn send(&self, msg: SignalingMessage) -> Result<()> {
            self.sent.lock().push(msg);
            Ok(())
        }
    }

    impl FakeSignaling {
        fn leaves(&self) -> usize {
            self.sent
                .lock()
                .iter()
                .filter(|m| matches!(m, SignalingMessage::Leave { .. }))
                .count()
        }
    }

    struct FakeCall {
        id: CallId,
        remote: String,
        closed: Arc<Mutex<Vec<CallId>>>,
    }

    #[async_trait]
    impl CallHandle for FakeCall {
        fn id(&self) -> CallId {
            self.id
        }

        fn remote(&self) -> &str {
            &self.remote
        }

        async fn close(&self) {
            self.closed.lock().push(self.id);
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        fail_open: bool,
        fail_calls: bool,
        next_id: AtomicU64,
        placed: Mutex<Vec<(CallId, String)>>,
        answered: Mutex<Vec<(CallId, String)>>,
        closed: Arc<Mutex<Vec<CallId>>>,
    }

    impl FakeTransport {
        fn handle(&self, id: CallId, remote: &str) -> Box<dyn CallHandle> {
            Box::new(FakeCall {
                id,
                remote: remote.to_string(),
                closed: self.closed.clone(),
            })
        }

        fn call_id(&self, remote: &str) -> CallId {
            self.placed
                .lock()
                .iter()
                .rev()
                .find(|(_, r)| r == remote)
                .map(|(id, _)| *id)
                .unwrap()
        }
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn open(&self) -> Result<PeerId> {
            if self.fail_open {
                return Err(Error::PeerIdentity("broker unreachable".into()));
            }
            Ok("p1".to_string())
        }

        async fn call(&self, remote: &str, _: &LocalMediaStream) -> Result<Box<dyn CallHandle>> {
            if self.fail_calls {
                return Err(Error::Call("could not create offer".into()));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.placed.lock().push((id, remote.to_string()));
            Ok(self.handle(id, remote))
        }

        async fn answer(
            &self,
            incoming: IncomingCall,
            _: &LocalMediaStream,
        ) -> Result<Box<dyn CallHandle>> {
            self.answered
                .lock()
                .push((incoming.call_id, incoming.remote.clone()));
            Ok(self.handle(incoming.call_id, &incoming.remote))
        }
    }

    struct FakeBackend;

    impl RecordingBackend for FakeBackend {
        fn start(&mut self, _: &LocalMediaStream, _: RecorderSink) -> Result<()> {
            Ok(())
        }

        fn stop(&mut self) {}
    }

    struct MemorySink(Arc<Mutex<Vec<RecordingArtifact>>>);

    impl ArtifactSink for MemorySink {
        fn save(&self, artifact: &RecordingArtifact) -> Result<PathBuf> {
            self.0.lock().push(artifact.clone());
            Ok(PathBuf::from(&artifact.file_name))
        }
    }

    struct Harness {
        session: Session,
        signaling: Arc<FakeSignaling>,
        transport: Arc<FakeTransport>,
        saved: Arc<Mutex<Vec<RecordingArtifact>>>,
    }

    fn harness_with(devices: FakeDevices, transport: FakeTransport) -> Harness {
        let signaling = Arc::new(FakeSignaling::default());
        let transport = Arc::new(transport);
        let saved = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder::new(
            Box::new(FakeBackend),
            Box::new(MemorySink(saved.clone())),
            Arc::new(|_: RecorderEvent| {}),
        );
        let (session, _view) = Session::create(
            "abc",
            "alice",
            SessionParts {
                devices: Arc::new(devices),
                signaling: signaling.clone(),
                transport: transport.clone(),
                recorder,
                constraints: MediaConstraints::default(),
            },
        );
        Harness {
            session,
            signaling,
            transport,
            saved,
        }
    }

    async fn joined() -> Harness {
        let mut h = harness_with(
            FakeDevices {
                fail: false,
                with_video: true,
            },
            FakeTransport::default(),
        );
        h.session.start().await;
        assert_eq!(h.session.phase(), SessionPhase::Joined);
        h
    }

    fn joined_event(peer: &str) -> SessionEvent {
        SessionEvent::Room(RoomEvent::UserJoined {
            peer_id: peer.to_string(),
        })
    }

    fn left_event(peer: &str) -> SessionEvent {
        SessionEvent::Room(RoomEvent::UserLeft {
            peer_id: peer.to_string(),
        })
    }

    fn track_event(call_id: CallId, peer: &str, kind: TrackKind) -> SessionEvent {
        SessionEvent::Transport(TransportEvent::Track {
            call_id,
            remote: peer.to_string(),
            track: RemoteTrack {
                id: format!("{}-{}", peer, kind),
                kind,
            },
        })
    }

    fn assert_view_matches_table(session: &Session) {
        let mut visible = session.view().participants;
        visible.sort();
        assert_eq!(visible, session.peers().ids());
    }

    #[test]
    fn room_ids_are_short_and_distinct() {
        let a = new_room_id();
        let b = new_room_id();
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn start_announces_presence_with_peer_identity() {
        let h = joined().await;
        assert_eq!(h.session.identity(), Some("p1"));
        assert_eq!(
            h.signaling.sent.lock().as_slice(),
            &[SignalingMessage::Join {
                room: "abc".into(),
                username: "alice".into(),
                peer_id: "p1".into(),
            }]
        );
        assert!(h.session.view().local.available);
    }

    #[tokio::test]
    async fn peer_joins_connects_and_leaves() {
        let mut h = joined().await;

        h.session.handle(joined_event("p2")).await;
        assert_eq!(h.transport.placed.lock().len(), 1);
        assert!(h.session.view().participants.is_empty());

        let call_id = h.transport.call_id("p2");
        h.session
            .handle(track_event(call_id, "p2", TrackKind::Video))
            .await;
        let view = h.session.view();
        assert_eq!(view.participants, vec!["p2"]);
        assert_eq!(view.tiles.len(), 1);
        assert!(view.tiles[0].has_video);

        h.session.handle(left_event("p2")).await;
        assert!(h.session.peers().is_empty());
        assert!(h.session.view().participants.is_empty());
        assert_eq!(h.transport.closed.lock().as_slice(), &[call_id]);
    }

    #[tokio::test]
    async fn view_tracks_the_table_through_membership_churn() {
        let mut h = joined().await;

        for peer in ["p2", "p3", "p4"] {
            h.session.handle(joined_event(peer)).await;
            let id = h.transport.call_id(peer);
            h.session.handle(track_event(id, peer, TrackKind::Audio)).await;
            assert_view_matches_table(&h.session);
        }

        h.session.handle(left_event("p3")).await;
        assert_view_matches_table(&h.session);

        h.session.handle(joined_event("p5")).await;
        let p5 = h.transport.call_id("p5");
        h.session.handle(track_event(p5, "p5", TrackKind::Audio)).await;
        assert_view_matches_table(&h.session);

        let p4 = h.transport.call_id("p4");
        h.session
            .handle(SessionEvent::Transport(TransportEvent::Closed {
                call_id: p4,
                remote: "p4".into(),
            }))
            .await;
        assert_view_matches_table(&h.session);
        assert_eq!(h.session.view().participants, vec!["p2", "p5"]);

        h.session.handle(left_event("nobody")).await;
        assert_view_matches_table(&h.session);
    }

    #[tokio::test]
    async fn duplicate_and_self_joins_are_ignored() {
        let mut h = joined().await;
        h.session.handle(joined_event("p2")).await;
        h.session.handle(joined_event("p2")).await;
        h.session.handle(joined_event("p1")).await;
        assert_eq!(h.transport.placed.lock().len(), 1);
        assert_eq!(h.session.peers().len(), 1);
    }

    #[tokio::test]
    async fn incoming_call_from_lower_id_replaces_our_pending_call() {
        let mut h = joined().await;
        // "p0" sorts before our "p1", so its call wins.
        h.session.handle(joined_event("p0")).await;
        let outbound = h.transport.call_id("p0");

        h.session
            .handle(SessionEvent::Transport(TransportEvent::IncomingCall(
                IncomingCall {
                    call_id: 100,
                    remote: "p0".into(),
                    offer_sdp: "{}".into(),
                },
            )))
            .await;
        assert_eq!(h.transport.answered.lock().as_slice(), &[(100, "p0".to_string())]);
        assert_eq!(h.transport.closed.lock().as_slice(), &[outbound]);
        assert_eq!(
            h.session.peers().get("p0").map(|e| e.direction),
            Some(CallDirection::Inbound)
        );

        // The replaced call's late events change nothing.
        h.session
            .handle(track_event(outbound, "p0", TrackKind::Audio))
            .await;
        h.session
            .handle(SessionEvent::Transport(TransportEvent::Closed {
                call_id: outbound,
                remote: "p0".into(),
            }))
            .await;
        assert!(h.session.peers().contains("p0"));
        assert!(h.session.view().participants.is_empty());

        h.session.handle(track_event(100, "p0", TrackKind::Audio)).await;
        assert_eq!(h.session.view().participants, vec!["p0"]);
    }

    #[tokio::test]
    async fn crossed_call_from_higher_id_is_ignored() {
        let mut h = joined().await;
        h.session.handle(joined_event("p2")).await;
        let outbound = h.transport.call_id("p2");

        h.session
            .handle(SessionEvent::Transport(TransportEvent::IncomingCall(
                IncomingCall {
                    call_id: 100,
                    remote: "p2".into(),
                    offer_sdp: "{}".into(),
                },
            )))
            .await;
        assert!(h.transport.answered.lock().is_empty());
        assert!(h.transport.closed.lock().is_empty());
        assert_eq!(h.session.peers().get("p2").map(|e| e.call_id()), Some(outbound));

        // Once connected, a fresh offer from the same peer is a renegotiation
        // and replaces the call.
        h.session
            .handle(track_event(outbound, "p2", TrackKind::Audio))
            .await;
        h.session
            .handle(SessionEvent::Transport(TransportEvent::IncomingCall(
                IncomingCall {
                    call_id: 101,
                    remote: "p2".into(),
                    offer_sdp: "{}".into(),
                },
            )))
            .await;
        assert_eq!(h.transport.answered.lock().as_slice(), &[(101, "p2".to_string())]);
        assert_eq!(h.transport.closed.lock().as_slice(), &[outbound]);
    }

    /// Two sessions whose calls are delivered to each other's event queues.
    /// Answering a call that is still live connects both ends; closing a
    /// call tells the other end.
    #[derive(Default)]
    struct Link {
        queues: Mutex<HashMap<String, mpsc::UnboundedSender<SessionEvent>>>,
        live: Mutex<HashMap<CallId, (String, String)>>,
        next_id: AtomicU64,
    }

    impl Link {
        fn deliver(&self, to: &str, event: TransportEvent) {
            if let Some(queue) = self.queues.lock().get(to) {
                let _ = queue.send(SessionEvent::Transport(event));
            }
        }

        fn track(call_id: CallId, remote: &str) -> TransportEvent {
            TransportEvent::Track {
                call_id,
                remote: remote.to_string(),
                track: RemoteTrack {
                    id: format!("{}-audio", remote),
                    kind: TrackKind::Audio,
                },
            }
        }
    }

    struct LinkedCall {
        id: CallId,
        me: String,
        remote: String,
        link: Arc<Link>,
    }

    #[async_trait]
    impl CallHandle for LinkedCall {
        fn id(&self) -> CallId {
            self.id
        }

        fn remote(&self) -> &str {
            &self.remote
        }

        async fn close(&self) {
            if self.link.live.lock().remove(&self.id).is_some() {
                self.link.deliver(
                    &self.remote,
                    TransportEvent::Closed {
                        call_id: self.id,
                        remote: self.me.clone(),
                    },
                );
            }
        }
    }

    struct LinkedTransport {
        me: String,
        link: Arc<Link>,
    }

    impl LinkedTransport {
        fn handle(&self, id: CallId, remote: &str) -> Box<dyn CallHandle> {
            Box::new(LinkedCall {
                id,
                me: self.me.clone(),
                remote: remote.to_string(),
                link: self.link.clone(),
            })
        }
    }

    #[async_trait]
    impl PeerTransport for LinkedTransport {
        async fn open(&self) -> Result<PeerId> {
            Ok(self.me.clone())
        }

        async fn call(&self, remote: &str, _: &LocalMediaStream) -> Result<Box<dyn CallHandle>> {
            let id = self.link.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.link
                .live
                .lock()
                .insert(id, (self.me.clone(), remote.to_string()));
            self.link.deliver(
                remote,
                TransportEvent::IncomingCall(IncomingCall {
                    call_id: id,
                    remote: self.me.clone(),
                    offer_sdp: "{}".into(),
                }),
            );
            Ok(self.handle(id, remote))
        }

        async fn answer(
            &self,
            incoming: IncomingCall,
            _: &LocalMediaStream,
        ) -> Result<Box<dyn CallHandle>> {
            let live = self.link.live.lock().contains_key(&incoming.call_id);
            if live {
                self.link
                    .deliver(&self.me, Link::track(incoming.call_id, &incoming.remote));
                self.link
                    .deliver(&incoming.remote, Link::track(incoming.call_id, &self.me));
            }
            Ok(self.handle(incoming.call_id, &incoming.remote))
        }
    }

    async fn linked_session(
        me: &str,
        link: &Arc<Link>,
    ) -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        link.queues.lock().insert(me.to_string(), tx);
        let (mut session, _view) = Session::create(
            "abc",
            me,
            SessionParts {
                devices: Arc::new(FakeDevices {
                    fail: false,
                    with_video: false,
                }),
                signaling: Arc::new(FakeSignaling::default()),
                transport: Arc::new(LinkedTransport {
                    me: me.to_string(),
                    link: link.clone(),
                }),
                recorder: Recorder::new(
                    Box::new(FakeBackend),
                    Box::new(MemorySink(Arc::new(Mutex::new(Vec::new())))),
                    Arc::new(|_: RecorderEvent| {}),
                ),
                constraints: MediaConstraints::default(),
            },
        );
        session.start().await;
        assert_eq!(session.phase(), SessionPhase::Joined);
        (session, rx)
    }

    /// Applies queued events to both sessions until neither has any left.
    async fn settle(
        sessions: [(&mut Session, &mut mpsc::UnboundedReceiver<SessionEvent>); 2],
    ) {
        let [(a, a_rx), (b, b_rx)] = sessions;
        loop {
            let mut progressed = false;
            while let Ok(event) = a_rx.try_recv() {
                a.handle(event).await;
                progressed = true;
            }
            while let Ok(event) = b_rx.try_recv() {
                b.handle(event).await;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    #[tokio::test]
    async fn simultaneous_calls_leave_one_connection_both_ways() {
        for lower_settles_first in [true, false] {
            let link = Arc::new(Link::default());
            let (mut a, mut a_rx) = linked_session("peer-a", &link).await;
            let (mut b, mut b_rx) = linked_session("peer-b", &link).await;

            // Both learn about each other before either call lands.
            a.handle(joined_event("peer-b")).await;
            b.handle(joined_event("peer-a")).await;

            if lower_settles_first {
                settle([(&mut a, &mut a_rx), (&mut b, &mut b_rx)]).await;
            } else {
                settle([(&mut b, &mut b_rx), (&mut a, &mut a_rx)]).await;
            }

            assert_eq!(a.view().participants, vec!["peer-b"]);
            assert_eq!(b.view().participants, vec!["peer-a"]);
            assert_eq!(a.peers().state("peer-b"), Some(CallState::Connected));
            assert_eq!(b.peers().state("peer-a"), Some(CallState::Connected));

            // The surviving call is the one the lower id placed.
            let kept = a.peers().get("peer-b").map(|e| e.call_id());
            assert_eq!(kept, b.peers().get("peer-a").map(|e| e.call_id()));
            assert_eq!(
                a.peers().get("peer-b").map(|e| e.direction),
                Some(CallDirection::Outbound)
            );
            let live = link.live.lock();
            assert_eq!(live.len(), 1);
            assert_eq!(
                live.values().next(),
                Some(&("peer-a".to_string(), "peer-b".to_string()))
            );
        }
    }

    #[tokio::test]
    async fn call_errors_are_logged_and_shown() {
        let mut h = joined().await;
        h.session.handle(joined_event("p2")).await;
        let id = h.transport.call_id("p2");

        h.session
            .handle(SessionEvent::Transport(TransportEvent::Error {
                call_id: id,
                remote: "p2".into(),
                message: "ICE failed".into(),
            }))
            .await;

        let view = h.session.view();
        assert!(view.alert.is_none());
        assert_eq!(view.notices.len(), 1);
        assert_eq!(view.notices[0].level, NoticeLevel::Error);
        assert!(view.notices[0].message.contains("p2: ICE failed"));
        assert!(h.session.peers().contains("p2"));
    }

    #[tokio::test]
    async fn failed_outbound_call_leaves_no_entry() {
        let mut h = harness_with(
            FakeDevices {
                fail: false,
                with_video: false,
            },
            FakeTransport {
                fail_calls: true,
                ..Default::default()
            },
        );
        h.session.start().await;
        h.session.handle(joined_event("p2")).await;
        assert!(h.session.peers().is_empty());
        assert_eq!(h.session.view().notices.len(), 1);
    }

    #[tokio::test]
    async fn server_notices_are_shown_without_blocking() {
        let mut h = joined().await;
        h.session
            .handle(SessionEvent::Room(RoomEvent::Warning {
                message: "Free session ends in 5.0 minutes.".into(),
            }))
            .await;
        h.session
            .handle(SessionEvent::Room(RoomEvent::Error {
                message: "Session expired.".into(),
            }))
            .await;
        let view = h.session.view();
        assert_eq!(
            view.notices.iter().map(|n| n.level).collect::<Vec<_>>(),
            vec![NoticeLevel::Warning, NoticeLevel::Error]
        );
        assert!(view.alert.is_none());
    }

    #[tokio::test]
    async fn media_failure_alerts_and_halts_setup() {
        let mut h = harness_with(
            FakeDevices {
                fail: true,
                with_video: false,
            },
            FakeTransport::default(),
        );
        h.session.start().await;

        assert_eq!(h.session.phase(), SessionPhase::Failed);
        assert!(h.session.identity().is_none());
        assert!(h.signaling.sent.lock().is_empty());
        let alert = h.session.view().alert.unwrap();
        assert!(alert.starts_with("Error accessing camera and microphone: Permission denied"));

        // Membership events are not acted on without media.
        h.session.handle(joined_event("p2")).await;
        assert!(h.transport.placed.lock().is_empty());
    }

    #[tokio::test]
    async fn identity_failure_alerts_and_skips_join() {
        let mut h = harness_with(
            FakeDevices {
                fail: false,
                with_video: false,
            },
            FakeTransport {
                fail_open: true,
                ..Default::default()
            },
        );
        h.session.start().await;
        assert_eq!(h.session.phase(), SessionPhase::Failed);
        assert!(h.signaling.sent.lock().is_empty());
        assert_eq!(
            h.session.view().alert.as_deref(),
            Some("Peer connection error: broker unreachable")
        );
    }

    #[tokio::test]
    async fn controls_without_media_raise_alert() {
        let mut h = harness_with(
            FakeDevices {
                fail: true,
                with_video: false,
            },
            FakeTransport::default(),
        );
        h.session.start().await;
        h.session
            .handle(SessionEvent::Command(ControlCommand::DismissAlert))
            .await;
        assert!(h.session.view().alert.is_none());

        h.session
            .handle(SessionEvent::Command(ControlCommand::ToggleRecord))
            .await;
        assert_eq!(h.session.view().alert.as_deref(), Some(MEDIA_UNAVAILABLE));
        assert_eq!(h.session.recorder().state(), crate::recorder::RecorderState::Idle);
    }

    #[tokio::test]
    async fn mute_twice_restores_audio() {
        let mut h = joined().await;
        let audio = |s: &Session| {
            s.local()
                .and_then(|l| l.first_track(TrackKind::Audio))
                .map(|t| t.is_enabled())
        };
        let before = audio(&h.session);

        h.session
            .handle(SessionEvent::Command(ControlCommand::ToggleMute))
            .await;
        assert_eq!(audio(&h.session), before.map(|b| !b));
        assert_eq!(
            h.session.view().controls.mute,
            crate::controls::ControlIcon::MicrophoneSlash
        );

        h.session
            .handle(SessionEvent::Command(ControlCommand::ToggleMute))
            .await;
        assert_eq!(audio(&h.session), before);
        assert_eq!(h.session.view().local.audio_enabled, Some(true));
    }

    #[tokio::test]
    async fn record_toggle_produces_one_artifact() {
        let mut h = joined().await;
        h.session
            .handle(SessionEvent::Command(ControlCommand::ToggleRecord))
            .await;
        assert!(h.session.view().recording);

        for chunk in ["a", "b", "c"] {
            h.session
                .handle(SessionEvent::Recorder(RecorderEvent::Data(Bytes::from(chunk))))
                .await;
        }
        h.session
            .handle(SessionEvent::Command(ControlCommand::ToggleRecord))
            .await;
        assert!(!h.session.view().recording);
        h.session
            .handle(SessionEvent::Recorder(RecorderEvent::Stopped))
            .await;

        let saved = h.saved.lock();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].file_name, RECORDING_FILE_NAME);
        assert_eq!(&saved[0].data[..], b"abc");
        assert_eq!(h.session.view().notices[0].level, NoticeLevel::Info);
    }

    #[tokio::test]
    async fn leave_closes_everything_once_and_is_terminal() {
        let mut h = joined().await;
        for peer in ["p2", "p3"] {
            h.session.handle(joined_event(peer)).await;
            let id = h.transport.call_id(peer);
            h.session.handle(track_event(id, peer, TrackKind::Audio)).await;
        }

        h.session
            .handle(SessionEvent::Command(ControlCommand::Leave))
            .await;

        assert_eq!(h.session.phase(), SessionPhase::Left);
        assert_eq!(h.transport.closed.lock().len(), 2);
        assert!(h.session.local().unwrap().is_stopped());
        assert!(h.session.peers().is_empty());
        assert_eq!(h.signaling.leaves(), 1);
        assert_eq!(
            h.signaling.sent.lock().last(),
            Some(&SignalingMessage::Leave {
                room: "abc".into(),
                username: "alice".into(),
            })
        );

        h.session.handle(joined_event("p4")).await;
        h.session.handle(left_event("p2")).await;
        h.session
            .handle(SessionEvent::Command(ControlCommand::Leave))
            .await;
        assert_eq!(h.transport.placed.lock().len(), 2);
        assert_eq!(h.signaling.leaves(), 1);
        assert!(h.session.view().participants.is_empty());
    }

    #[tokio::test]
    async fn run_stops_processing_after_leave() {
        let h = harness_with(
            FakeDevices {
                fail: false,
                with_video: false,
            },
            FakeTransport::default(),
        );
        let signaling = h.signaling.clone();
        let transport = h.transport.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(joined_event("p2")).unwrap();
        tx.send(SessionEvent::Command(ControlCommand::Leave)).unwrap();
        tx.send(joined_event("p3")).unwrap();

        run(h.session, rx).await;

        assert_eq!(transport.placed.lock().len(), 1);
        assert_eq!(signaling.leaves(), 1);
        assert_eq!(transport.closed.lock().len(), 1);
    }
}
