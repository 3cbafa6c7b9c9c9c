//! Local media: the stream the session owns for the whole room visit, its
//! tracks, and the seam used to acquire it from the platform.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// What the acquirer is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    stopped: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
    stop_signal: Mutex<Option<oneshot::Sender<()>>>,
}

/// A captured local track. Clones share state, so toggling one clone is seen
/// by the capture loop and by every peer connection sending it.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind, uuid::Uuid::new_v4());
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: 8000,
                channels: 1,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_id.to_owned(),
        ));

        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                enabled: Arc::new(AtomicBool::new(true)),
                stopped: AtomicBool::new(false),
                rtc,
                stop_signal: Mutex::new(None),
            }),
        }
    }

    /// Registers the signal fired when the track is stopped; the capture
    /// backend releases its device on it.
    pub fn on_stop(&self, signal: oneshot::Sender<()>) {
        *self.inner.stop_signal.lock() = Some(signal);
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn enabled_flag(&self) -> Arc<AtomicBool> {
        self.inner.enabled.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(signal) = self.inner.stop_signal.lock().take() {
            let _ = signal.send(());
        }
        tracing::debug!(track = %self.inner.id, "local track stopped");
    }

    pub fn rtc(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.rtc.clone()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Mono s16le PCM at [`crate::audio::PCM_SAMPLE_RATE`], as published on the
/// audio tap.
pub type PcmFrame = Bytes;

#[derive(Debug, Clone)]
pub struct LocalMediaStream {
    id: String,
    tracks: Vec<LocalTrack>,
    audio_tap: Option<broadcast::Sender<PcmFrame>>,
}

impl LocalMediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
            audio_tap: None,
        }
    }

    pub fn with_audio_tap(mut self, tap: broadcast::Sender<PcmFrame>) -> Self {
        self.audio_tap = Some(tap);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn first_track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    /// Raw PCM of the local audio, if the backend publishes one.
    pub fn subscribe_audio(&self) -> Option<broadcast::Receiver<PcmFrame>> {
        self.audio_tap.as_ref().map(|tap| tap.subscribe())
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(LocalTrack::is_stopped)
    }
}

/// Platform access to cameras and microphones.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalMediaStream>;
}
