use crate::media::{LocalMediaStream, TrackKind};

pub const MEDIA_UNAVAILABLE: &str =
    "Camera and microphone not available. Please allow permissions and refresh the page.";

/// Buttons on the room's control bar, plus dismissing the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    ToggleMute,
    ToggleVideo,
    ToggleRecord,
    Leave,
    DismissAlert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlIcon {
    Microphone,
    MicrophoneSlash,
    Video,
    VideoSlash,
    RecordVinyl,
    Stop,
}

impl ControlIcon {
    pub fn name(self) -> &'static str {
        match self {
            ControlIcon::Microphone => "microphone",
            ControlIcon::MicrophoneSlash => "microphone-slash",
            ControlIcon::Video => "video",
            ControlIcon::VideoSlash => "video-slash",
            ControlIcon::RecordVinyl => "record-vinyl",
            ControlIcon::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBarView {
    pub mute: ControlIcon,
    pub video: ControlIcon,
    pub record: ControlIcon,
}

impl Default for ControlBarView {
    fn default() -> Self {
        Self {
            mute: ControlIcon::Microphone,
            video: ControlIcon::Video,
            record: ControlIcon::RecordVinyl,
        }
    }
}

impl ControlBarView {
    /// Icons follow the tracks: a missing track shows the "on" icon, as the
    /// button would not change anything.
    pub fn from_state(local: Option<&LocalMediaStream>, recording: bool) -> Self {
        let enabled = |kind| {
            local
                .and_then(|s| s.first_track(kind))
                .map_or(true, |t| t.is_enabled())
        };
        Self {
            mute: if enabled(TrackKind::Audio) {
                ControlIcon::Microphone
            } else {
                ControlIcon::MicrophoneSlash
            },
            video: if enabled(TrackKind::Video) {
                ControlIcon::Video
            } else {
                ControlIcon::VideoSlash
            },
            record: if recording {
                ControlIcon::Stop
            } else {
                ControlIcon::RecordVinyl
            },
        }
    }
}

/// Flips the first track of `kind`. Returns the new enabled state, or `None`
/// when the stream has no such track.
pub fn toggle_track(stream: &LocalMediaStream, kind: TrackKind) -> Option<bool> {
    let track = stream.first_track(kind)?;
    let enabled = !track.is_enabled();
    track.set_enabled(enabled);
    tracing::info!("{} track {}", kind, if enabled { "enabled" } else { "disabled" });
    Some(enabled)
}
