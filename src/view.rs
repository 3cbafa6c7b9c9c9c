//! What the room screen shows, derived from session state after every
//! change. Nothing here is stored independently of the peer table.

use crate::connection::PeerTable;
use crate::controls::ControlBarView;
use crate::media::{LocalMediaStream, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Starting,
    Joined,
    /// Setup stopped on a blocking error; the room stays open but inert.
    Failed,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalPreview {
    pub available: bool,
    /// `None` when the stream has no track of that kind.
    pub audio_enabled: Option<bool>,
    pub video_enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTile {
    pub peer_id: String,
    pub has_audio: bool,
    pub has_video: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ViewModel {
    pub room: String,
    pub phase: SessionPhase,
    pub local: LocalPreview,
    pub tiles: Vec<RemoteTile>,
    pub participants: Vec<String>,
    pub controls: ControlBarView,
    pub recording: bool,
    pub notices: Vec<Notice>,
    pub alert: Option<String>,
}

pub struct RenderInput<'a> {
    pub room: &'a str,
    pub phase: SessionPhase,
    pub peers: &'a PeerTable,
    pub local: Option<&'a LocalMediaStream>,
    pub recording: bool,
    pub notices: &'a [Notice],
    pub alert: Option<&'a str>,
}

pub fn render(input: RenderInput<'_>) -> ViewModel {
    let tiles: Vec<RemoteTile> = input
        .peers
        .connected()
        .into_iter()
        .map(|(peer_id, entry)| RemoteTile {
            peer_id: peer_id.to_string(),
            has_audio: entry.tracks.iter().any(|t| t.kind == TrackKind::Audio),
            has_video: entry.tracks.iter().any(|t| t.kind == TrackKind::Video),
        })
        .collect();
    let participants = tiles.iter().map(|t| t.peer_id.clone()).collect();

    let local = match input.local {
        Some(stream) => LocalPreview {
            available: true,
            audio_enabled: stream.first_track(TrackKind::Audio).map(|t| t.is_enabled()),
            video_enabled: stream.first_track(TrackKind::Video).map(|t| t.is_enabled()),
        },
        None => LocalPreview::default(),
    };

    ViewModel {
        room: input.room.to_string(),
        phase: input.phase,
        local,
        tiles,
        participants,
        controls: ControlBarView::from_state(input.local, input.recording),
        recording: input.recording,
        notices: input.notices.to_vec(),
        alert: input.alert.map(String::from),
    }
}
