use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::audio::AudioCapture;
use crate::error::{Error, Result};
use crate::media::{LocalMediaStream, LocalTrack, MediaConstraints, MediaDevices, TrackKind};
use crate::video::{FrameBoard, VideoCapture};

/// The desktop's microphone (cpal) and default camera (nokhwa, encoded
/// through ffmpeg). A camera that fails to open next to a working
/// microphone leaves an audio-only stream.
#[derive(Clone)]
pub struct DesktopDevices {
    ffmpeg_path: String,
    frames: FrameBoard,
}

impl DesktopDevices {
    pub fn new(ffmpeg_path: impl Into<String>, frames: FrameBoard) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            frames,
        }
    }
}

#[async_trait]
impl MediaDevices for DesktopDevices {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalMediaStream> {
        if !constraints.audio && !constraints.video {
            return Err(Error::MediaAccessDenied("no media requested".to_string()));
        }

        let stream_id = uuid::Uuid::new_v4().to_string();
        let mut tracks = Vec::new();
        let mut audio_tap = None;

        if constraints.audio {
            let track = LocalTrack::new(TrackKind::Audio, &stream_id);
            let (tap, _) = broadcast::channel(64);
            AudioCapture::start(track.clone(), tap.clone()).await?;
            tracks.push(track);
            audio_tap = Some(tap);
        }

        if constraints.video {
            let track = LocalTrack::new(TrackKind::Video, &stream_id);
            match VideoCapture::start(track.clone(), &self.ffmpeg_path, self.frames.clone()).await
            {
                Ok(()) => tracks.push(track),
                Err(e) if !tracks.is_empty() => {
                    tracing::warn!("camera unavailable, continuing with audio only: {}", e)
                }
                Err(e) => return Err(e),
            }
        }

        let stream = LocalMediaStream::new(stream_id, tracks);
        Ok(match audio_tap {
            Some(tap) => stream.with_audio_tap(tap),
            None => stream,
        })
    }
}
