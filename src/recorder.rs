//! Local recording: buffers encoded chunks between start and stop and hands
//! the concatenation to an artifact sink as a single WebM file.

use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;

use crate::audio::PCM_SAMPLE_RATE;
use crate::error::{Error, Result};
use crate::media::LocalMediaStream;

pub const RECORDING_FILE_NAME: &str = "conference_recording.webm";
pub const RECORDING_MIME_TYPE: &str = "video/webm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecorderState {
    #[default]
    Idle,
    Recording,
    /// Stop was requested; waiting for the backend's last chunk.
    Finalizing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    Data(Bytes),
    /// Emitted once, after the last `Data`.
    Stopped,
}

pub type RecorderSink = Arc<dyn Fn(RecorderEvent) + Send + Sync>;

/// Produces encoded chunks for a stream.
pub trait RecordingBackend: Send {
    fn start(&mut self, stream: &LocalMediaStream, sink: RecorderSink) -> Result<()>;

    /// Asks the backend to flush. It must follow up with
    /// [`RecorderEvent::Stopped`].
    fn stop(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingArtifact {
    pub file_name: String,
    pub mime_type: &'static str,
    pub data: Bytes,
}

/// Where finished recordings are delivered.
pub trait ArtifactSink: Send {
    fn save(&self, artifact: &RecordingArtifact) -> Result<PathBuf>;
}

pub struct Recorder {
    backend: Box<dyn RecordingBackend>,
    artifacts: Box<dyn ArtifactSink>,
    events: RecorderSink,
    state: RecorderState,
    chunks: Vec<Bytes>,
}

impl Recorder {
    pub fn new(
        backend: Box<dyn RecordingBackend>,
        artifacts: Box<dyn ArtifactSink>,
        events: RecorderSink,
    ) -> Self {
        Self {
            backend,
            artifacts,
            events,
            state: RecorderState::Idle,
            chunks: Vec::new(),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecorderState::Recording
    }

    pub fn buffered(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Returns whether a recording was started. Without a stream, or while
    /// busy, nothing happens.
    pub fn start(&mut self, stream: Option<&LocalMediaStream>) -> Result<bool> {
        let Some(stream) = stream else {
            return Ok(false);
        };
        if self.state != RecorderState::Idle {
            return Ok(false);
        }

        self.chunks.clear();
        self.backend.start(stream, self.events.clone())?;
        self.state = RecorderState::Recording;
        tracing::info!("Recording started");
        Ok(true)
    }

    pub fn on_data(&mut self, chunk: Bytes) {
        if self.state == RecorderState::Idle || chunk.is_empty() {
            return;
        }
        self.chunks.push(chunk);
    }

    /// Returns whether a stop was requested.
    pub fn stop(&mut self) -> bool {
        if self.state != RecorderState::Recording {
            return false;
        }
        self.state = RecorderState::Finalizing;
        self.backend.stop();
        tracing::info!("Stopping recording");
        true
    }

    /// Assembles the buffered chunks once the backend is done. Returns the
    /// saved file, or `None` when nothing was being recorded.
    pub fn on_stopped(&mut self) -> Result<Option<PathBuf>> {
        if self.state == RecorderState::Idle {
            return Ok(None);
        }
        self.state = RecorderState::Idle;

        let chunks = std::mem::take(&mut self.chunks);
        let total: usize = chunks.iter().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(total);
        for chunk in &chunks {
            data.extend_from_slice(chunk);
        }

        let artifact = RecordingArtifact {
            file_name: RECORDING_FILE_NAME.to_string(),
            mime_type: RECORDING_MIME_TYPE,
            data: data.freeze(),
        };
        let path = self.artifacts.save(&artifact)?;
        tracing::info!(
            "Recording stopped. {} chunks, {} bytes saved to {}",
            chunks.len(),
            total,
            path.display()
        );
        Ok(Some(path))
    }
}

/// Saves recordings into a directory the way a browser download would: a
/// name collision gets a ` (n)` suffix.
pub struct DownloadSink {
    dir: PathBuf,
}

impl DownloadSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn free_path(&self, file_name: &str) -> PathBuf {
        let candidate = self.dir.join(file_name);
        if !candidate.exists() {
            return candidate;
        }
        let path = Path::new(file_name);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        (1..)
            .map(|n| self.dir.join(format!("{} ({}){}", stem, n, ext)))
            .find(|p| !p.exists())
            .unwrap_or(candidate)
    }
}

impl ArtifactSink for DownloadSink {
    fn save(&self, artifact: &RecordingArtifact) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.free_path(&artifact.file_name);
        std::fs::write(&path, &artifact.data)?;
        Ok(path)
    }
}

/// Encodes the local audio tap to Opus-in-WebM with an ffmpeg child process.
pub struct FfmpegRecorder {
    ffmpeg: String,
    stop: Option<oneshot::Sender<()>>,
}

impl FfmpegRecorder {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            stop: None,
        }
    }

    fn args() -> Vec<String> {
        let rate = PCM_SAMPLE_RATE.to_string();
        [
            "-hide_banner", "-loglevel", "error",
            "-f", "s16le", "-ar", rate.as_str(), "-ac", "1", "-i", "pipe:0",
            "-c:a", "libopus", "-f", "webm", "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

impl RecordingBackend for FfmpegRecorder {
    fn start(&mut self, stream: &LocalMediaStream, sink: RecorderSink) -> Result<()> {
        let mut audio = stream
            .subscribe_audio()
            .ok_or_else(|| Error::Recording("the local stream has no audio to record".into()))?;

        let mut child = Command::new(&self.ffmpeg)
            .args(Self::args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Recording(format!("failed to start {}: {}", self.ffmpeg, e)))?;

        let (Some(mut stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(Error::Recording("ffmpeg pipes unavailable".into()));
        };

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        self.stop = Some(stop_tx);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    frame = audio.recv() => match frame {
                        Ok(frame) => {
                            if stdin.write_all(&frame).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("recorder fell behind, {} audio frames lost", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            // Closing stdin lets ffmpeg finish the container.
            let _ = stdin.shutdown().await;
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => sink(RecorderEvent::Data(Bytes::copy_from_slice(&buf[..n]))),
                    Err(e) => {
                        tracing::warn!("reading encoder output failed: {}", e);
                        break;
                    }
                }
            }
            match child.wait().await {
                Ok(status) if !status.success() => {
                    tracing::warn!("ffmpeg exited with {}", status)
                }
                Err(e) => tracing::warn!("waiting for ffmpeg failed: {}", e),
                _ => {}
            }
            sink(RecorderEvent::Stopped);
        });

        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalTrack, TrackKind};
    use parking_lot::Mutex;
    use tokio::sync::broadcast;

    #[derive(Clone, Default)]
    struct Calls {
        starts: Arc<Mutex<usize>>,
        stops: Arc<Mutex<usize>>,
        saved: Arc<Mutex<Vec<RecordingArtifact>>>,
    }

    struct FakeBackend(Calls);

    impl RecordingBackend for FakeBackend {
        fn start(&mut self, _: &LocalMediaStream, _: RecorderSink) -> Result<()> {
            *self.0.starts.lock() += 1;
            Ok(())
        }

        fn stop(&mut self) {
            *self.0.stops.lock() += 1;
        }
    }

    struct MemorySink(Calls);

    impl ArtifactSink for MemorySink {
        fn save(&self, artifact: &RecordingArtifact) -> Result<PathBuf> {
            self.0.saved.lock().push(artifact.clone());
            Ok(PathBuf::from(&artifact.file_name))
        }
    }

    fn recorder() -> (Recorder, Calls) {
        let calls = Calls::default();
        let recorder = Recorder::new(
            Box::new(FakeBackend(calls.clone())),
            Box::new(MemorySink(calls.clone())),
            Arc::new(|_: RecorderEvent| {}),
        );
        (recorder, calls)
    }

    fn stream() -> LocalMediaStream {
        LocalMediaStream::new("s", vec![LocalTrack::new(TrackKind::Audio, "s")])
    }

    #[test]
    fn n_chunks_become_one_artifact_in_order() {
        let (mut recorder, calls) = recorder();
        assert!(recorder.start(Some(&stream())).unwrap());
        for chunk in ["one", "", "two", "three"] {
            recorder.on_data(Bytes::from(chunk));
        }
        assert!(recorder.stop());
        // Trailing chunk flushed by the encoder after the stop request.
        recorder.on_data(Bytes::from("four"));
        let path = recorder.on_stopped().unwrap().unwrap();

        assert_eq!(path, PathBuf::from("conference_recording.webm"));
        let saved = calls.saved.lock();
        assert_eq!(saved.len(), 1);
        assert_eq!(&saved[0].data[..], b"onetwothreefour");
        assert_eq!(saved[0].mime_type, "video/webm");
        assert!(recorder.buffered().is_empty());
        assert_eq!(recorder.state(), RecorderState::Idle);
    }

    #[test]
    fn stop_when_idle_is_noop() {
        let (mut recorder, calls) = recorder();
        assert!(!recorder.stop());
        assert!(recorder.on_stopped().unwrap().is_none());
        assert_eq!(*calls.stops.lock(), 0);
        assert!(calls.saved.lock().is_empty());
        assert!(recorder.buffered().is_empty());
    }

    #[test]
    fn start_without_stream_stays_idle() {
        let (mut recorder, calls) = recorder();
        assert!(!recorder.start(None).unwrap());
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert_eq!(*calls.starts.lock(), 0);
    }

    #[test]
    fn start_while_recording_is_noop_and_restart_clears_buffer() {
        let (mut recorder, calls) = recorder();
        let stream = stream();
        recorder.start(Some(&stream)).unwrap();
        recorder.on_data(Bytes::from("a"));
        assert!(!recorder.start(Some(&stream)).unwrap());
        assert_eq!(recorder.buffered().len(), 1);
        assert_eq!(*calls.starts.lock(), 1);

        recorder.stop();
        recorder.on_stopped().unwrap();
        recorder.start(Some(&stream)).unwrap();
        recorder.on_data(Bytes::from("b"));
        recorder.stop();
        recorder.on_stopped().unwrap();

        let saved = calls.saved.lock();
        assert_eq!(&saved[1].data[..], b"b");
    }

    #[test]
    fn download_sink_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DownloadSink::new(dir.path());
        let artifact = RecordingArtifact {
            file_name: RECORDING_FILE_NAME.to_string(),
            mime_type: RECORDING_MIME_TYPE,
            data: Bytes::from_static(b"webm"),
        };

        let first = sink.save(&artifact).unwrap();
        let second = sink.save(&artifact).unwrap();

        assert_eq!(first, dir.path().join("conference_recording.webm"));
        assert_eq!(second, dir.path().join("conference_recording (1).webm"));
        assert_eq!(std::fs::read(second).unwrap(), b"webm");
    }

    #[tokio::test]
    async fn missing_ffmpeg_is_a_recording_error() {
        let calls = Calls::default();
        let mut recorder = Recorder::new(
            Box::new(FfmpegRecorder::new("/nonexistent/ffmpeg")),
            Box::new(MemorySink(calls)),
            Arc::new(|_: RecorderEvent| {}),
        );
        let (tap, _) = broadcast::channel(4);
        let stream = stream().with_audio_tap(tap);

        let err = recorder.start(Some(&stream)).unwrap_err();
        assert!(matches!(err, Error::Recording(_)));
        assert_eq!(recorder.state(), RecorderState::Idle);
    }

    #[test]
    fn ffmpeg_needs_an_audio_tap() {
        let mut backend = FfmpegRecorder::new("ffmpeg");
        let err = backend.start(&stream(), Arc::new(|_: RecorderEvent| {})).unwrap_err();
        assert!(matches!(err, Error::Recording(_)));
    }
}
