//! Camera capture into VP8, remote VP8 decoding, and the board of preview
//! frames the UI paints into tiles. Encoding and decoding run in an ffmpeg
//! child process; frames cross the pipes as IVF.

use anyhow::anyhow;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::{BufMut, Bytes, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::Write;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use webrtc::media::io::ivf_reader::IVFReader;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::Sample as MediaSample;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::media::LocalTrack;

/// Board key of the local camera preview.
pub const LOCAL_PREVIEW: &str = "local";
const LOCAL_OWNER: u64 = 0;

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
const CAPTURE_FPS: u32 = 30;
const PREVIEW_WIDTH: u32 = 320;
const PREVIEW_INTERVAL: Duration = Duration::from_millis(100);

const PLAYBACK_WIDTH: u32 = 320;
const PLAYBACK_HEIGHT: u32 = 240;
const PLAYBACK_FRAME_BYTES: usize = (PLAYBACK_WIDTH * PLAYBACK_HEIGHT * 3) as usize;
const VP8_CLOCK_RATE: u32 = 90_000;
// In RTP sequence numbers.
const MAX_LATE_PACKETS: u16 = 256;

const IVF_FILE_HEADER_LEN: usize = 32;
const IVF_FRAME_HEADER_LEN: usize = 12;

struct BoardInner {
    frames: RwLock<HashMap<String, (u64, Arc<str>)>>,
    tick: watch::Sender<u64>,
}

/// Latest JPEG frame per tile as a `data:` URL. Every entry is owned by the
/// pipeline that published it, so a pipeline being torn down cannot erase
/// the frame of the one that replaced it.
#[derive(Clone)]
pub struct FrameBoard {
    inner: Arc<BoardInner>,
}

impl Default for FrameBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBoard {
    pub fn new() -> Self {
        let (tick, _) = watch::channel(0);
        Self {
            inner: Arc::new(BoardInner {
                frames: RwLock::new(HashMap::new()),
                tick,
            }),
        }
    }

    pub fn publish(&self, key: &str, owner: u64, jpeg: &[u8]) {
        let url: Arc<str> = format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg)).into();
        self.inner
            .frames
            .write()
            .insert(key.to_string(), (owner, url));
        self.bump();
    }

    pub fn get(&self, key: &str) -> Option<Arc<str>> {
        self.inner.frames.read().get(key).map(|(_, url)| url.clone())
    }

    /// Removes the frame under `key` if `owner` published it.
    pub fn release(&self, key: &str, owner: u64) {
        let removed = {
            let mut frames = self.inner.frames.write();
            match frames.get(key) {
                Some((current, _)) if *current == owner => frames.remove(key).is_some(),
                _ => false,
            }
        };
        if removed {
            self.bump();
        }
    }

    /// Changes whenever a frame is published or removed.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.tick.subscribe()
    }

    fn bump(&self) {
        self.inner.tick.send_modify(|tick| *tick = tick.wrapping_add(1));
    }
}

/// Packed RGB24 to a JPEG no wider than the preview width.
fn preview_jpeg(rgb: Vec<u8>, width: u32, height: u32) -> Result<Vec<u8>> {
    let image = RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| Error::Media(format!("frame is not {}x{} RGB", width, height)))?;
    let image = if width > PREVIEW_WIDTH {
        let scaled_height = (height * PREVIEW_WIDTH / width).max(1);
        image::imageops::thumbnail(&image, PREVIEW_WIDTH, scaled_height)
    } else {
        image
    };

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, 70)
        .encode_image(&image)
        .map_err(|e| Error::Media(format!("jpeg encoding failed: {}", e)))?;
    Ok(jpeg)
}

fn ivf_file_header(width: u16, height: u16) -> Bytes {
    let mut header = BytesMut::with_capacity(IVF_FILE_HEADER_LEN);
    header.put_slice(b"DKIF");
    header.put_u16_le(0);
    header.put_u16_le(IVF_FILE_HEADER_LEN as u16);
    header.put_slice(b"VP80");
    header.put_u16_le(width);
    header.put_u16_le(height);
    // Timebase 1/30; the decoder only needs increasing timestamps.
    header.put_u32_le(30);
    header.put_u32_le(1);
    header.put_u32_le(0);
    header.put_u32_le(0);
    header.freeze()
}

fn ivf_frame_header(len: usize, timestamp: u64) -> Bytes {
    let mut header = BytesMut::with_capacity(IVF_FRAME_HEADER_LEN);
    header.put_u32_le(len as u32);
    header.put_u64_le(timestamp);
    header.freeze()
}

fn encoder_args(width: u32, height: u32, fps: u32) -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "rawvideo",
        "-pixel_format",
        "rgb24",
        "-video_size",
        &format!("{width}x{height}"),
        "-framerate",
        &fps.to_string(),
        "-i",
        "-",
        "-c:v",
        "libvpx",
        "-deadline",
        "realtime",
        "-cpu-used",
        "8",
        "-b:v",
        "600k",
        "-g",
        &(fps * 2).to_string(),
        "-auto-alt-ref",
        "0",
        "-pix_fmt",
        "yuv420p",
        "-f",
        "ivf",
        "-",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

fn decoder_args() -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "ivf",
        "-i",
        "-",
        "-vf",
        &format!("scale={PLAYBACK_WIDTH}:{PLAYBACK_HEIGHT}"),
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgb24",
        "-",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

pub struct VideoCapture;

impl VideoCapture {
    /// Opens the default camera on its own thread and pumps VP8 frames into
    /// the track until it is stopped. A disabled track sends black frames
    /// and clears the local preview.
    pub async fn start(track: LocalTrack, ffmpeg: &str, frames: FrameBoard) -> Result<()> {
        let (sample_tx, mut sample_rx) = mpsc::unbounded_channel::<Bytes>();
        let (ready_tx, ready_rx) = oneshot::channel::<std::result::Result<u32, String>>();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        track.on_stop(stop_tx);

        let enabled = track.enabled_flag();
        let ffmpeg = ffmpeg.to_string();
        std::thread::Builder::new()
            .name("video-capture".into())
            .spawn(move || {
                let mut pipeline = match CameraPipeline::open(&ffmpeg, sample_tx) {
                    Ok(pipeline) => pipeline,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(pipeline.fps));
                pipeline.run(stop_rx, &enabled, &frames);
                pipeline.finish();
                frames.release(LOCAL_PREVIEW, LOCAL_OWNER);
                tracing::debug!("video capture released");
            })?;

        let fps = match ready_rx.await {
            Ok(Ok(fps)) => fps,
            Ok(Err(reason)) => return Err(Error::MediaAccessDenied(reason)),
            Err(_) => {
                return Err(Error::MediaAccessDenied(
                    "video capture thread exited".to_string(),
                ))
            }
        };

        let duration = Duration::from_secs(1) / fps.max(1);
        let rtc = track.rtc();
        tokio::spawn(async move {
            while let Some(frame) = sample_rx.recv().await {
                let sample = MediaSample {
                    data: frame,
                    duration,
                    ..Default::default()
                };
                if let Err(e) = rtc.write_sample(&sample).await {
                    tracing::trace!("dropping video frame: {}", e);
                }
            }
        });

        Ok(())
    }
}

struct CameraPipeline {
    camera: Camera,
    encoder: Child,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
    fps: u32,
}

impl CameraPipeline {
    fn open(ffmpeg: &str, sample_tx: mpsc::UnboundedSender<Bytes>) -> anyhow::Result<Self> {
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new_from(CAPTURE_WIDTH, CAPTURE_HEIGHT, FrameFormat::MJPEG, CAPTURE_FPS),
        ));
        let mut camera = Camera::new(CameraIndex::Index(0), requested)
            .map_err(|e| anyhow!("No camera available: {}", e))?;
        camera
            .open_stream()
            .map_err(|e| anyhow!("Failed to open camera stream: {}", e))?;

        let format = camera.camera_format();
        let width = format.resolution().width();
        let height = format.resolution().height();
        let fps = format.frame_rate().max(1);
        tracing::info!(
            "Camera opened: {}x{} @ {}fps, format={:?}",
            width,
            height,
            fps,
            format.format()
        );

        let spawned = Command::new(ffmpeg)
            .args(encoder_args(width, height, fps))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();
        let mut encoder = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = camera.stop_stream();
                return Err(anyhow!("Failed to start video encoder {}: {}", ffmpeg, e));
            }
        };

        let (Some(stdin), Some(stdout)) = (encoder.stdin.take(), encoder.stdout.take()) else {
            let _ = camera.stop_stream();
            let _ = encoder.kill();
            return Err(anyhow!("video encoder pipes unavailable"));
        };
        std::thread::Builder::new()
            .name("video-encoder".into())
            .spawn(move || read_encoded(stdout, sample_tx))?;

        Ok(Self {
            camera,
            encoder,
            stdin: Some(stdin),
            width,
            height,
            fps,
        })
    }

    fn run(&mut self, mut stop_rx: oneshot::Receiver<()>, enabled: &AtomicBool, frames: &FrameBoard) {
        let frame_len = (self.width * self.height * 3) as usize;
        let black = vec![0u8; frame_len];
        let mut last_preview: Option<Instant> = None;

        while matches!(stop_rx.try_recv(), Err(TryRecvError::Empty)) {
            let rgb = match self
                .camera
                .frame()
                .and_then(|frame| frame.decode_image::<RgbFormat>())
            {
                Ok(image) => image.into_raw(),
                Err(e) => {
                    tracing::debug!("Failed to capture frame: {:?}", e);
                    continue;
                }
            };
            if rgb.len() != frame_len {
                tracing::debug!("camera frame of {} bytes, expected {}", rgb.len(), frame_len);
                continue;
            }

            let on = enabled.load(Ordering::SeqCst);
            if !self.write_frame(if on { &rgb } else { &black }) {
                tracing::warn!("video encoder exited, stopping capture");
                break;
            }

            if !on {
                frames.release(LOCAL_PREVIEW, LOCAL_OWNER);
                last_preview = None;
                continue;
            }
            if last_preview.map_or(true, |at| at.elapsed() >= PREVIEW_INTERVAL) {
                last_preview = Some(Instant::now());
                match preview_jpeg(rgb, self.width, self.height) {
                    Ok(jpeg) => frames.publish(LOCAL_PREVIEW, LOCAL_OWNER, &jpeg),
                    Err(e) => tracing::debug!("no local preview: {}", e),
                }
            }
        }
    }

    fn write_frame(&mut self, data: &[u8]) -> bool {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(data).is_ok(),
            None => false,
        }
    }

    fn finish(mut self) {
        if let Err(e) = self.camera.stop_stream() {
            tracing::warn!("Error stopping camera stream: {:?}", e);
        }
        // EOF lets the encoder flush and exit.
        drop(self.stdin.take());
        match self.encoder.wait() {
            Ok(status) if !status.success() => {
                tracing::debug!("video encoder exited with {}", status)
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("failed to reap video encoder: {}", e),
        }
    }
}

fn read_encoded(stdout: ChildStdout, sample_tx: mpsc::UnboundedSender<Bytes>) {
    let mut reader = match IVFReader::new(stdout) {
        Ok((reader, header)) => {
            tracing::debug!("encoder stream {}x{}", header.width, header.height);
            reader
        }
        Err(e) => {
            tracing::debug!("video encoder produced no stream: {}", e);
            return;
        }
    };
    while let Ok((frame, _)) = reader.parse_next_frame() {
        if sample_tx.send(frame.freeze()).is_err() {
            break;
        }
    }
}

/// Decodes a remote VP8 track and publishes its frames under `key`.
/// Dropping it stops decoding and clears the tile.
pub struct VideoPlayback {
    running: Arc<AtomicBool>,
    frames: FrameBoard,
    key: String,
    owner: u64,
}

impl VideoPlayback {
    pub fn start(
        track: Arc<TrackRemote>,
        key: &str,
        owner: u64,
        ffmpeg: &str,
        frames: FrameBoard,
    ) -> Result<Self> {
        let mut decoder = tokio::process::Command::new(ffmpeg)
            .args(decoder_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let (Some(mut stdin), Some(mut stdout)) = (decoder.stdin.take(), decoder.stdout.take())
        else {
            return Err(Error::Media("video decoder pipes unavailable".to_string()));
        };
        let running = Arc::new(AtomicBool::new(true));

        let reader_running = running.clone();
        tokio::spawn(async move {
            // Killed when this task ends.
            let _decoder = decoder;
            let mut builder =
                SampleBuilder::new(MAX_LATE_PACKETS, Vp8Packet::default(), VP8_CLOCK_RATE);
            let header = ivf_file_header(PLAYBACK_WIDTH as u16, PLAYBACK_HEIGHT as u16);
            if stdin.write_all(&header).await.is_err() {
                return;
            }

            let mut count: u64 = 0;
            'read: while reader_running.load(Ordering::SeqCst) {
                let Ok((rtp, _)) = track.read_rtp().await else {
                    break;
                };
                builder.push(rtp);
                while let Some(sample) = builder.pop() {
                    let header = ivf_frame_header(sample.data.len(), count);
                    count += 1;
                    if stdin.write_all(&header).await.is_err()
                        || stdin.write_all(&sample.data).await.is_err()
                    {
                        break 'read;
                    }
                }
            }
        });

        let board = frames.clone();
        let tile = key.to_string();
        tokio::spawn(async move {
            let mut frame = vec![0u8; PLAYBACK_FRAME_BYTES];
            let mut last_preview: Option<Instant> = None;
            while stdout.read_exact(&mut frame).await.is_ok() {
                if last_preview.map_or(false, |at| at.elapsed() < PREVIEW_INTERVAL) {
                    continue;
                }
                last_preview = Some(Instant::now());
                match preview_jpeg(frame.clone(), PLAYBACK_WIDTH, PLAYBACK_HEIGHT) {
                    Ok(jpeg) => board.publish(&tile, owner, &jpeg),
                    Err(e) => tracing::debug!("dropping frame from {}: {}", tile, e),
                }
            }
            board.release(&tile, owner);
        });

        Ok(Self {
            running,
            frames,
            key: key.to_string(),
            owner,
        })
    }
}

impl Drop for VideoPlayback {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.frames.release(&self.key, self.owner);
    }
}
