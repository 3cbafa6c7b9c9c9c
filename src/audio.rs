use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use webrtc::media::Sample as MediaSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::media::{LocalTrack, PcmFrame};

/// Rate of everything that goes over the wire and into the recorder.
pub const PCM_SAMPLE_RATE: u32 = 8000;
const FRAME_SAMPLES: usize = 160;
const FRAME_DURATION: Duration = Duration::from_millis(20);
// About one second of playback at 48 kHz.
const MAX_PLAYBACK_BUFFER: usize = 48_000;

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    if pcm > ULAW_CLIP {
        pcm = ULAW_CLIP;
    }
    pcm += ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let exponent = ((u >> 4) & 0x07) as i32;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Mono sinc resampler over arbitrary-length input. Samples are buffered
/// until the next fixed-size chunk is complete.
pub struct MonoResampler {
    inner: SincFixedIn<f32>,
    input: Vec<f32>,
}

impl MonoResampler {
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        let parameters = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let ratio = to_rate as f64 / from_rate.max(1) as f64;
        let inner = SincFixedIn::<f32>::new(ratio, 2.0, parameters, chunk_size.max(1), 1)
            .map_err(|e| Error::Media(format!("failed to create resampler: {}", e)))?;

        Ok(Self {
            inner,
            input: Vec::with_capacity(chunk_size * 2),
        })
    }

    /// Appends whatever full chunks `samples` completes to `out`.
    pub fn process(&mut self, samples: &[f32], out: &mut Vec<f32>) -> Result<()> {
        self.input.extend_from_slice(samples);
        loop {
            let needed = self.inner.input_frames_next();
            if self.input.len() < needed {
                return Ok(());
            }
            let chunk: Vec<f32> = self.input.drain(..needed).collect();
            let resampled = self
                .inner
                .process(&[chunk], None)
                .map_err(|e| Error::Media(format!("resampling failed: {}", e)))?;
            out.extend_from_slice(&resampled[0]);
        }
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn pcm_bytes(samples: &[i16]) -> PcmFrame {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for s in samples {
        buf.put_i16_le(*s);
    }
    buf.freeze()
}

pub struct AudioCapture;

impl AudioCapture {
    /// Opens the default input device on its own thread (cpal streams are not
    /// `Send`) and pumps 20 ms PCMU frames into the track until it is
    /// stopped.
    pub async fn start(track: LocalTrack, tap: broadcast::Sender<PcmFrame>) -> Result<()> {
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Vec<i16>>();
        let (ready_tx, ready_rx) = oneshot::channel::<std::result::Result<(), String>>();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        track.on_stop(stop_tx);

        std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream = match Self::open_input(frame_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.blocking_recv();
                drop(stream);
                tracing::debug!("audio capture released");
            })?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(Error::MediaAccessDenied(reason)),
            Err(_) => {
                return Err(Error::MediaAccessDenied(
                    "audio capture thread exited".to_string(),
                ))
            }
        }

        let enabled = track.enabled_flag();
        let rtc = track.rtc();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let frame = if enabled.load(Ordering::SeqCst) {
                    frame
                } else {
                    vec![0; frame.len()]
                };
                let _ = tap.send(pcm_bytes(&frame));

                let encoded: Bytes = frame.iter().map(|s| linear_to_ulaw(*s)).collect();
                let sample = MediaSample {
                    data: encoded,
                    duration: FRAME_DURATION,
                    ..Default::default()
                };
                if let Err(e) = rtc.write_sample(&sample).await {
                    tracing::trace!("dropping audio frame: {}", e);
                }
            }
        });

        Ok(())
    }

    fn open_input(frame_tx: mpsc::UnboundedSender<Vec<i16>>) -> anyhow::Result<cpal::Stream> {
        let host = cpal::default_host();
        let input_device = host
            .default_input_device()
            .ok_or_else(|| anyhow!("No input device available"))?;

        let config = input_device.default_input_config()?;
        tracing::info!("Input config: {:?}", config);

        let stream = match config.sample_format() {
            SampleFormat::F32 => {
                Self::build_input_stream::<f32>(&input_device, &config.into(), frame_tx)?
            }
            SampleFormat::I16 => {
                Self::build_input_stream::<i16>(&input_device, &config.into(), frame_tx)?
            }
            SampleFormat::U16 => {
                Self::build_input_stream::<u16>(&input_device, &config.into(), frame_tx)?
            }
            sample_format => {
                return Err(anyhow!("Unsupported sample format: {:?}", sample_format))
            }
        };

        Ok(stream)
    }

    fn build_input_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        frame_tx: mpsc::UnboundedSender<Vec<i16>>,
    ) -> anyhow::Result<cpal::Stream>
    where
        T: SizedSample + Sample + Send + 'static,
        f32: FromSample<T>,
    {
        let channels = config.channels.max(1) as usize;
        let input_rate = config.sample_rate.0;
        // 10 ms chunks at the device rate.
        let mut resampler =
            MonoResampler::new(input_rate, PCM_SAMPLE_RATE, (input_rate / 100) as usize)?;
        let mut mono: Vec<f32> = Vec::new();
        let mut resampled: Vec<f32> = Vec::new();
        let mut pending: Vec<i16> = Vec::with_capacity(FRAME_SAMPLES * 2);

        let err_fn = |err| tracing::error!("An error occurred on the input audio stream: {}", err);

        let stream = device.build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.chunks(channels).map(|frame| {
                    let sum: f32 = frame.iter().map(|s| s.to_sample::<f32>()).sum();
                    sum / frame.len() as f32
                }));
                resampled.clear();
                if let Err(e) = resampler.process(&mono, &mut resampled) {
                    tracing::trace!("dropping captured audio: {}", e);
                    return;
                }
                pending.extend(resampled.iter().map(|s| to_i16(*s)));
                while pending.len() >= FRAME_SAMPLES {
                    let frame: Vec<i16> = pending.drain(..FRAME_SAMPLES).collect();
                    if frame_tx.send(frame).is_err() {
                        return;
                    }
                }
            },
            err_fn,
            None,
        )?;

        Ok(stream)
    }
}

/// Plays a remote PCMU track on the default output device. Dropping it
/// releases the device.
pub struct AudioPlayback {
    stop: Option<oneshot::Sender<()>>,
    running: Arc<AtomicBool>,
}

impl AudioPlayback {
    pub fn start(track: Arc<TrackRemote>) -> Result<Self> {
        let buffer: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(VecDeque::new()));
        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (rate_tx, rate_rx) = oneshot::channel::<u32>();

        let output_buffer = buffer.clone();
        std::thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || {
                let (stream, rate) = match Self::open_output(output_buffer) {
                    Ok(opened) => opened,
                    Err(e) => {
                        tracing::warn!("remote audio playback unavailable: {}", e);
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    tracing::warn!("remote audio playback unavailable: {}", e);
                    return;
                }
                let _ = rate_tx.send(rate);
                let _ = stop_rx.blocking_recv();
                drop(stream);
            })?;

        let reader_running = running.clone();
        tokio::spawn(async move {
            let Ok(output_rate) = rate_rx.await else {
                return;
            };
            let mut resampler =
                match MonoResampler::new(PCM_SAMPLE_RATE, output_rate, FRAME_SAMPLES) {
                    Ok(resampler) => resampler,
                    Err(e) => {
                        tracing::warn!("remote audio playback unavailable: {}", e);
                        return;
                    }
                };
            let mut samples: Vec<f32> = Vec::with_capacity(FRAME_SAMPLES);
            let mut decoded: Vec<f32> = Vec::new();
            while reader_running.load(Ordering::SeqCst) {
                let Ok((rtp, _)) = track.read_rtp().await else {
                    break;
                };
                samples.clear();
                samples.extend(
                    rtp.payload
                        .iter()
                        .map(|byte| ulaw_to_linear(*byte) as f32 / i16::MAX as f32),
                );
                decoded.clear();
                if let Err(e) = resampler.process(&samples, &mut decoded) {
                    tracing::debug!("dropping remote audio: {}", e);
                    continue;
                }
                let mut guard = buffer.lock();
                guard.extend(decoded.iter().copied());
                let overflow = guard.len().saturating_sub(MAX_PLAYBACK_BUFFER);
                guard.drain(..overflow);
            }
        });

        Ok(Self {
            stop: Some(stop_tx),
            running,
        })
    }

    fn open_output(buffer: Arc<Mutex<VecDeque<f32>>>) -> anyhow::Result<(cpal::Stream, u32)> {
        let host = cpal::default_host();
        let output_device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("No output device available"))?;

        let config = output_device.default_output_config()?;
        tracing::info!("Output config: {:?}", config);
        let rate = config.sample_rate().0;

        let stream = match config.sample_format() {
            SampleFormat::F32 => {
                Self::build_output_stream::<f32>(&output_device, &config.into(), buffer)?
            }
            SampleFormat::I16 => {
                Self::build_output_stream::<i16>(&output_device, &config.into(), buffer)?
            }
            SampleFormat::U16 => {
                Self::build_output_stream::<u16>(&output_device, &config.into(), buffer)?
            }
            sample_format => {
                return Err(anyhow!("Unsupported sample format: {:?}", sample_format))
            }
        };

        Ok((stream, rate))
    }

    fn build_output_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        buffer: Arc<Mutex<VecDeque<f32>>>,
    ) -> anyhow::Result<cpal::Stream>
    where
        T: SizedSample + Sample + FromSample<f32> + Send + 'static,
    {
        let channels = config.channels.max(1) as usize;
        let err_fn =
            |err| tracing::error!("An error occurred on the output audio stream: {}", err);

        let stream = device.build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut buffer = buffer.lock();
                for frame in data.chunks_mut(channels) {
                    // Silence on underrun.
                    let value = T::from_sample(buffer.pop_front().unwrap_or(0.0));
                    for out in frame.iter_mut() {
                        *out = value;
                    }
                }
            },
            err_fn,
            None,
        )?;

        Ok(stream)
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
