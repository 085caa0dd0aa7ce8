use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};
use rubato::{FftFixedIn, Resampler};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{info, trace, warn};

pub const TARGET_RATE: u32 = 16000;
pub const FRAME_MS: u32 = 30;
// 30ms frames at 16kHz = 480 samples
pub const FRAME_SAMPLES: usize = (TARGET_RATE * FRAME_MS / 1000) as usize;

const RESAMPLE_CHUNK: usize = 1024;
// ~3s of frames buffered between the capture callback and the reader
const CHANNEL_FRAMES: usize = 100;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no input device available")]
    NoDevice,
    #[error("input device '{0}' not found")]
    DeviceNotFound(String),
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),
    #[error("resampler: {0}")]
    Resampler(String),
    #[error("audio stream closed")]
    Disconnected,
    #[error(transparent)]
    Device(#[from] cpal::DevicesError),
    #[error(transparent)]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),
    #[error(transparent)]
    BuildStream(#[from] cpal::BuildStreamError),
    #[error(transparent)]
    PlayStream(#[from] cpal::PlayStreamError),
}

/// One fixed-size block of mono 16-bit PCM. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Arc<[i16]>);

impl Frame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self(samples.into())
    }

    pub fn silent() -> Self {
        Self::new(vec![0; FRAME_SAMPLES])
    }

    pub fn samples(&self) -> &[i16] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// Something that yields consecutive audio frames, blocking until one is ready.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Frame, AudioError>;
}

impl<T: FrameSource + ?Sized> FrameSource for &mut T {
    fn read_frame(&mut self) -> Result<Frame, AudioError> {
        (**self).read_frame()
    }
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn read_frame(&mut self) -> Result<Frame, AudioError> {
        (**self).read_frame()
    }
}

pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Resamples mono input to 16kHz and slices it into fixed frames.
struct FrameResampler {
    resampler: Option<FftFixedIn<f32>>,
    in_buf: Vec<f32>,
    pending: Vec<f32>,
    frame_samples: usize,
}

impl FrameResampler {
    fn new(in_hz: usize, out_hz: usize, frame_samples: usize) -> Result<Self, AudioError> {
        let resampler = if in_hz != out_hz {
            Some(
                FftFixedIn::<f32>::new(in_hz, out_hz, RESAMPLE_CHUNK, 1, 1)
                    .map_err(|e| AudioError::Resampler(e.to_string()))?,
            )
        } else {
            None
        };
        Ok(Self {
            resampler,
            in_buf: Vec::with_capacity(RESAMPLE_CHUNK),
            pending: Vec::with_capacity(frame_samples),
            frame_samples,
        })
    }

    fn push(&mut self, src: &[f32], mut emit: impl FnMut(&[f32])) {
        let Some(resampler) = self.resampler.as_mut() else {
            Self::emit_frames(&mut self.pending, self.frame_samples, src, &mut emit);
            return;
        };

        self.in_buf.extend_from_slice(src);

        loop {
            let needed = resampler.input_frames_next();
            if self.in_buf.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.in_buf.drain(..needed).collect();
            match resampler.process(&[&chunk], None) {
                Ok(out) => {
                    Self::emit_frames(&mut self.pending, self.frame_samples, &out[0], &mut emit)
                }
                Err(e) => warn!("resample failed: {}", e),
            }
        }
    }

    fn emit_frames(
        pending: &mut Vec<f32>,
        frame_samples: usize,
        data: &[f32],
        emit: &mut impl FnMut(&[f32]),
    ) {
        pending.extend_from_slice(data);

        while pending.len() >= frame_samples {
            let frame: Vec<f32> = pending.drain(..frame_samples).collect();
            emit(&frame);
        }
    }
}

fn downmix<T: Copy>(data: &[T], channels: usize, convert: impl Fn(T) -> f32) -> Vec<f32> {
    if channels <= 1 {
        data.iter().map(|&s| convert(s)).collect()
    } else {
        data.chunks(channels)
            .map(|c| c.iter().map(|&s| convert(s)).sum::<f32>() / channels as f32)
            .collect()
    }
}

/// List input device names
pub fn list_devices() -> Result<Vec<String>, AudioError> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    for device in host.input_devices()? {
        if let Ok(name) = device.name() {
            names.push(name);
        }
    }
    Ok(names)
}

/// Microphone frame source.
///
/// The cpal callback downmixes, resamples and slices the input into 480-sample
/// frames, then hands them over a bounded channel. When the reader falls
/// behind, new frames are dropped rather than blocking the callback; the
/// count is kept in `overflows` and never reported as an error.
pub struct MicSource {
    _stream: Stream,
    rx: flume::Receiver<Frame>,
    overflows: Arc<AtomicUsize>,
}

impl MicSource {
    /// Open `device` (or the default input) and start capturing
    pub fn open(device: Option<&str>) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = match device {
            Some(name) => host
                .input_devices()?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| AudioError::DeviceNotFound(name.to_string()))?,
            None => host.default_input_device().ok_or(AudioError::NoDevice)?,
        };
        let supported = device.default_input_config()?;
        let input_rate = u32::from(supported.sample_rate()) as usize;
        let channels = supported.channels() as usize;
        let format = supported.sample_format();

        info!(
            "Audio: {}Hz {}ch {:?} -> {}Hz mono",
            input_rate, channels, format, TARGET_RATE
        );

        let (tx, rx) = flume::bounded::<Frame>(CHANNEL_FRAMES);
        let overflows = Arc::new(AtomicUsize::new(0));
        let mut resampler = FrameResampler::new(input_rate, TARGET_RATE as usize, FRAME_SAMPLES)?;

        let overflow_count = Arc::clone(&overflows);
        let mut deliver = move |mono: Vec<f32>| {
            resampler.push(&mono, |frame| {
                let pcm: Vec<i16> = frame.iter().map(|&s| f32_to_i16(s)).collect();
                if tx.try_send(Frame::new(pcm)).is_err() {
                    let n = overflow_count.fetch_add(1, Ordering::Relaxed) + 1;
                    trace!(dropped = n, "frame overflow");
                }
            });
        };

        let config = supported.config();
        let err_fn = |e: cpal::StreamError| warn!("audio stream error: {}", e);
        let stream = match format {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _| deliver(downmix(data, channels, |s| s)),
                err_fn,
                None,
            )?,
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _| deliver(downmix(data, channels, i16_to_f32)),
                err_fn,
                None,
            )?,
            SampleFormat::U16 => device.build_input_stream(
                &config,
                move |data: &[u16], _| {
                    deliver(downmix(data, channels, |s| (s as f32 - 32768.0) / 32768.0))
                },
                err_fn,
                None,
            )?,
            other => return Err(AudioError::UnsupportedFormat(format!("{other:?}"))),
        };
        stream.play()?;

        Ok(Self {
            _stream: stream,
            rx,
            overflows,
        })
    }

    /// Frames dropped because the reader was not keeping up
    pub fn overflows(&self) -> usize {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Discard anything captured while nobody was listening
    pub fn drain(&self) -> usize {
        self.rx.drain().count()
    }
}

impl FrameSource for MicSource {
    fn read_frame(&mut self) -> Result<Frame, AudioError> {
        self.rx.recv().map_err(|_| AudioError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        assert_eq!(FRAME_SAMPLES, 480);
        assert_eq!(Frame::silent().len(), 480);
    }

    #[test]
    fn test_sample_conversion_clamps() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(i16_to_f32(-32768), -1.0);
    }

    #[test]
    fn test_downmix_averages_channels() {
        let stereo = [0.5f32, -0.5, 1.0, 0.0];
        assert_eq!(downmix(&stereo, 2, |s| s), vec![0.0, 0.5]);
        assert_eq!(downmix(&stereo, 1, |s| s), stereo.to_vec());
    }

    #[test]
    fn test_passthrough_resampler_slices_frames() {
        let mut r = FrameResampler::new(16000, 16000, 4).unwrap();
        let mut frames = Vec::new();
        r.push(&[0.1; 10], |f| frames.push(f.to_vec()));
        assert_eq!(frames.len(), 2);
        // remainder is held for the next push
        r.push(&[0.1; 2], |f| frames.push(f.to_vec()));
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn test_resampler_downsamples_to_target() {
        let mut r = FrameResampler::new(48000, 16000, FRAME_SAMPLES).unwrap();
        let mut total = 0usize;
        // 1s of input yields roughly 1s of output, minus resampler latency
        r.push(&vec![0.0; 48000], |f| total += f.len());
        assert!(total > 8000 && total <= 16000, "got {total}");
        assert_eq!(total % FRAME_SAMPLES, 0);
    }

    #[test]
    fn test_frame_bytes() {
        let f = Frame::new(vec![1, -2]);
        assert_eq!(f.to_bytes(), vec![1, 0, 0xfe, 0xff]);
    }
}
