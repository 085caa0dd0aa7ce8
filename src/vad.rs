//! Speech/non-speech frame classifiers

use serde::Deserialize;
use thiserror::Error;
use webrtc_vad::{SampleRate, Vad as WebRtcVad, VadMode};

use crate::audio::{Frame, i16_to_f32};

const SILERO_THRESHOLD: f32 = 0.3;
const ENERGY_THRESHOLD: f32 = 0.01;

#[derive(Debug, Error)]
pub enum VadError {
    #[error("unsupported sample rate {0}Hz")]
    UnsupportedRate(u32),
    #[error("frame of {samples} samples is not 10, 20 or 30ms at {rate}Hz")]
    InvalidFrameLength { samples: usize, rate: u32 },
    #[error("webrtc vad rejected the frame")]
    Rejected,
    #[error("vad model: {0}")]
    Model(String),
}

/// Classifies one frame of audio as speech or not.
pub trait FrameClassifier {
    fn is_speech(&mut self, frame: &Frame, sample_rate: u32) -> Result<bool, VadError>;
}

impl<T: FrameClassifier + ?Sized> FrameClassifier for &mut T {
    fn is_speech(&mut self, frame: &Frame, sample_rate: u32) -> Result<bool, VadError> {
        (**self).is_speech(frame, sample_rate)
    }
}

/// WebRTC aggressiveness; higher rejects more non-speech
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Aggressiveness {
    Quality,
    LowBitrate,
    #[default]
    Aggressive,
    VeryAggressive,
}

impl From<Aggressiveness> for VadMode {
    fn from(mode: Aggressiveness) -> Self {
        match mode {
            Aggressiveness::Quality => VadMode::Quality,
            Aggressiveness::LowBitrate => VadMode::LowBitrate,
            Aggressiveness::Aggressive => VadMode::Aggressive,
            Aggressiveness::VeryAggressive => VadMode::VeryAggressive,
        }
    }
}

fn webrtc_rate(rate: u32) -> Result<SampleRate, VadError> {
    match rate {
        8000 => Ok(SampleRate::Rate8kHz),
        16000 => Ok(SampleRate::Rate16kHz),
        32000 => Ok(SampleRate::Rate32kHz),
        48000 => Ok(SampleRate::Rate48kHz),
        other => Err(VadError::UnsupportedRate(other)),
    }
}

fn valid_frame_len(samples: usize, rate: u32) -> bool {
    let per_ms = rate as usize / 1000;
    [10, 20, 30].iter().any(|ms| ms * per_ms == samples)
}

pub enum VadEngine {
    WebRtc { vad: WebRtcVad, rate: u32 },
    Silero(vad_rs::Vad),
    Energy,
}

impl VadEngine {
    /// WebRTC detector; the mode is fixed for the engine's lifetime
    pub fn webrtc(mode: Aggressiveness, sample_rate: u32) -> Result<Self, VadError> {
        let vad = WebRtcVad::new_with_rate_and_mode(webrtc_rate(sample_rate)?, mode.into());
        Ok(VadEngine::WebRtc {
            vad,
            rate: sample_rate,
        })
    }

    pub fn silero(model_path: &str, sample_rate: u32) -> Result<Self, VadError> {
        let vad = vad_rs::Vad::new(model_path, sample_rate as usize)
            .map_err(|e| VadError::Model(e.to_string()))?;
        Ok(VadEngine::Silero(vad))
    }

    pub fn energy() -> Self {
        VadEngine::Energy
    }

    pub fn name(&self) -> &'static str {
        match self {
            VadEngine::WebRtc { .. } => "WebRTC",
            VadEngine::Silero(_) => "Silero",
            VadEngine::Energy => "Energy",
        }
    }

    pub fn reset(&mut self) {
        if let VadEngine::Silero(vad) = self {
            vad.reset();
        }
    }
}

impl FrameClassifier for VadEngine {
    fn is_speech(&mut self, frame: &Frame, sample_rate: u32) -> Result<bool, VadError> {
        match self {
            VadEngine::WebRtc { vad, rate } => {
                if !valid_frame_len(frame.len(), sample_rate) {
                    return Err(VadError::InvalidFrameLength {
                        samples: frame.len(),
                        rate: sample_rate,
                    });
                }
                if *rate != sample_rate {
                    vad.set_sample_rate(webrtc_rate(sample_rate)?);
                    *rate = sample_rate;
                }
                vad.is_voice_segment(frame.samples())
                    .map_err(|()| VadError::Rejected)
            }
            VadEngine::Silero(vad) => {
                let samples: Vec<f32> = frame.samples().iter().map(|&s| i16_to_f32(s)).collect();
                vad.compute(&samples)
                    .map(|r| r.prob > SILERO_THRESHOLD)
                    .map_err(|e| VadError::Model(e.to_string()))
            }
            VadEngine::Energy => Ok(rms(frame) > ENERGY_THRESHOLD),
        }
    }
}

fn rms(frame: &Frame) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f32 = frame
        .samples()
        .iter()
        .map(|&s| {
            let v = i16_to_f32(s);
            v * v
        })
        .sum();
    (sum / frame.len() as f32).sqrt()
}
