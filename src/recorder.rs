//! Endpointed recorder - turns a live frame stream into one utterance
//!
//! Frames are voted on in a trailing ring window. While idle, a window that is
//! more than `vote_percent` speech (measured against the window's *capacity*,
//! not its current fill) triggers recording; the window contents become the
//! lead-in. While triggered, every frame is appended to the utterance and also
//! voted on; a window that is more than `vote_percent` silence ends the
//! utterance, and the whole window is appended once more as trailing padding.
//!
//! Note the trailing padding frames were already appended as they arrived, so
//! the last `capacity` frames of an emitted utterance appear twice.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::audio::{AudioError, FRAME_MS, Frame, FrameSource, TARGET_RATE};
use crate::vad::{FrameClassifier, VadError};

/// Default trailing window length
pub const PADDING_MS: u32 = 2000;

/// Default vote threshold, in percent of window capacity
pub const VOTE_PERCENT: u32 = 90;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("audio source failed: {0}")]
    Audio(#[from] AudioError),
    #[error("speech classifier failed: {0}")]
    Classifier(#[from] VadError),
    #[error("recording cancelled after {frames} frames")]
    Cancelled { frames: usize },
    #[error("no utterance completed within {frames} frames")]
    TimedOut { frames: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for sustained speech
    Idle,
    /// Recording until sustained silence
    Triggered,
}

/// Outcome of feeding one frame to the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Triggered,
    Complete,
}

/// Fixed-capacity FIFO of classified frames.
#[derive(Debug)]
pub struct RingWindow {
    entries: VecDeque<(Frame, bool)>,
    capacity: usize,
}

impl RingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest one when full
    pub fn push(&mut self, frame: Frame, is_speech: bool) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((frame, is_speech));
    }

    pub fn speech_count(&self) -> usize {
        self.entries.iter().filter(|(_, speech)| *speech).count()
    }

    pub fn silence_count(&self) -> usize {
        self.entries.len() - self.speech_count()
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.entries.iter().map(|(frame, _)| frame)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// `count > percent% of capacity`, in integer arithmetic.
pub fn exceeds_vote(count: usize, capacity: usize, percent: u32) -> bool {
    count * 100 > capacity * percent as usize
}

/// Window capacity in frames for a padding length, truncated (2000/30 = 66)
pub fn window_capacity(padding_ms: u32, frame_ms: u32) -> usize {
    (padding_ms / frame_ms.max(1)).max(1) as usize
}

/// A finished utterance: frames in emission order, trailing padding included.
#[derive(Debug, Clone)]
pub struct Utterance {
    frames: Vec<Frame>,
    sample_rate: u32,
}

impl Utterance {
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> Vec<i16> {
        self.frames
            .iter()
            .flat_map(|f| f.samples().iter().copied())
            .collect()
    }

    /// Concatenated little-endian PCM bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.frames.iter().map(|f| f.len() * 2).sum());
        for frame in &self.frames {
            out.extend_from_slice(&frame.to_bytes());
        }
        out
    }

    pub fn duration(&self) -> Duration {
        let samples: usize = self.frames.iter().map(Frame::len).sum();
        Duration::from_secs_f64(samples as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Pure onset/offset state machine. Feed it classified frames; it reports
/// when recording starts and when the utterance is complete.
#[derive(Debug)]
pub struct EndpointDetector {
    window: RingWindow,
    utterance: Vec<Frame>,
    state: SessionState,
    vote_percent: u32,
}

impl EndpointDetector {
    pub fn new(capacity: usize, vote_percent: u32) -> Self {
        Self {
            window: RingWindow::new(capacity),
            utterance: Vec::new(),
            state: SessionState::Idle,
            vote_percent,
        }
    }

    pub fn push(&mut self, frame: Frame, is_speech: bool) -> Step {
        let capacity = self.window.capacity();
        match self.state {
            SessionState::Idle => {
                self.window.push(frame, is_speech);
                if exceeds_vote(self.window.speech_count(), capacity, self.vote_percent) {
                    self.state = SessionState::Triggered;
                    self.utterance.extend(self.window.frames().cloned());
                    self.window.clear();
                    return Step::Triggered;
                }
                Step::Continue
            }
            SessionState::Triggered => {
                self.utterance.push(frame.clone());
                self.window.push(frame, is_speech);
                if exceeds_vote(self.window.silence_count(), capacity, self.vote_percent) {
                    self.utterance.extend(self.window.frames().cloned());
                    return Step::Complete;
                }
                Step::Continue
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn window(&self) -> &RingWindow {
        &self.window
    }

    /// Frames collected so far (lead-in included once triggered)
    pub fn utterance_frames(&self) -> &[Frame] {
        &self.utterance
    }

    pub fn into_utterance(self, sample_rate: u32) -> Utterance {
        Utterance {
            frames: self.utterance,
            sample_rate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub sample_rate: u32,
    pub frame_ms: u32,
    pub padding_ms: u32,
    pub vote_percent: u32,
    /// Give up after this much audio has been read; `None` waits forever
    pub max_duration: Option<Duration>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            sample_rate: TARGET_RATE,
            frame_ms: FRAME_MS,
            padding_ms: PADDING_MS,
            vote_percent: VOTE_PERCENT,
            max_duration: None,
        }
    }
}

impl RecorderConfig {
    pub fn window_capacity(&self) -> usize {
        window_capacity(self.padding_ms, self.frame_ms)
    }

    fn max_frames(&self) -> Option<usize> {
        self.max_duration
            .map(|d| (d.as_millis() / self.frame_ms.max(1) as u128) as usize)
    }
}

/// Recording session context: owns the audio source and the classifier for
/// the lifetime of the process.
pub struct Recorder<S, C> {
    source: S,
    classifier: C,
    config: RecorderConfig,
    stop: Option<Arc<AtomicBool>>,
}

impl<S: FrameSource, C: FrameClassifier> Recorder<S, C> {
    pub fn new(source: S, classifier: C, config: RecorderConfig) -> Self {
        Self {
            source,
            classifier,
            config,
            stop: None,
        }
    }

    /// Abort a pending recording when `flag` becomes true
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn classifier_mut(&mut self) -> &mut C {
        &mut self.classifier
    }

    /// Block until one utterance has been spoken and followed by silence.
    pub fn record_until_silence(&mut self) -> Result<Utterance, RecordError> {
        let capacity = self.config.window_capacity();
        let max_frames = self.config.max_frames();
        let mut detector = EndpointDetector::new(capacity, self.config.vote_percent);
        let mut frames_read = 0usize;

        debug!(
            capacity,
            vote_percent = self.config.vote_percent,
            "recording session started"
        );

        loop {
            if let Some(stop) = &self.stop {
                if stop.load(Ordering::SeqCst) {
                    return Err(RecordError::Cancelled {
                        frames: frames_read,
                    });
                }
            }
            if let Some(limit) = max_frames {
                if frames_read >= limit {
                    return Err(RecordError::TimedOut {
                        frames: frames_read,
                    });
                }
            }

            let frame = self.source.read_frame()?;
            frames_read += 1;
            let is_speech = self.classifier.is_speech(&frame, self.config.sample_rate)?;
            trace!(frame = frames_read, is_speech, "classified");

            match detector.push(frame, is_speech) {
                Step::Continue => {}
                Step::Triggered => {
                    info!(
                        lead_in_frames = detector.utterance_frames().len(),
                        "speech detected"
                    );
                }
                Step::Complete => {
                    let utterance = detector.into_utterance(self.config.sample_rate);
                    info!(
                        frames = utterance.frame_count(),
                        secs = utterance.duration().as_secs_f32(),
                        "utterance complete"
                    );
                    return Ok(utterance);
                }
            }
        }
    }
}
