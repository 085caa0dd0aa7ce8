//! Per-stage latency tracking for the dispatch loop

use std::fmt::Write;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Record,
    Transcribe,
    Complete,
    Execute,
}

impl Stage {
    const ALL: [Stage; 4] = [Stage::Record, Stage::Transcribe, Stage::Complete, Stage::Execute];

    fn label(self) -> &'static str {
        match self {
            Stage::Record => "Recording",
            Stage::Transcribe => "Transcription",
            Stage::Complete => "Completion",
            Stage::Execute => "Execution",
        }
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    record: Vec<Duration>,
    transcribe: Vec<Duration>,
    complete: Vec<Duration>,
    execute: Vec<Duration>,
    retries: usize,
}

impl Stats {
    fn samples_mut(&mut self, stage: Stage) -> &mut Vec<Duration> {
        match stage {
            Stage::Record => &mut self.record,
            Stage::Transcribe => &mut self.transcribe,
            Stage::Complete => &mut self.complete,
            Stage::Execute => &mut self.execute,
        }
    }

    fn samples(&self, stage: Stage) -> &[Duration] {
        match stage {
            Stage::Record => &self.record,
            Stage::Transcribe => &self.transcribe,
            Stage::Complete => &self.complete,
            Stage::Execute => &self.execute,
        }
    }

    pub fn record(&mut self, stage: Stage, duration: Duration) {
        self.samples_mut(stage).push(duration);
    }

    /// Run `f`, recording how long it took
    pub fn time<T>(&mut self, stage: Stage, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(stage, start.elapsed());
        out
    }

    pub fn add_retries(&mut self, n: usize) {
        self.retries += n;
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.samples(stage).len()
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        for stage in Stage::ALL {
            let samples = self.samples(stage);
            if samples.is_empty() {
                continue;
            }
            let (avg, min, max, total) = calc(samples);
            let _ = writeln!(
                out,
                "{} (n={}): avg={}ms min={}ms max={}ms total={:.1}s",
                stage.label(),
                samples.len(),
                avg.as_millis(),
                min.as_millis(),
                max.as_millis(),
                total.as_secs_f64()
            );
        }
        if self.retries > 0 {
            let _ = writeln!(out, "Execution retries: {}", self.retries);
        }
        if out.is_empty() {
            out.push_str("No stats recorded yet.\n");
        }
        out
    }
}

fn calc(samples: &[Duration]) -> (Duration, Duration, Duration, Duration) {
    let total: Duration = samples.iter().sum();
    let avg = total / samples.len() as u32;
    let min = samples.iter().min().copied().unwrap_or_default();
    let max = samples.iter().max().copied().unwrap_or_default();
    (avg, min, max, total)
}
