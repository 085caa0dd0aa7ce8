//! RIFF/WAVE output for recorded utterances

use std::io::{Cursor, Seek, Write};
use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::recorder::Utterance;

pub fn spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

fn write_to<W: Write + Seek>(writer: W, utterance: &Utterance) -> Result<(), hound::Error> {
    let mut wav = WavWriter::new(writer, spec(utterance.sample_rate()))?;
    for frame in utterance.frames() {
        for &s in frame.samples() {
            wav.write_sample(s)?;
        }
    }
    wav.finalize()
}

/// Encode into an in-memory WAV file
pub fn encode(utterance: &Utterance) -> Result<Vec<u8>, hound::Error> {
    let mut cursor = Cursor::new(Vec::new());
    write_to(&mut cursor, utterance)?;
    Ok(cursor.into_inner())
}

/// Write to `path`, replacing any previous recording
pub fn save(path: &Path, utterance: &Utterance) -> Result<(), hound::Error> {
    let file = std::io::BufWriter::new(std::fs::File::create(path)?);
    write_to(file, utterance)
}
