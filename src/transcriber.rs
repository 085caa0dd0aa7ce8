use std::time::Duration;

use reqwest::blocking::multipart::{Form, Part};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transcription request failed with {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model: {0}")]
    Model(String),
}

/// Speech-to-text for one recorded utterance.
///
/// Backends get both the WAV container and the raw samples and use whichever
/// they need.
pub trait Transcriber {
    fn transcribe(&mut self, wav: &[u8], samples: &[i16]) -> Result<String, TranscribeError>;
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// OpenAI-compatible `/audio/transcriptions` client
pub struct WhisperApi {
    http: reqwest::blocking::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl WhisperApi {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>) -> Result<Self, TranscribeError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }
}

impl Transcriber for WhisperApi {
    fn transcribe(&mut self, wav: &[u8], _samples: &[i16]) -> Result<String, TranscribeError> {
        let file = Part::bytes(wav.to_vec())
            .file_name("command.wav")
            .mime_str("audio/wav")?;
        let form = Form::new()
            .text("model", self.model.clone())
            .part("file", file);

        debug!(bytes = wav.len(), model = %self.model, "uploading utterance");
        let mut request = self
            .http
            .post(format!("{}/audio/transcriptions", self.base_url))
            .multipart(form);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(TranscribeError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: TranscriptionResponse = response.json()?;
        Ok(parsed.text.trim().to_string())
    }
}

#[cfg(feature = "parakeet")]
pub mod parakeet {
    use super::*;
    use crate::audio::i16_to_f32;
    use std::path::Path;
    use tracing::info;
    use transcribe_rs::{
        TranscriptionEngine,
        engines::parakeet::{ParakeetEngine, ParakeetModelParams},
    };

    /// Local Parakeet model via transcribe-rs
    pub struct Parakeet {
        engine: ParakeetEngine,
    }

    impl Parakeet {
        pub fn new(model_path: impl AsRef<Path>) -> Result<Self, TranscribeError> {
            let mut engine = ParakeetEngine::new();
            info!("Loading model {}...", model_path.as_ref().display());
            engine
                .load_model_with_params(model_path.as_ref(), ParakeetModelParams::int8())
                .map_err(|e| TranscribeError::Model(e.to_string()))?;
            info!("Model loaded.");
            Ok(Self { engine })
        }
    }

    impl Transcriber for Parakeet {
        fn transcribe(&mut self, _wav: &[u8], samples: &[i16]) -> Result<String, TranscribeError> {
            let samples: Vec<f32> = samples.iter().map(|&s| i16_to_f32(s)).collect();
            let result = self
                .engine
                .transcribe_samples(samples, None)
                .map_err(|e| TranscribeError::Model(e.to_string()))?;
            Ok(result.text.trim().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing() {
        let r: TranscriptionResponse =
            serde_json::from_str(r#"{"text":"  delete this line  "}"#).unwrap();
        assert_eq!(r.text.trim(), "delete this line");
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let api = WhisperApi::new("https://api.openai.com/v1/", "whisper-1", None).unwrap();
        assert_eq!(api.base_url, "https://api.openai.com/v1");
    }
}
