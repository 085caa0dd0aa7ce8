use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::audio::{FRAME_MS, TARGET_RATE};
use crate::recorder::{PADDING_MS, RecorderConfig, VOTE_PERCENT};
use crate::vad::Aggressiveness;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub vad: VadConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub editor: EditorConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    /// Pause between dispatch cycles
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            transcription: TranscriptionConfig::default(),
            llm: LlmConfig::default(),
            editor: EditorConfig::default(),
            history: HistoryConfig::default(),
            retry: RetryConfig::default(),
            commands: CommandsConfig::default(),
            pause_ms: default_pause_ms(),
        }
    }
}

fn default_pause_ms() -> u64 {
    1000
}

// ============================================================================
// Audio / recorder
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AudioConfig {
    /// Input device name; default device when unset
    #[serde(default)]
    pub device: Option<String>,
    /// Length of the trailing vote window
    #[serde(default = "default_padding_ms")]
    pub padding_ms: u32,
    /// Percent of the window that must agree to start or stop recording
    #[serde(default = "default_vote_percent")]
    pub vote_percent: u32,
    /// Abandon a recording after this long; unset waits indefinitely
    #[serde(default)]
    pub max_utterance_secs: Option<u64>,
    #[serde(default = "default_wav_path")]
    pub wav_path: PathBuf,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            padding_ms: default_padding_ms(),
            vote_percent: default_vote_percent(),
            max_utterance_secs: None,
            wav_path: default_wav_path(),
        }
    }
}

impl AudioConfig {
    pub fn recorder(&self) -> RecorderConfig {
        RecorderConfig {
            sample_rate: TARGET_RATE,
            // fixed by the capture path
            frame_ms: FRAME_MS,
            padding_ms: self.padding_ms,
            vote_percent: self.vote_percent,
            max_duration: self.max_utterance_secs.map(Duration::from_secs),
        }
    }
}

fn default_padding_ms() -> u32 {
    PADDING_MS
}
fn default_vote_percent() -> u32 {
    VOTE_PERCENT
}
fn default_wav_path() -> PathBuf {
    "command.wav".into()
}

// ============================================================================
// VAD
// ============================================================================

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VadKind {
    #[default]
    WebRtc,
    Silero,
    Energy,
}

#[derive(Debug, Deserialize)]
pub struct VadConfig {
    #[serde(default)]
    pub engine: VadKind,
    /// WebRTC mode, fixed for the session
    #[serde(default)]
    pub aggressiveness: Aggressiveness,
    #[serde(default = "default_silero_model")]
    pub silero_model: String,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            engine: VadKind::default(),
            aggressiveness: Aggressiveness::default(),
            silero_model: default_silero_model(),
        }
    }
}

fn default_silero_model() -> String {
    "models/silero_vad_v4.onnx".into()
}

// ============================================================================
// Transcription
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "backend")]
pub enum TranscriptionConfig {
    #[serde(rename = "openai-compat")]
    OpenAiCompat {
        #[serde(default)]
        base_url: String,
        /// Preset shortcuts: "openai", "lm_studio", "ollama"
        preset: Option<String>,
        #[serde(default = "default_transcription_model")]
        model: String,
        /// API key (supports ${ENV_VAR} syntax)
        #[serde(default)]
        api_key: Option<String>,
    },
    #[serde(rename = "parakeet")]
    Parakeet {
        #[serde(default = "default_parakeet_model")]
        model_path: String,
    },
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        TranscriptionConfig::OpenAiCompat {
            base_url: String::new(),
            preset: Some("openai".into()),
            model: default_transcription_model(),
            api_key: None,
        }
    }
}

fn default_transcription_model() -> String {
    "whisper-1".into()
}

fn default_parakeet_model() -> String {
    "models/parakeet-tdt-0.6b-v3-int8".into()
}

// ============================================================================
// LLM
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub base_url: String,
    pub preset: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            preset: Some("openai".into()),
            model: default_llm_model(),
            api_key: None,
            temperature: default_temperature(),
        }
    }
}

fn default_llm_model() -> String {
    "o3".into()
}

fn default_temperature() -> Option<f32> {
    Some(1.0)
}

// ============================================================================
// Editor, history, retry, commands
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EditorConfig {
    #[serde(default = "default_socket")]
    pub socket: PathBuf,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
        }
    }
}

fn default_socket() -> PathBuf {
    "/tmp/nvim.sock".into()
}

#[derive(Debug, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_path")]
    pub path: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: default_history_path(),
        }
    }
}

fn default_history_path() -> PathBuf {
    "history.json".into()
}

#[derive(Debug, Deserialize, Default)]
pub struct RetryConfig {
    /// Total execution attempts per utterance; unset retries until success
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CommandsConfig {
    /// Phrases that end the session instead of reaching the model
    #[serde(default = "default_quit_phrases")]
    pub quit_phrases: Vec<String>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            quit_phrases: default_quit_phrases(),
        }
    }
}

fn default_quit_phrases() -> Vec<String> {
    vec![
        "stop listening".to_string(),
        "goodbye".to_string(),
        "quit voice mode".to_string(),
    ]
}

// ============================================================================
// Presets and env expansion
// ============================================================================

const OPENAI_URL: &str = "https://api.openai.com/v1";
const LM_STUDIO_URL: &str = "http://localhost:1234/v1";
const OLLAMA_URL: &str = "http://localhost:11434/v1";

fn preset_url(preset: Option<&str>) -> String {
    match preset {
        Some("openai") | None => OPENAI_URL.to_string(),
        Some("lm_studio") => LM_STUDIO_URL.to_string(),
        Some("ollama") => OLLAMA_URL.to_string(),
        Some(other) => {
            warn!("Unknown preset '{}', using OpenAI", other);
            OPENAI_URL.to_string()
        }
    }
}

/// Expand ${VAR} to environment variable values
fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_name = &result[start + 2..start + end];
            let value = std::env::var(var_name).unwrap_or_else(|_| {
                warn!("Environment variable '{}' not found", var_name);
                String::new()
            });
            result.replace_range(start..start + end + 1, &value);
        } else {
            break;
        }
    }

    result
}

/// Configured key, else `OPENAI_API_KEY`, else the placeholder local servers accept
fn resolve_api_key(key: &mut Option<String>) {
    let expanded = key.as_deref().map(expand_env_vars).filter(|k| !k.is_empty());
    *key = Some(
        expanded
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-notoken".to_string()),
    );
}

impl Config {
    /// Load `path` (or `config.toml`); missing or unreadable files fall back
    /// to defaults
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
        let mut config = if path.exists() {
            match fs::read_to_string(path)
                .map_err(|e| e.to_string())
                .and_then(|s| Self::parse(&s).map_err(|e| e.to_string()))
            {
                Ok(config) => config,
                Err(e) => {
                    warn!("Ignoring {}: {}", path.display(), e);
                    Config::default()
                }
            }
        } else {
            Config::default()
        };

        config.resolve_presets();
        config.validate();
        config
    }

    /// Clamp values the recorder can't work with
    pub fn validate(&mut self) {
        let percent = self.audio.vote_percent;
        if !(1..=99).contains(&percent) {
            self.audio.vote_percent = percent.clamp(1, 99);
            warn!(
                "audio.vote_percent = {} is outside 1..=99, using {}",
                percent, self.audio.vote_percent
            );
        }
    }

    pub fn parse(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Fill empty base URLs from presets and expand env vars in API keys
    pub fn resolve_presets(&mut self) {
        if self.llm.base_url.is_empty() {
            self.llm.base_url = preset_url(self.llm.preset.as_deref());
        }
        resolve_api_key(&mut self.llm.api_key);

        if let TranscriptionConfig::OpenAiCompat {
            base_url,
            preset,
            api_key,
            ..
        } = &mut self.transcription
        {
            if base_url.is_empty() {
                *base_url = preset_url(preset.as_deref());
            }
            resolve_api_key(api_key);
        }
    }
}
