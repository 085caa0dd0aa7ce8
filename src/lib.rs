pub mod audio;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod editor;
pub mod history;
pub mod llm;
pub mod recorder;
pub mod stats;
pub mod transcriber;
pub mod vad;
pub mod wav;
