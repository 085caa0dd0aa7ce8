//! Conversation history persisted as a JSON array of `{role, content}`

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::llm::Message;

pub const SYSTEM_PROMPT: &str = "Return exactly one valid NVim command. IF YOU ARE UNSURE WHAT TO DO, \
DO AN ECHO TO ASK THE USER FOR CLARIFICATION. You are allowed to use \
the `:echo` command to ask the user for clarification on which command \
to execute. Basically you can communicate with them this way. if user says \
'do you hear me?' you can reply with how may i help you today via echo. \
Feel free to ask any further questions via echo.";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("history file {} is not valid JSON: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub struct History {
    path: PathBuf,
    messages: Vec<Message>,
}

impl History {
    /// Load from `path`, or start a fresh conversation with the system prompt
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        let messages = if path.exists() {
            let text = fs::read_to_string(&path).map_err(|source| HistoryError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&text).map_err(|source| HistoryError::Json {
                path: path.clone(),
                source,
            })?
        } else {
            vec![Message::system(SYSTEM_PROMPT)]
        };
        debug!(path = %path.display(), turns = messages.len(), "history loaded");
        Ok(Self { path, messages })
    }

    pub fn save(&self) -> Result<(), HistoryError> {
        let json = serde_json::to_string_pretty(&self.messages).map_err(|source| {
            HistoryError::Json {
                path: self.path.clone(),
                source,
            }
        })?;
        fs::write(&self.path, json).map_err(|source| HistoryError::Io {
            path: self.path.clone(),
            source,
        })
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.messages.pop()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;

    #[test]
    fn test_fresh_history_has_system_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::load(dir.path().join("history.json")).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history.messages()[0].role, Role::System);
        assert!(history.messages()[0].content.contains(":echo"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let mut history = History::load(&path).unwrap();
        history.push(Message::user("open a split"));
        history.push(Message::assistant("vsplit"));
        history.save().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n  {"), "expected 2-space indent: {text}");

        let reloaded = History::load(&path).unwrap();
        assert_eq!(reloaded.messages(), history.messages());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(History::load(&path), Err(HistoryError::Json { .. })));
    }
}
