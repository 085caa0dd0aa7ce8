//! Spoken control phrases, checked before a transcript reaches the model
//!
//! Transcripts are matched word by word against the configured quit phrases.
//! Case and punctuation are ignored, and each longer word may carry a small
//! transcription error.

use crate::config::CommandsConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Nothing usable was heard
    Skip,
    /// Stop the dispatch loop
    Shutdown,
    /// Hand the transcript to the model
    PassThrough(String),
}

pub struct CommandProcessor {
    quit_phrases: Vec<String>,
}

impl CommandProcessor {
    pub fn new(config: &CommandsConfig) -> Self {
        Self {
            quit_phrases: config
                .quit_phrases
                .iter()
                .map(|p| clean_for_matching(p))
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn process(&self, transcript: &str) -> CommandResult {
        let text = transcript.trim();
        if !text.chars().any(char::is_alphanumeric) {
            return CommandResult::Skip;
        }
        let cleaned = clean_for_matching(text);
        if self
            .quit_phrases
            .iter()
            .any(|phrase| fuzzy_match(phrase, &cleaned))
        {
            return CommandResult::Shutdown;
        }
        CommandResult::PassThrough(text.to_string())
    }
}

/// Same number of words, each within a Levenshtein distance of a quarter of
/// its length. Words of three letters or fewer must match exactly.
pub fn fuzzy_match(expected: &str, actual: &str) -> bool {
    if expected == actual {
        return true;
    }
    let expected: Vec<&str> = expected.split_whitespace().collect();
    let actual: Vec<&str> = actual.split_whitespace().collect();
    expected.len() == actual.len()
        && expected
            .iter()
            .zip(&actual)
            .all(|(e, a)| levenshtein(e, a) <= e.chars().count() / 4)
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            row[j + 1] = (prev[j + 1] + 1).min(row[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

/// Lowercase, keep letters, collapse whitespace
pub fn clean_for_matching(text: &str) -> String {
    let letters: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphabetic() || c.is_whitespace())
        .collect();
    letters.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> CommandProcessor {
        CommandProcessor::new(&CommandsConfig::default())
    }

    #[test]
    fn test_quit_phrases() {
        let p = processor();
        assert_eq!(p.process("Stop listening."), CommandResult::Shutdown);
        assert_eq!(p.process("stop listning"), CommandResult::Shutdown);
        assert_eq!(p.process("GOODBYE!"), CommandResult::Shutdown);
    }

    #[test]
    fn test_empty_transcripts_are_skipped() {
        let p = processor();
        assert_eq!(p.process(""), CommandResult::Skip);
        assert_eq!(p.process("  ...  "), CommandResult::Skip);
    }

    #[test]
    fn test_numbers_reach_the_model() {
        let p = processor();
        assert_eq!(p.process("42."), CommandResult::PassThrough("42.".to_string()));
    }

    #[test]
    fn test_near_miss_editor_phrases_pass_through() {
        let p = processor();
        for text in ["Quit visual mode.", "go to buy", "goodbye world", "start listening"] {
            assert_eq!(
                p.process(text),
                CommandResult::PassThrough(text.to_string()),
                "{text}"
            );
        }
    }

    #[test]
    fn test_fuzzy_match_is_per_word() {
        assert!(fuzzy_match("stop listening", "stop listning"));
        assert!(fuzzy_match("goodbye", "goodby"));
        assert!(!fuzzy_match("quit voice mode", "quit visual mode"));
        assert!(!fuzzy_match("goodbye", "go to buy"));
        assert!(!fuzzy_match("stop listening", "start listening"));
    }

    #[test]
    fn test_passthrough_keeps_original_text() {
        let p = processor();
        assert_eq!(
            p.process("  Delete line 4.  "),
            CommandResult::PassThrough("Delete line 4.".to_string())
        );
        assert_eq!(
            p.process("stop the build"),
            CommandResult::PassThrough("stop the build".to_string())
        );
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("hello", "hello"), 0);
        assert_eq!(levenshtein("hello", "helo"), 1);
        assert_eq!(levenshtein("hello", "world"), 4);
        assert_eq!(levenshtein("", "abc"), 3);
    }

    #[test]
    fn test_clean_for_matching() {
        assert_eq!(clean_for_matching("Stop,  listening!"), "stop listening");
        assert_eq!(clean_for_matching("42"), "");
    }
}
