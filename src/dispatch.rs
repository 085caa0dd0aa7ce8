//! Turns a transcript into an executed editor command
//!
//! The model sees the whole conversation plus the current buffer. A command
//! that fails in the editor is fed back as an `Error: ...` turn and a new
//! command is requested, until one succeeds or the attempt cap is reached.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::editor::Editor;
use crate::history::History;
use crate::llm::{LlmBackend, Message};
use crate::stats::{Stage, Stats};

/// Buffer lines prefixed with 1-based line numbers
pub fn numbered_snippet(lines: &[String]) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(i, l)| format!("{}: {}", i + 1, l))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn user_prompt(snippet: &str, transcript: &str) -> String {
    format!(
        "Here’s the code around your cursor:\n```vim\n{snippet}\n```\n\
         Based on that, generate a single NVim Ex-command to “{transcript}” \
         (no backticks, no leading colon)."
    )
}

/// Strip the markdown the model adds despite being asked not to
pub fn sanitize_command(reply: &str) -> String {
    let without_ticks = reply.replace('`', "");
    let mut text = without_ticks.trim();
    if let Some(rest) = text.strip_prefix("vim") {
        if rest.starts_with('\n') || rest.starts_with("\r\n") {
            text = rest.trim_start();
        }
    }
    text.trim().trim_start_matches(':').trim_start().to_string()
}

pub fn error_feedback(error: &str) -> String {
    format!("Error: {error}. Please fix the command and try again.")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub command: String,
    pub attempts: u32,
}

pub struct Dispatcher<E, L> {
    editor: E,
    llm: L,
    history: History,
    max_attempts: Option<u32>,
    stop: Option<Arc<AtomicBool>>,
}

impl<E: Editor, L: LlmBackend> Dispatcher<E, L> {
    pub fn new(editor: E, llm: L, history: History) -> Self {
        Self {
            editor,
            llm,
            history,
            max_attempts: None,
            stop: None,
        }
    }

    /// Stop retrying after `max` execution attempts
    pub fn with_max_attempts(mut self, max: Option<u32>) -> Self {
        self.max_attempts = max;
        self
    }

    /// Abandon the retry loop when `flag` becomes true
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    fn stopped(&self) -> bool {
        self.stop.as_ref().is_some_and(|s| s.load(Ordering::SeqCst))
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn editor(&self) -> &E {
        &self.editor
    }

    pub fn handle(&mut self, transcript: &str, stats: &mut Stats) -> Result<Dispatched> {
        let lines = self
            .editor
            .buffer_lines()
            .context("reading the current buffer")?;
        let (row, col) = self.editor.cursor().context("reading the cursor")?;
        debug!(lines = lines.len(), row, col, "editor context");

        self.history
            .push(Message::user(user_prompt(&numbered_snippet(&lines), transcript)));

        let first = match stats.time(Stage::Complete, || {
            self.llm.complete(self.history.messages())
        }) {
            Ok(reply) => reply,
            Err(e) => {
                // Don't leave an unanswered turn behind
                self.history.pop();
                return Err(e).context("requesting a command");
            }
        };

        let mut pending = Some(first);
        let mut attempts = 0u32;
        loop {
            if self.stopped() {
                bail!("cancelled after {attempts} attempts");
            }
            attempts += 1;
            let reply = match pending.take() {
                Some(reply) => Ok(reply),
                None => stats.time(Stage::Complete, || {
                    self.llm.complete(self.history.messages())
                }),
            };

            let error = match reply {
                Ok(reply) => {
                    info!("Model response: {}", reply);
                    self.history.push(Message::assistant(reply.clone()));
                    self.history.save()?;
                    let command = sanitize_command(&reply);
                    println!("→ Executing: {}", command);
                    match stats.time(Stage::Execute, || self.editor.command(&command)) {
                        Ok(()) => return Ok(Dispatched { command, attempts }),
                        Err(e) => e.to_string(),
                    }
                }
                Err(e) => e.to_string(),
            };

            warn!(attempt = attempts, "Error executing command: {}", error);
            self.history.push(Message::assistant(error_feedback(&error)));
            self.history.save()?;

            if let Some(max) = self.max_attempts {
                if attempts >= max {
                    bail!("giving up after {attempts} attempts: {error}");
                }
            }
            stats.add_retries(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::EditorError;
    use crate::llm::{LlmError, Role};
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeEditor {
        lines: Vec<String>,
        /// Commands containing this text fail
        reject: Option<String>,
        executed: Vec<String>,
    }

    impl Editor for FakeEditor {
        fn buffer_lines(&mut self) -> Result<Vec<String>, EditorError> {
            Ok(self.lines.clone())
        }

        fn cursor(&mut self) -> Result<(i64, i64), EditorError> {
            Ok((1, 0))
        }

        fn command(&mut self, cmd: &str) -> Result<(), EditorError> {
            self.executed.push(cmd.to_string());
            match &self.reject {
                Some(bad) if cmd.contains(bad.as_str()) => Err(EditorError::Rpc(format!(
                    "Vim:E492: Not an editor command: {cmd}"
                ))),
                _ => Ok(()),
            }
        }
    }

    struct ScriptedLlm {
        replies: VecDeque<Result<String, LlmError>>,
        seen_turns: Vec<usize>,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            Self {
                replies: replies.into(),
                seen_turns: Vec::new(),
            }
        }
    }

    impl LlmBackend for ScriptedLlm {
        fn complete(&mut self, messages: &[Message]) -> Result<String, LlmError> {
            self.seen_turns.push(messages.len());
            self.replies.pop_front().unwrap_or(Err(LlmError::Empty))
        }
    }

    fn history() -> (tempfile::TempDir, History) {
        let dir = tempfile::tempdir().unwrap();
        let history = History::load(dir.path().join("history.json")).unwrap();
        (dir, history)
    }

    #[test]
    fn test_snippet_and_prompt() {
        let snippet = numbered_snippet(&["a".to_string(), "b".to_string()]);
        assert_eq!(snippet, "1: a\n2: b");
        let prompt = user_prompt(&snippet, "delete line two");
        assert!(prompt.starts_with("Here’s the code around your cursor:\n```vim\n1: a\n2: b\n```\n"));
        assert!(prompt.ends_with(
            "generate a single NVim Ex-command to “delete line two” (no backticks, no leading colon)."
        ));
    }

    #[test]
    fn test_sanitize_command() {
        assert_eq!(sanitize_command("```vim\n:2d\n```"), "2d");
        assert_eq!(sanitize_command(" `:w` "), "w");
        assert_eq!(sanitize_command("vimgrep /foo/ **"), "vimgrep /foo/ **");
        assert_eq!(sanitize_command("echo 'hi'"), "echo 'hi'");
    }

    #[test]
    fn test_success_on_first_attempt() {
        let (_dir, history) = history();
        let editor = FakeEditor {
            lines: vec!["let x = 1;".into()],
            ..Default::default()
        };
        let llm = ScriptedLlm::new(vec![Ok(":1d".into())]);
        let mut dispatcher = Dispatcher::new(editor, llm, history);
        let mut stats = Stats::default();

        let out = dispatcher.handle("delete it", &mut stats).unwrap();
        assert_eq!(
            out,
            Dispatched {
                command: "1d".into(),
                attempts: 1
            }
        );
        let turns = dispatcher.history().messages();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[1].role, Role::User);
        assert!(turns[1].content.contains("1: let x = 1;"));
        assert_eq!(turns[2], Message::assistant(":1d"));

        // persisted
        let reloaded = History::load(dispatcher.history().path()).unwrap();
        assert_eq!(reloaded.len(), 3);
        assert_eq!(stats.count(Stage::Complete), 1);
        assert_eq!(stats.count(Stage::Execute), 1);
    }

    #[test]
    fn test_execution_error_is_fed_back() {
        let (_dir, history) = history();
        let editor = FakeEditor {
            reject: Some("frob".into()),
            ..Default::default()
        };
        let llm = ScriptedLlm::new(vec![Ok("frob".into()), Ok("normal! dd".into())]);
        let mut dispatcher = Dispatcher::new(editor, llm, history);
        let mut stats = Stats::default();

        let out = dispatcher.handle("delete line", &mut stats).unwrap();
        assert_eq!(out.command, "normal! dd");
        assert_eq!(out.attempts, 2);
        assert_eq!(dispatcher.editor().executed, vec!["frob", "normal! dd"]);

        let turns = dispatcher.history().messages();
        // system, user, bad reply, error feedback, fixed reply
        assert_eq!(turns.len(), 5);
        assert_eq!(
            turns[3].content,
            "Error: Vim:E492: Not an editor command: frob. Please fix the command and try again."
        );
        assert_eq!(turns[4], Message::assistant("normal! dd"));
    }

    #[test]
    fn test_completion_error_in_retry_is_retried() {
        let (_dir, history) = history();
        let editor = FakeEditor {
            reject: Some("bad".into()),
            ..Default::default()
        };
        let llm = ScriptedLlm::new(vec![
            Ok("bad".into()),
            Err(LlmError::Empty),
            Ok("w".into()),
        ]);
        let mut dispatcher = Dispatcher::new(editor, llm, history);
        let out = dispatcher.handle("save", &mut Stats::default()).unwrap();
        assert_eq!(out.attempts, 3);
        assert_eq!(dispatcher.editor().executed, vec!["bad", "w"]);
    }

    #[test]
    fn test_max_attempts_gives_up() {
        let (_dir, history) = history();
        let editor = FakeEditor {
            reject: Some("nope".into()),
            ..Default::default()
        };
        let llm = ScriptedLlm::new(vec![Ok("nope".into()), Ok("nope 2".into()), Ok("w".into())]);
        let mut dispatcher = Dispatcher::new(editor, llm, history).with_max_attempts(Some(2));
        let err = dispatcher.handle("x", &mut Stats::default()).unwrap_err();
        assert!(err.to_string().contains("giving up after 2 attempts"));
        assert_eq!(dispatcher.editor().executed.len(), 2);
    }

    /// Replies once, then fails every call and raises `stop` on the third
    struct FlakyLlm {
        calls: usize,
        stop: Arc<AtomicBool>,
    }

    impl LlmBackend for FlakyLlm {
        fn complete(&mut self, _messages: &[Message]) -> Result<String, LlmError> {
            self.calls += 1;
            if self.calls == 3 {
                self.stop.store(true, Ordering::SeqCst);
            }
            if self.calls == 1 {
                Ok("frob".into())
            } else {
                Err(LlmError::Empty)
            }
        }
    }

    #[test]
    fn test_stop_flag_ends_unbounded_retries() {
        let (_dir, history) = history();
        let stop = Arc::new(AtomicBool::new(false));
        let editor = FakeEditor {
            reject: Some("frob".into()),
            ..Default::default()
        };
        let llm = FlakyLlm {
            calls: 0,
            stop: Arc::clone(&stop),
        };
        let mut dispatcher = Dispatcher::new(editor, llm, history).with_stop_flag(stop);

        let err = dispatcher.handle("x", &mut Stats::default()).unwrap_err();
        assert!(err.to_string().contains("cancelled after 3 attempts"));
        assert_eq!(dispatcher.llm.calls, 3);
        // system, user, reply, then one error turn per failed attempt
        assert_eq!(dispatcher.history().len(), 6);
    }

    #[test]
    fn test_first_completion_failure_drops_user_turn() {
        let (_dir, history) = history();
        let llm = ScriptedLlm::new(vec![Err(LlmError::Empty)]);
        let mut dispatcher = Dispatcher::new(FakeEditor::default(), llm, history);
        assert!(dispatcher.handle("x", &mut Stats::default()).is_err());
        assert_eq!(dispatcher.history().len(), 1);
        assert!(dispatcher.editor().executed.is_empty());
    }
}
