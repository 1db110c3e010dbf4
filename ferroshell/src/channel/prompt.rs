//! Prompt-based completion detection.
//!
//! A [`Prompt`] binds a pattern to one output stream plus a search cursor.
//! When a prompt is in use, a command is complete once the pattern shows up
//! past the cursor; the cursor then moves past that occurrence so it is
//! never matched twice. Without a pattern the channel falls back to
//! quiescence.
//!
//! Nested shells save and restore the prompt state through
//! [`PromptStack`].

use std::fmt;
use std::time::Duration;

use regex::bytes::Regex;

use super::StreamKind;
use super::patterns;

/// Longest keyword taken from an auto-detected prompt line.
const MAX_DETECTED_PROMPT: usize = 32;

/// Pattern + stream + cursor used to recognise a shell's ready signal.
#[derive(Clone)]
pub struct Prompt {
    keyword: Option<String>,
    pattern: Option<Regex>,
    stream: StreamKind,
    position: usize,
}

impl Prompt {
    /// A prompt with no pattern; completion falls back to quiescence.
    pub fn disabled(stream: StreamKind) -> Self {
        Self {
            keyword: None,
            pattern: None,
            stream,
            position: 0,
        }
    }

    /// A prompt matching `keyword` literally (case-insensitive).
    pub fn literal(keyword: &str, stream: StreamKind) -> Result<Self, regex::Error> {
        if keyword.is_empty() {
            return Ok(Self::disabled(stream));
        }
        Ok(Self {
            keyword: Some(keyword.to_string()),
            pattern: Some(patterns::compile_literal(keyword)?),
            stream,
            position: 0,
        })
    }

    /// A prompt matching a regular expression (case-insensitive).
    pub fn regex(pattern: &str, stream: StreamKind) -> Result<Self, regex::Error> {
        Ok(Self {
            keyword: Some(pattern.to_string()),
            pattern: Some(patterns::compile(pattern)?),
            stream,
            position: 0,
        })
    }

    pub fn keyword(&self) -> Option<&str> {
        self.keyword.as_deref()
    }

    pub fn pattern(&self) -> Option<&Regex> {
        self.pattern.as_ref()
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_enabled(&self) -> bool {
        self.pattern.is_some()
    }

    /// Move the cursor forward; it never moves back.
    pub(crate) fn advance_to(&mut self, position: usize) {
        self.position = self.position.max(position);
    }
}

impl PartialEq for Prompt {
    fn eq(&self, other: &Self) -> bool {
        self.keyword == other.keyword
            && self.stream == other.stream
            && self.position == other.position
    }
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Prompt {}:{:?},position={}>",
            self.stream, self.keyword, self.position
        )
    }
}

/// One saved synchronization mode.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptState {
    /// The prompt matcher.
    pub prompt: Prompt,

    /// Whether completion waits for the prompt (otherwise quiescence).
    pub use_prompt: bool,

    /// Default no-output interval for this shell level.
    pub interval: Duration,
}

impl PromptState {
    /// A quiescence-only state.
    pub fn quiescence(stream: StreamKind, interval: Duration) -> Self {
        Self {
            prompt: Prompt::disabled(stream),
            use_prompt: false,
            interval,
        }
    }

    /// Whether completion is detected through the prompt.
    pub fn is_armed(&self) -> bool {
        self.use_prompt && self.prompt.is_enabled()
    }
}

/// Current prompt state plus the parent states of enclosing shells.
#[derive(Debug)]
pub struct PromptStack {
    current: PromptState,
    saved: Vec<PromptState>,
}

impl PromptStack {
    /// Create a stack whose current state is `initial`.
    pub fn new(initial: PromptState) -> Self {
        Self {
            current: initial,
            saved: Vec::new(),
        }
    }

    /// Save the current state and install `state`.
    pub fn push(&mut self, state: PromptState) {
        let parent = std::mem::replace(&mut self.current, state);
        self.saved.push(parent);
    }

    /// Restore the previously saved state, returning the one replaced.
    ///
    /// Popping an empty stack leaves the current state untouched.
    pub fn pop(&mut self) -> Option<PromptState> {
        let parent = self.saved.pop()?;
        Some(std::mem::replace(&mut self.current, parent))
    }

    pub fn current(&self) -> &PromptState {
        &self.current
    }

    pub fn current_mut(&mut self) -> &mut PromptState {
        &mut self.current
    }

    /// Number of saved parent states.
    pub fn depth(&self) -> usize {
        self.saved.len()
    }
}

/// Best-guess prompt keyword: the trailing part of the last non-empty line.
pub fn detect_prompt(text: &str) -> Option<String> {
    let line = text.lines().rev().map(str::trim).find(|l| !l.is_empty())?;

    let mut start = line.len().saturating_sub(MAX_DETECTED_PROMPT);
    while !line.is_char_boundary(start) {
        start += 1;
    }
    let keyword = line[start..].trim_start();
    (!keyword.is_empty()).then(|| keyword.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_prompt() {
        let prompt = Prompt::literal("mysql>", StreamKind::Stdout).unwrap();
        assert!(prompt.is_enabled());
        assert!(prompt.pattern().unwrap().is_match(b"MySQL> "));
        assert_eq!(prompt.keyword(), Some("mysql>"));

        let empty = Prompt::literal("", StreamKind::Stdout).unwrap();
        assert!(!empty.is_enabled());
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let mut prompt = Prompt::literal("$", StreamKind::Stderr).unwrap();
        prompt.advance_to(10);
        prompt.advance_to(4);
        assert_eq!(prompt.position(), 10);
        assert_eq!(prompt.stream(), StreamKind::Stderr);
    }

    #[test]
    fn test_push_pop_restores_exact_state() {
        let mut outer = Prompt::literal(">>>", StreamKind::Stdout).unwrap();
        outer.advance_to(17);
        let before = PromptState {
            prompt: outer,
            use_prompt: true,
            interval: Duration::from_millis(500),
        };
        let mut stack = PromptStack::new(before.clone());

        stack.push(PromptState::quiescence(StreamKind::Stdout, Duration::from_secs(1)));
        assert_eq!(stack.depth(), 1);
        assert!(!stack.current().is_armed());

        stack.current_mut().prompt.advance_to(99);
        let popped = stack.pop().unwrap();
        assert_eq!(popped.prompt.position(), 99);
        assert_eq!(stack.current(), &before);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_pop_empty_stack() {
        let initial = PromptState::quiescence(StreamKind::Stderr, Duration::from_millis(500));
        let mut stack = PromptStack::new(initial.clone());
        assert!(stack.pop().is_none());
        assert_eq!(stack.current(), &initial);
    }

    #[test]
    fn test_detect_prompt() {
        assert_eq!(
            detect_prompt("Python 3.12.1\nType help\n>>> "),
            Some(">>>".to_string())
        );
        assert_eq!(detect_prompt("mysql> \n\n"), Some("mysql>".to_string()));
        assert_eq!(detect_prompt("   \n\n"), None);

        let long = format!("{}$", "x".repeat(100));
        let detected = detect_prompt(&long).unwrap();
        assert_eq!(detected.len(), MAX_DETECTED_PROMPT);
        assert!(detected.ends_with('$'));
    }
}
