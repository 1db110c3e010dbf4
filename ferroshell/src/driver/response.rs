//! Result type for command execution.

use crate::channel::UNKNOWN_EXIT;

/// Output of a command (or a whole session transcript).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Captured stdout, `\r\n` normalised to `\n`.
    pub stdout: String,

    /// Captured stderr, `\r\n` normalised to `\n`.
    pub stderr: String,

    /// Exit code, or -1 when unknown.
    pub exitcode: i32,
}

impl CommandResult {
    pub fn new(stdout: &str, stderr: &str, exitcode: i32) -> Self {
        Self {
            stdout: normalize(stdout),
            stderr: normalize(stderr),
            exitcode,
        }
    }

    /// A result with no output and an unknown exit code.
    pub fn empty() -> Self {
        Self::new("", "", UNKNOWN_EXIT)
    }

    /// Exit code is zero.
    pub fn is_success(&self) -> bool {
        self.exitcode == 0
    }

    /// Whether the exit code is known.
    pub fn has_exitcode(&self) -> bool {
        self.exitcode != UNKNOWN_EXIT
    }

    /// Stdout lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }

    /// Check if stdout contains a substring.
    pub fn contains(&self, pattern: &str) -> bool {
        self.stdout.contains(pattern)
    }
}

impl Default for CommandResult {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Display for CommandResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stdout)
    }
}

fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n")
}
