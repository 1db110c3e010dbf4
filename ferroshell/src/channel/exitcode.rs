//! Exit-code marker protocol.
//!
//! A plain byte stream carries no exit status, so after a command the
//! channel sends `echo __exitcode<N>--$?--` and reads the number back out of
//! the output. `N` rotates through a small pool on every probe so a stale
//! marker from an earlier, still-running command is not mistaken for the
//! current answer.

use regex::bytes::Regex;

use super::patterns;

/// Exit code meaning "unknown".
pub const UNKNOWN_EXIT: i32 = -1;

/// Prefix shared by every marker line.
pub(crate) const MARKER_PREFIX: &[u8] = b"__exitcode";

/// Number of distinct marker indices.
const MARKER_POOL: u8 = 10;

/// How a shell exposes the last exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShellFlavor {
    /// `$?` (sh, bash, zsh, dash, ksh, ...)
    #[default]
    Posix,

    /// `$status` (fish, csh, tcsh)
    Status,
}

impl ShellFlavor {
    /// Guess the flavor from a shell command line such as `/usr/bin/fish -l`.
    pub fn from_shell(command: &str) -> Self {
        let program = command.split_whitespace().next().unwrap_or_default();
        let name = program.rsplit('/').next().unwrap_or(program);
        match name {
            "fish" | "csh" | "tcsh" => ShellFlavor::Status,
            _ => ShellFlavor::Posix,
        }
    }

    /// The shell variable holding the last exit status.
    pub fn exit_variable(self) -> &'static str {
        match self {
            ShellFlavor::Posix => "$?",
            ShellFlavor::Status => "$status",
        }
    }
}

/// A single marker probe: the command to send and the pattern answering it.
#[derive(Debug, Clone)]
pub struct MarkerProbe {
    /// Rotating marker index.
    pub index: u8,

    /// Line to send (newline-terminated).
    pub command: String,

    /// Pattern with one capture group for the digits.
    pub pattern: Regex,
}

/// Rotating source of marker probes.
#[derive(Debug, Default)]
pub struct ExitcodeMarker {
    next: u8,
}

impl ExitcodeMarker {
    /// Create a marker starting at index 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the next probe and rotate the index.
    pub fn next_probe(&mut self, flavor: ShellFlavor) -> MarkerProbe {
        let index = self.next;
        self.next = (self.next + 1) % MARKER_POOL;

        MarkerProbe {
            index,
            command: format!("echo __exitcode{}--{}--\n", index, flavor.exit_variable()),
            // constant shape, only the digit varies
            pattern: patterns::compile(&format!(r"__exitcode{}--(\d+)--", index))
                .expect("marker pattern is valid"),
        }
    }
}

/// Parse the captured digits; anything unparsable is unknown.
pub fn parse_exitcode(digits: Option<&str>) -> i32 {
    digits
        .and_then(|d| d.trim().parse::<i32>().ok())
        .unwrap_or(UNKNOWN_EXIT)
}

/// Whether an output line is a marker echo or answer.
pub(crate) fn is_marker_line(line: &[u8]) -> bool {
    memchr::memmem::find(line, MARKER_PREFIX).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flavor_from_shell() {
        assert_eq!(ShellFlavor::from_shell("/bin/bash"), ShellFlavor::Posix);
        assert_eq!(ShellFlavor::from_shell("/usr/bin/fish -l"), ShellFlavor::Status);
        assert_eq!(ShellFlavor::from_shell("tcsh"), ShellFlavor::Status);
        assert_eq!(ShellFlavor::from_shell(""), ShellFlavor::Posix);
    }

    #[test]
    fn test_probe_rotation() {
        let mut marker = ExitcodeMarker::new();
        let indices: Vec<u8> = (0..12)
            .map(|_| marker.next_probe(ShellFlavor::Posix).index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0, 1]);
    }

    #[test]
    fn test_probe_shape() {
        let mut marker = ExitcodeMarker::new();
        marker.next_probe(ShellFlavor::Posix);
        let probe = marker.next_probe(ShellFlavor::Status);

        assert_eq!(probe.command, "echo __exitcode1--$status--\n");
        assert!(probe.pattern.is_match(b"__exitcode1--127--"));
        // The echoed command itself must not satisfy the pattern
        assert!(!probe.pattern.is_match(probe.command.as_bytes()));
        // Nor must another index's answer
        assert!(!probe.pattern.is_match(b"__exitcode0--0--"));
    }

    #[test]
    fn test_parse_exitcode() {
        assert_eq!(parse_exitcode(Some("7")), 7);
        assert_eq!(parse_exitcode(Some("x")), UNKNOWN_EXIT);
        assert_eq!(parse_exitcode(None), UNKNOWN_EXIT);
    }

    #[test]
    fn test_is_marker_line() {
        assert!(is_marker_line(b"__exitcode4--0--"));
        assert!(is_marker_line(b"$ echo __exitcode4--$?--"));
        assert!(!is_marker_line(b"exitcode"));
    }
}
