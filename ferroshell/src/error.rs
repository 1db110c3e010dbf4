//! Error types for ferroshell.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Main error type for ferroshell operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level errors (SSH session, local process, reader task)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel operation errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// A command exited non-zero while careful mode was on
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Nested console entry/exit errors
    #[error("Console error: {0}")]
    Console(#[from] ConsoleError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Exit code carried by a careful-mode command failure.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::Command(CommandError::Failed { code, .. }) => Some(*code),
            _ => None,
        }
    }

    /// Whether this error is a wait/expect deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Channel(ChannelError::Timeout { .. }))
    }
}

/// Transport layer errors (SSH connection, process spawn, raw I/O).
#[derive(Error, Debug)]
pub enum TransportError {
    /// Failed to connect to host
    #[error("Connection failed to {host}:{port}: {source}")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// SSH handshake or protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Authentication failed
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// SSH key error
    #[error("SSH key error: {0}")]
    Key(String),

    /// Host is not present in known_hosts (strict verification)
    #[error("Host key for {host}:{port} is not known")]
    HostKeyUnknown { host: String, port: u16 },

    /// Host key does not match the known_hosts entry
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged { host: String, port: u16, line: usize },

    /// known_hosts could not be read or written
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// Failed to start a local process
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The transport was already closed
    #[error("Transport closed")]
    Closed,

    /// The background reader hit an unexpected I/O error
    #[error("Reader failed: {0}")]
    ReaderFailed(String),

    /// Operation timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Channel layer errors (waiting, pattern matching, shell setup).
#[derive(Error, Debug)]
pub enum ChannelError {
    /// A wait or expect deadline elapsed
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
    },

    /// Channel closed
    #[error("Channel closed")]
    Closed,

    /// Invalid regex pattern
    #[error("Invalid regex pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

impl ChannelError {
    pub(crate) fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        ChannelError::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

/// Command failures surfaced by careful mode.
#[derive(Error, Debug)]
pub enum CommandError {
    /// Non-zero exit code; the message is the command's stderr.
    #[error("{stderr}")]
    Failed { code: i32, stderr: String },
}

/// Nested console (privilege elevation, sub-shell, interactive program) errors.
#[derive(Error, Debug)]
pub enum ConsoleError {
    /// The credential prompt came back after a credential was sent
    #[error("Unable to enter '{command}': \"{prompt}\" was prompted")]
    LoginFailed { command: String, prompt: String },

    /// A credential was requested but none was supplied
    #[error("'{command}' asked for a password (\"{prompt}\") but none was given")]
    PasswordRequired { command: String, prompt: String },

    /// The ready signal of an interactive program never appeared
    #[error("'{command}' failed: \"{expected}\" did not show up")]
    NotReady { command: String, expected: String },
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A configuration value could not be parsed
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    /// A required builder field was not set
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Result type alias using ferroshell's Error.
pub type Result<T> = std::result::Result<T, Error>;
