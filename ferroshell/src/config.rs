//! Engine configuration.
//!
//! The knobs mirror the environment variables scripts already use to tune
//! command pacing: quiescence intervals, completion timeouts, pty usage and
//! verbose echo. Nothing here is persisted; a config is read once and handed
//! to each session.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Tunables consumed by channels and sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Silence that signals "command probably finished" on local channels.
    #[serde(with = "seconds")]
    pub local_interval: Duration,

    /// Silence that signals "command probably finished" on remote channels.
    #[serde(with = "seconds")]
    pub remote_interval: Duration,

    /// Hard ceiling on waiting for a local command.
    #[serde(with = "seconds")]
    pub local_timeout: Duration,

    /// Hard ceiling on waiting for a remote command.
    #[serde(with = "seconds")]
    pub remote_timeout: Duration,

    /// Use plain pipes instead of pseudo-terminals for local processes.
    pub no_pty: bool,

    /// Echo captured output lines to this process's stdout/stderr.
    pub verbose: bool,

    /// Prefix for echoed stdout lines.
    pub stdout_prefix: String,

    /// Prefix for echoed stderr lines.
    pub stderr_prefix: String,

    /// Shell used for local persistent sessions.
    pub shell: Option<String>,

    /// Extra arguments appended to the local shell command.
    pub shell_args: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_interval: Duration::from_millis(500),
            remote_interval: Duration::from_millis(500),
            local_timeout: Duration::from_secs(60),
            remote_timeout: Duration::from_secs(60),
            no_pty: false,
            verbose: false,
            stdout_prefix: "| ".to_string(),
            stderr_prefix: "- ".to_string(),
            shell: None,
            shell_args: None,
        }
    }
}

impl EngineConfig {
    /// Build a config from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("CMD_INTERVAL") {
            config.local_interval = parse_seconds("CMD_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("SSH_CMD_INTERVAL") {
            config.remote_interval = parse_seconds("SSH_CMD_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("CMD_TIMEOUT") {
            config.local_timeout = parse_seconds("CMD_TIMEOUT", &v)?;
            config.remote_timeout = config.local_timeout;
        }
        if let Some(v) = lookup("SSH_CMD_TIMEOUT") {
            config.remote_timeout = parse_seconds("SSH_CMD_TIMEOUT", &v)?;
        }

        config.no_pty = lookup("NO_PTY").is_some_and(|v| !v.is_empty());
        config.verbose = lookup("VERBOSE").is_some_and(|v| !v.is_empty());

        if let Some(v) = lookup("VERBOSE_STDOUT_PREFIX") {
            config.stdout_prefix = v;
        }
        if let Some(v) = lookup("VERBOSE_STDERR_PREFIX") {
            config.stderr_prefix = v;
        }

        config.shell = lookup("SHELL").filter(|v| !v.is_empty());
        config.shell_args = lookup("SHELL_ARGUMENTS").filter(|v| !v.trim().is_empty());

        Ok(config)
    }

    /// Quiescence interval for a local or remote channel.
    pub fn interval(&self, remote: bool) -> Duration {
        if remote {
            self.remote_interval
        } else {
            self.local_interval
        }
    }

    /// Completion timeout for a local or remote channel.
    pub fn timeout(&self, remote: bool) -> Duration {
        if remote {
            self.remote_timeout
        } else {
            self.local_timeout
        }
    }

    /// The local shell command line, including `shell_args`.
    pub fn local_shell(&self) -> String {
        let shell = self.shell.clone().unwrap_or_else(default_shell);
        match &self.shell_args {
            Some(args) => format!("{} {}", shell, args.trim()),
            None => shell,
        }
    }
}

fn default_shell() -> String {
    for candidate in ["/bin/bash", "/usr/bin/bash", "/usr/local/bin/bash"] {
        if Path::new(candidate).exists() {
            return candidate.to_string();
        }
    }
    "/bin/sh".to_string()
}

fn parse_seconds(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| {
            ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            }
            .into()
        })
}

/// Durations as fractional seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
