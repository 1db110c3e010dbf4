//! Sessions: where commands run and how.
//!
//! A [`Session`] is bound to a target, the local machine or one SSH
//! connection, and offers three ways to run things:
//!
//! - [`exec`](Session::exec): every line is its own process, no shell state
//!   carried between lines.
//! - [`run_script`](Session::run_script): all lines go through one
//!   persistent shell which is closed afterwards.
//! - [`shell`](Session::shell): a live [`Channel`] for the caller to drive.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};
use tokio::process::Command;

use super::CommandResult;
use crate::channel::{Channel, OutputMask, SendOptions, Shared, StreamKind, UNKNOWN_EXIT, echo_for};
use crate::config::EngineConfig;
use crate::error::{CommandError, Result, TransportError};
use crate::transport::{SshTransport, exit_code};

/// Where a session runs its commands.
pub(crate) enum Target {
    Local,
    Remote(Arc<SshTransport>),
}

/// Handle for running commands on one host.
pub struct Session {
    target: Target,
    config: EngineConfig,
    careful: AtomicBool,
}

impl Session {
    pub(crate) fn new(target: Target, config: EngineConfig, careful: bool) -> Self {
        Self {
            target,
            config,
            careful: AtomicBool::new(careful),
        }
    }

    /// Local session with the given config.
    pub fn local(config: EngineConfig) -> Self {
        Self::new(Target::Local, config, false)
    }

    /// Session over an established SSH connection.
    pub fn remote(transport: SshTransport, config: EngineConfig) -> Self {
        Self::new(Target::Remote(Arc::new(transport)), config, false)
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.target, Target::Remote(_))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Raise on non-zero exit codes. Channels opened afterwards inherit it.
    pub fn set_careful(&self, careful: bool) {
        self.careful.store(careful, Ordering::SeqCst);
    }

    pub fn is_careful(&self) -> bool {
        self.careful.load(Ordering::SeqCst)
    }

    fn tag(&self) -> &str {
        match &self.target {
            Target::Local => "local",
            Target::Remote(transport) => transport.host(),
        }
    }

    /// Run each line of `commands` as a separate process.
    ///
    /// Blank lines and `#` comments are skipped. Output accumulates across
    /// lines; the exit code is the last line's. In careful mode the first
    /// non-zero exit stops the run with [`CommandError::Failed`].
    pub async fn exec(&self, commands: &str) -> Result<CommandResult> {
        let shared = Shared::new(self.tag(), echo_for(&self.config));
        shared.begin_command(OutputMask::BOTH);

        for command in commands
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
        {
            let (stdout, stderr, code) = match &self.target {
                Target::Local => self.exec_local(command).await?,
                Target::Remote(transport) => {
                    let output = transport
                        .exec(command, self.config.remote_timeout)
                        .await?;
                    let code = output.exit_status.map_or(UNKNOWN_EXIT, |c| c as i32);
                    (output.stdout, output.stderr, code)
                }
            };
            debug!("[{}] exec {:?} exited {}", self.tag(), command, code);

            shared.add_data(StreamKind::Stdout, &stdout);
            shared.add_data(StreamKind::Stderr, &stderr);
            shared.flush_pending();
            shared.set_exitcode(code);

            if code > 0 && self.is_careful() {
                return Err(CommandError::Failed {
                    code,
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                }
                .into());
            }
        }

        Ok(CommandResult::new(
            &shared.all_text(StreamKind::Stdout),
            &shared.all_text(StreamKind::Stderr),
            shared.exitcode(),
        ))
    }

    async fn exec_local(&self, command: &str) -> Result<(Vec<u8>, Vec<u8>, i32)> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                program: "sh".to_string(),
                source,
            })?;

        let timeout = self.config.local_timeout;
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(TransportError::Io)?;
        Ok((output.stdout, output.stderr, exit_code(&output.status)))
    }

    /// Run a script through one persistent shell and return the transcript.
    ///
    /// A first line of the form `#!<shell>` selects the shell; otherwise the
    /// configured one is used. The shell is closed afterwards, so the exit
    /// code is the shell's final status.
    pub async fn run_script(&self, script: &str) -> Result<CommandResult> {
        let (shell, body) = split_shebang(script);
        let channel = self.shell(shell).await?;

        let sent = channel.sendline(body, SendOptions::new()).await;
        let closed = channel.close().await;
        sent?;
        closed
    }

    /// Open a persistent shell.
    ///
    /// `None` starts the configured local shell, or the login shell (with a
    /// pty) on a remote host. The caller owns the channel and must close it.
    pub async fn shell(&self, shell: Option<&str>) -> Result<Channel> {
        let channel = match (&self.target, shell) {
            (Target::Local, None) => Channel::local(&self.config).await?,
            (Target::Local, Some(shell)) => Channel::local_with_shell(&self.config, shell).await?,
            (Target::Remote(transport), None) => Channel::remote(transport, &self.config).await?,
            (Target::Remote(transport), Some(shell)) => {
                Channel::remote_with_shell(transport, &self.config, shell).await?
            }
        };
        channel.set_careful(self.is_careful());
        Ok(channel)
    }

    /// Disconnect a remote session. Local sessions have nothing to close.
    pub async fn close(&self) -> Result<()> {
        if let Target::Remote(transport) = &self.target {
            info!("[{}] closing session", transport.host());
            transport.close().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.tag())
            .field("careful", &self.is_careful())
            .finish()
    }
}

/// Split a leading `#!shell` line off a script.
fn split_shebang(script: &str) -> (Option<&str>, &str) {
    let trimmed = script.trim_start();
    match trimmed.strip_prefix("#!") {
        Some(rest) => {
            let (line, body) = rest.split_once('\n').unwrap_or((rest, ""));
            let shell = line.trim();
            ((!shell.is_empty()).then_some(shell), body)
        }
        None => (None, script),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_shebang() {
        assert_eq!(
            split_shebang("#!/bin/sh -i\necho hi\n"),
            (Some("/bin/sh -i"), "echo hi\n")
        );
        assert_eq!(split_shebang("\n  #!bash"), (Some("bash"), ""));
        assert_eq!(split_shebang("echo hi\n"), (None, "echo hi\n"));
        assert_eq!(split_shebang("#!\necho"), (None, "echo"));
    }

    #[test]
    fn test_careful_flag() {
        let session = Session::local(EngineConfig::default());
        assert!(!session.is_careful());
        session.set_careful(true);
        assert!(session.is_careful());
        assert!(!session.is_remote());
    }
}
