//! Nested consoles: privilege elevation and sub-shells.
//!
//! Entering a nested console saves the channel's prompt state, runs the
//! entry command (answering a credential prompt when one shows up) and
//! hands back a [`NestedConsole`] guard. Commands sent while the guard is
//! alive run inside the nested shell; [`NestedConsole::exit`] leaves it and
//! restores the saved prompt state.

use std::ops::Deref;
use std::time::Duration;

use log::{debug, info, warn};
use secrecy::{ExposeSecret, SecretString};

use crate::channel::patterns::{self, ExpectMatch};
use crate::channel::{Channel, EXITCODE_TIMEOUT, ExpectOptions, PromptState, SendOptions, SendState};
use crate::driver::CommandResult;
use crate::error::{ChannelError, ConsoleError, Result};

/// Entry command for `sudo` when none is configured.
pub const DEFAULT_SUDO_COMMAND: &str = r"\sudo --stdin su";

/// Pattern recognised as a credential request.
pub const DEFAULT_AUTH_PATTERN: &str = "password";

/// Patterns that, seen after the credential was sent, mean it was refused.
pub const DEFAULT_FAILURE_PATTERNS: [&str; 2] = ["password", "sorry"];

const AUTH_TIMEOUT: Duration = Duration::from_secs(2);
const STTY_SETTLE: Duration = Duration::from_millis(250);
const EXIT_SETTLE: Duration = Duration::from_secs(1);

/// How to log in to a nested shell.
///
/// # Example
///
/// ```rust,no_run
/// use ferroshell::Elevation;
///
/// let elevation = Elevation::new()
///     .password("s3cret")
///     .init_command("cd /var/log");
/// ```
#[derive(Debug)]
pub struct Elevation {
    password: Option<SecretString>,
    command: Option<String>,
    init_commands: Vec<String>,
    auth_pattern: String,
    failure_patterns: Vec<String>,
    auth_timeout: Duration,
    nested_shell: Option<String>,
}

impl Default for Elevation {
    fn default() -> Self {
        Self {
            password: None,
            command: None,
            init_commands: Vec::new(),
            auth_pattern: DEFAULT_AUTH_PATTERN.to_string(),
            failure_patterns: DEFAULT_FAILURE_PATTERNS.iter().map(|p| p.to_string()).collect(),
            auth_timeout: AUTH_TIMEOUT,
            nested_shell: None,
        }
    }
}

impl Elevation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credential sent when the auth pattern shows up. Never logged.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(password.into()));
        self
    }

    /// Override the entry command.
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Command run inside the nested shell right after entry.
    pub fn init_command(mut self, command: impl Into<String>) -> Self {
        self.init_commands.push(command.into());
        self
    }

    pub fn auth_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.auth_pattern = pattern.into();
        self
    }

    pub fn failure_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failure_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// How long to wait for the credential prompt, and for a refusal.
    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Name of the shell that will run inside (`dash` skips `stty -echo`).
    pub fn nested_shell(mut self, shell: impl Into<String>) -> Self {
        self.nested_shell = Some(shell.into());
        self
    }

    fn wants_stty(&self) -> bool {
        !self
            .nested_shell
            .as_deref()
            .is_some_and(|shell| shell.rsplit('/').next() == Some("dash"))
    }
}

/// Guard for a nested console on a [`Channel`].
///
/// Dereferences to the channel, so commands are sent through it as usual.
/// Call [`exit`](Self::exit) to leave; dropping the guard leaves the shell
/// running and only logs a warning.
#[derive(Debug)]
pub struct NestedConsole<'a> {
    channel: &'a Channel,
    command: String,
    exit_input: String,
    restore_check_exitcode: Option<bool>,
    exited: bool,
}

impl<'a> NestedConsole<'a> {
    pub(crate) fn new(
        channel: &'a Channel,
        command: String,
        exit_input: String,
        restore_check_exitcode: Option<bool>,
    ) -> Self {
        Self {
            channel,
            command,
            exit_input,
            restore_check_exitcode,
            exited: false,
        }
    }

    /// The command that opened this console.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn channel(&self) -> &'a Channel {
        self.channel
    }

    /// Leave the nested console and restore the outer prompt state.
    ///
    /// Returns the output produced while leaving, with the exit code of the
    /// nested shell when the outer shell reports one.
    pub async fn exit(mut self) -> Result<CommandResult> {
        self.exited = true;
        let channel = self.channel;
        let mut state = channel.lock_state().await;

        state.prompts.pop();
        if let Some(check) = self.restore_check_exitcode {
            state.check_exitcode = check;
        }
        info!("[{}] leaving {}", channel.tag(), self.command);

        channel.reset_buffers();
        channel.send(&self.exit_input).await?;
        let interval = state.prompts.current().interval;
        channel.settle(interval).await?;

        if state.check_exitcode {
            channel.probe_exitcode(&mut state, EXITCODE_TIMEOUT).await?;
        }
        channel.settle(EXIT_SETTLE).await?;
        Ok(channel.result())
    }
}

impl Deref for NestedConsole<'_> {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        self.channel
    }
}

impl Drop for NestedConsole<'_> {
    fn drop(&mut self) {
        if !self.exited {
            warn!(
                "[{}] nested console '{}' dropped without exit()",
                self.channel.tag(),
                self.command
            );
        }
    }
}

impl Channel {
    /// Become root through `sudo` (default entry command
    /// `\sudo --stdin su`).
    pub async fn sudo(&self, elevation: Elevation) -> Result<NestedConsole<'_>> {
        let command = elevation
            .command
            .clone()
            .unwrap_or_else(|| DEFAULT_SUDO_COMMAND.to_string());
        self.enter_console(command, elevation, true).await
    }

    /// Switch user through `su` (default entry command `\su <user>`).
    pub async fn su(&self, user: &str, elevation: Elevation) -> Result<NestedConsole<'_>> {
        let command = elevation
            .command
            .clone()
            .unwrap_or_else(|| format!(r"\su {}", user));
        self.enter_console(command, elevation, true).await
    }

    /// Start a nested shell that needs no credentials (`bash`, `sh -i`,
    /// `ssh otherhost` with keys, ...).
    pub async fn subshell(&self, command: &str) -> Result<NestedConsole<'_>> {
        self.enter_console(command.to_string(), Elevation::new(), false)
            .await
    }

    /// Like [`subshell`](Self::subshell) with login options.
    pub async fn subshell_with(
        &self,
        command: &str,
        elevation: Elevation,
        expect_credentials: bool,
    ) -> Result<NestedConsole<'_>> {
        self.enter_console(command.to_string(), elevation, expect_credentials)
            .await
    }

    async fn enter_console(
        &self,
        command: String,
        elevation: Elevation,
        expect_credentials: bool,
    ) -> Result<NestedConsole<'_>> {
        let mut state = self.lock_state().await;
        let current = state.prompts.current();
        let login_state = PromptState::quiescence(current.prompt.stream(), current.interval);
        state.prompts.push(login_state);
        self.reset_buffers();

        info!("[{}] entering {}", self.tag(), command);
        if let Err(e) = self
            .login(&mut state, &command, &elevation, expect_credentials)
            .await
        {
            state.prompts.pop();
            return Err(e);
        }

        Ok(NestedConsole::new(self, command, "exit\n".to_string(), None))
    }

    async fn login(
        &self,
        state: &mut SendState,
        command: &str,
        elevation: &Elevation,
        expect_credentials: bool,
    ) -> Result<()> {
        self.send(&format!("{}\n", command)).await?;

        if expect_credentials {
            if let Some(prompted) = self
                .expect(
                    &[&elevation.auth_pattern],
                    ExpectOptions::new().timeout(elevation.auth_timeout).silent(),
                )
                .await?
            {
                self.answer_credential(command, elevation, prompted).await?;
            } else {
                debug!("[{}] no credential prompt for {}", self.tag(), command);
            }
        }

        let interval = state.prompts.current().interval;
        self.settle(interval).await?;

        if elevation.wants_stty() && self.echoes_input() {
            self.send("stty -echo\n").await?;
            self.settle(STTY_SETTLE).await?;
        }
        for init in &elevation.init_commands {
            self.sendline_locked(state, init, &SendOptions::new()).await?;
        }
        Ok(())
    }

    async fn answer_credential(
        &self,
        command: &str,
        elevation: &Elevation,
        prompted: ExpectMatch,
    ) -> Result<()> {
        let Some(password) = &elevation.password else {
            return Err(ConsoleError::PasswordRequired {
                command: command.to_string(),
                prompt: prompted.text,
            }
            .into());
        };

        self.reset_buffers();
        debug!("[{}] sending credential", self.tag());
        self.send(&format!("{}\n", password.expose_secret())).await?;

        let failures =
            patterns::compile_all(&elevation.failure_patterns).map_err(ChannelError::from)?;
        let refused = self
            .expect_regex(
                &failures,
                ExpectOptions::new().timeout(elevation.auth_timeout).silent(),
            )
            .await?;
        match refused {
            Some(refused) => Err(ConsoleError::LoginFailed {
                command: command.to_string(),
                prompt: refused.text,
            }
            .into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elevation_defaults() {
        let elevation = Elevation::new();
        assert_eq!(elevation.auth_pattern, "password");
        assert_eq!(elevation.failure_patterns, vec!["password", "sorry"]);
        assert_eq!(elevation.auth_timeout, Duration::from_secs(2));
        assert!(elevation.password.is_none());
        assert!(elevation.wants_stty());
    }

    #[test]
    fn test_dash_skips_stty() {
        assert!(!Elevation::new().nested_shell("/bin/dash").wants_stty());
        assert!(Elevation::new().nested_shell("bash").wants_stty());
    }

    #[test]
    fn test_password_not_in_debug() {
        let elevation = Elevation::new().password("hunter2");
        assert!(!format!("{:?}", elevation).contains("hunter2"));
    }
}
