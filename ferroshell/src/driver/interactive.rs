//! Entering interactive programs (REPLs, database clients, menus).
//!
//! Unlike a nested shell, an interactive program has its own ready signal
//! and its own way out. [`InteractiveProgram`] describes both: an optional
//! pattern that must show up after launch, optional input (for example a
//! password) with patterns that mean the input was refused, the prompt used
//! to detect completion of later commands, and the terminator sent on exit.
//!
//! # Example
//!
//! ```rust,no_run
//! use ferroshell::{Channel, InteractiveProgram, SendOptions};
//!
//! # async fn example(channel: &Channel) -> Result<(), ferroshell::Error> {
//! let program = InteractiveProgram::new("python3 -i -q")
//!     .terminator("exit()\n")
//!     .prompt(">>>");
//! let python = channel.enter(program).await?;
//! let result = python.sendline("print(6 * 7)", SendOptions::new()).await?;
//! assert!(result.stdout.contains("42"));
//! python.exit().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use log::{debug, info};
use secrecy::{ExposeSecret, SecretString};

use super::privilege::NestedConsole;
use crate::channel::{Channel, ExpectOptions, Prompt, PromptState, SendState, StreamKind};
use crate::error::{ConsoleError, Result};

/// Default terminator: Ctrl-D.
pub const DEFAULT_TERMINATOR: &str = "\x04";

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const INPUT_SETTLE: Duration = Duration::from_millis(500);
const REFUSAL_TIMEOUT: Duration = Duration::from_secs(1);
const LAUNCH_SETTLE: Duration = Duration::from_secs(1);

/// Description of an interactive program to enter.
#[derive(Debug)]
pub struct InteractiveProgram {
    command: String,
    ready_pattern: Option<String>,
    ready_timeout: Duration,
    input: Option<SecretString>,
    failure_patterns: Vec<String>,
    prompt: Option<String>,
    prompt_stream: StreamKind,
    terminator: String,
}

impl InteractiveProgram {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ready_pattern: None,
            ready_timeout: READY_TIMEOUT,
            input: None,
            failure_patterns: Vec::new(),
            prompt: None,
            prompt_stream: StreamKind::Stdout,
            terminator: DEFAULT_TERMINATOR.to_string(),
        }
    }

    /// Pattern that must appear after launch (e.g. `Password:`).
    pub fn expect(mut self, pattern: impl Into<String>) -> Self {
        self.ready_pattern = Some(pattern.into());
        self
    }

    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Line sent once the ready pattern was seen. Never logged.
    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(SecretString::from(input.into()));
        self
    }

    /// Patterns that, seen after the input, mean it was refused.
    pub fn failure_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failure_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// The program's prompt, matched literally on stdout. Auto-detected
    /// when not given.
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Stream the prompt is printed on.
    pub fn prompt_stream(mut self, stream: StreamKind) -> Self {
        self.prompt_stream = stream;
        self
    }

    /// What to send to leave the program (sent verbatim).
    pub fn terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }
}

impl Channel {
    /// Launch an interactive program and return a console bound to it.
    ///
    /// Exit-code probing is off while inside (programs other than shells
    /// cannot answer the marker) and comes back on exit.
    pub async fn enter(&self, program: InteractiveProgram) -> Result<NestedConsole<'_>> {
        let mut state = self.lock_state().await;
        let current = state.prompts.current();
        let launch_state = PromptState::quiescence(current.prompt.stream(), current.interval);
        state.prompts.push(launch_state);
        self.reset_buffers();

        info!("[{}] entering {}", self.tag(), program.command);
        if let Err(e) = self.launch(&mut state, &program).await {
            state.prompts.pop();
            return Err(e);
        }

        let saved_check = std::mem::replace(&mut state.check_exitcode, false);
        Ok(NestedConsole::new(
            self,
            program.command,
            program.terminator,
            Some(saved_check),
        ))
    }

    async fn launch(&self, state: &mut SendState, program: &InteractiveProgram) -> Result<()> {
        let before_launch = self.output_mark();
        self.send(&format!("{}\n", program.command)).await?;

        match &program.ready_pattern {
            Some(pattern) => {
                let ready = self
                    .expect(
                        &[pattern],
                        ExpectOptions::new().timeout(program.ready_timeout).silent(),
                    )
                    .await?;
                if ready.is_none() {
                    return Err(ConsoleError::NotReady {
                        command: program.command.clone(),
                        expected: pattern.clone(),
                    }
                    .into());
                }

                if let Some(input) = &program.input {
                    self.reset_buffers();
                    let before_input = self.output_mark();
                    self.send(&format!("{}\n", input.expose_secret())).await?;
                    self.settle_after(before_input, INPUT_SETTLE).await?;

                    if !program.failure_patterns.is_empty() {
                        let refused = self
                            .expect(
                                &program.failure_patterns,
                                ExpectOptions::new().timeout(REFUSAL_TIMEOUT).silent(),
                            )
                            .await?;
                        if let Some(refused) = refused {
                            return Err(ConsoleError::LoginFailed {
                                command: program.command.clone(),
                                prompt: refused.text,
                            }
                            .into());
                        }
                    }
                }
            }
            None => self.settle_after(before_launch, LAUNCH_SETTLE).await?,
        }

        let prompt = match &program.prompt {
            Some(keyword) => {
                let mut prompt = Prompt::literal(keyword, program.prompt_stream)
                    .map_err(crate::error::ChannelError::from)?;
                // The prompt already on screen belongs to the launch
                let end = self.shared().with_stream(program.prompt_stream, |s| s.search().len());
                prompt.advance_to(end);
                prompt
            }
            None => self
                .detect_prompt()
                .unwrap_or_else(|| Prompt::disabled(program.prompt_stream)),
        };
        debug!("[{}] program prompt {:?}", self.tag(), prompt);

        let current = state.prompts.current_mut();
        current.use_prompt = prompt.is_enabled();
        current.prompt = prompt;
        Ok(())
    }

    /// Quiescence that only counts once output arrived after `mark`; gives
    /// up quietly at the command timeout.
    async fn settle_after(&self, mark: crate::channel::OutputMark, interval: Duration) -> Result<()> {
        match self
            .wait_for_output(mark, interval, Some(self.command_timeout()))
            .await
        {
            Err(e) if e.is_timeout() => {
                debug!("[{}] no output after launch", self.tag());
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_defaults() {
        let program = InteractiveProgram::new("mysql");
        assert_eq!(program.terminator, "\x04");
        assert_eq!(program.ready_timeout, Duration::from_secs(5));
        assert!(program.ready_pattern.is_none());
        assert!(program.prompt.is_none());
    }

    #[test]
    fn test_program_builder() {
        let program = InteractiveProgram::new("mysql -p")
            .expect("Enter password:")
            .input("pw")
            .failure_patterns(["denied"])
            .prompt("mysql>")
            .terminator("quit\n");
        assert_eq!(program.ready_pattern.as_deref(), Some("Enter password:"));
        assert_eq!(program.failure_patterns, vec!["denied"]);
        assert_eq!(program.terminator, "quit\n");
        assert!(!format!("{:?}", program).contains("\"pw\""));
    }
}
