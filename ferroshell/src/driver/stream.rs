//! Line streaming for never-ending commands.
//!
//! [`Channel::iterate`] starts a command that keeps producing output (a
//! `tail -f`, a monitoring loop) and hands back a [`CommandStream`] that
//! yields complete lines as they arrive. Nothing is retained in the
//! command buffers while streaming, so memory stays flat however long the
//! command runs.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use ferroshell::{Channel, IterateOptions};
//!
//! # async fn example(channel: &Channel) -> Result<(), ferroshell::Error> {
//! let options = IterateOptions::new().line_timeout(Duration::from_secs(5));
//! let mut stream = channel.iterate("tail -f /var/log/syslog", options).await?;
//! while let Some(line) = stream.next_line().await? {
//!     if line.text.contains("ready") {
//!         break;
//!     }
//! }
//! stream.finish().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::channel::{Channel, Listener, OutputMask, SendGuard, StreamKind};
use crate::driver::CommandResult;
use crate::error::{ChannelError, Result, TransportError};

/// Default terminator: Ctrl-C.
pub const DEFAULT_INTERRUPT: &str = "\x03";

const POLL: Duration = Duration::from_millis(100);
const FINISH_SETTLE: Duration = Duration::from_secs(1);

/// One line of streamed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLine {
    pub stream: StreamKind,
    pub text: String,
}

/// Options for [`Channel::iterate`] and [`Channel::follow`].
#[derive(Debug, Clone)]
pub struct IterateOptions {
    /// Streams to deliver (stdout by default).
    pub streams: OutputMask,

    /// Sent (followed by a newline) by [`CommandStream::finish`]; `None`
    /// sends nothing.
    pub terminator: Option<String>,

    /// Longest wait for a single line; `None` uses the channel's command
    /// timeout.
    pub line_timeout: Option<Duration>,
}

impl Default for IterateOptions {
    fn default() -> Self {
        Self {
            streams: OutputMask::STDOUT,
            terminator: Some(DEFAULT_INTERRUPT.to_string()),
            line_timeout: None,
        }
    }
}

impl IterateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn streams(mut self, streams: OutputMask) -> Self {
        self.streams = streams;
        self
    }

    pub fn terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = Some(terminator.into());
        self
    }

    pub fn no_terminator(mut self) -> Self {
        self.terminator = None;
        self
    }

    pub fn line_timeout(mut self, timeout: Duration) -> Self {
        self.line_timeout = Some(timeout);
        self
    }
}

/// Live line stream of a running command.
///
/// Holds the channel's send lock: other commands on the channel wait until
/// the stream is finished or dropped.
pub struct CommandStream<'a> {
    channel: &'a Channel,
    state: SendGuard<'a>,
    lines: mpsc::UnboundedReceiver<StreamLine>,
    terminator: Option<String>,
    line_timeout: Duration,
    saved_check_exitcode: bool,
    finished: bool,
}

impl<'a> CommandStream<'a> {
    /// Wait for the next complete line.
    ///
    /// Returns `Ok(None)` once the channel is closed, and a timeout error
    /// when no line arrives within the configured line timeout.
    pub async fn next_line(&mut self) -> Result<Option<StreamLine>> {
        let deadline = Instant::now() + self.line_timeout;
        loop {
            if let Ok(line) = tokio::time::timeout(POLL, self.lines.recv()).await {
                return Ok(line);
            }
            if let Some(reason) = self.channel.shared().fault() {
                return Err(TransportError::ReaderFailed(reason).into());
            }
            if self.channel.is_closed() {
                return Ok(None);
            }
            if Instant::now() >= deadline {
                return Err(ChannelError::timeout("next line", self.line_timeout).into());
            }
        }
    }

    /// The stream as a [`Stream`] of lines; it ends at the first error.
    pub fn lines(&mut self) -> impl Stream<Item = Result<StreamLine>> + '_ {
        futures_util::stream::unfold((self, false), |(stream, done)| async move {
            if done {
                return None;
            }
            match stream.next_line().await {
                Ok(Some(line)) => Some((Ok(line), (stream, false))),
                Ok(None) => None,
                Err(e) => Some((Err(e), (stream, true))),
            }
        })
    }

    /// Stop the command: send the terminator, let the shell settle and
    /// restore the channel. Returns whatever the command printed after the
    /// terminator.
    pub async fn finish(mut self) -> Result<CommandResult> {
        self.finished = true;
        self.restore();
        if let Some(terminator) = self.terminator.take() {
            debug!("[{}] stream terminator {:?}", self.channel.tag(), terminator);
            self.channel.send(&format!("{}\n", terminator)).await?;
        }
        self.channel.settle(FINISH_SETTLE).await?;
        info!("[{}] stream finished", self.channel.tag());
        Ok(self.channel.result())
    }

    fn restore(&mut self) {
        self.channel.shared().detach_listeners();
        self.state.check_exitcode = self.saved_check_exitcode;
    }
}

impl Drop for CommandStream<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "[{}] command stream dropped without finish(); the command is still running",
                self.channel.tag()
            );
            self.restore();
        }
    }
}

impl Channel {
    /// Run a never-ending `command` and stream its output lines.
    pub async fn iterate(&self, command: &str, options: IterateOptions) -> Result<CommandStream<'_>> {
        let state = self.lock_state().await;
        info!("[{}] iterate: {}", self.tag(), command);
        self.shared().begin_command(OutputMask::NONE);
        let stream = self.open_stream(state, &options, false);

        for line in command.lines().map(str::trim_start).filter(|l| !l.is_empty()) {
            // On failure the stream's Drop restores the channel
            self.send(&format!("{}\n", line)).await?;
        }
        Ok(stream)
    }

    /// Stream lines of a command that is already running (started with a
    /// never-ending [`sendline`](Channel::sendline)) without sending
    /// anything. Complete lines already buffered are delivered first.
    pub async fn follow(&self, options: IterateOptions) -> Result<CommandStream<'_>> {
        let state = self.lock_state().await;
        Ok(self.open_stream(state, &options, true))
    }

    fn open_stream<'a>(
        &'a self,
        mut state: SendGuard<'a>,
        options: &IterateOptions,
        prime: bool,
    ) -> CommandStream<'a> {
        let saved_check_exitcode = std::mem::replace(&mut state.check_exitcode, false);
        let (tx, rx) = mpsc::unbounded_channel();

        let sender = tx.clone();
        let listener: Listener = Arc::new(move |stream, text: &str| {
            let _ = sender.send(StreamLine {
                stream,
                text: text.to_string(),
            });
        });
        for (stream, text) in self.shared().attach_listener(options.streams, listener, prime) {
            let _ = tx.send(StreamLine { stream, text });
        }

        CommandStream {
            channel: self,
            state,
            lines: rx,
            terminator: options.terminator.clone(),
            line_timeout: options.line_timeout.unwrap_or(self.command_timeout()),
            saved_check_exitcode,
            finished: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iterate_defaults() {
        let options = IterateOptions::new();
        assert_eq!(options.streams, OutputMask::STDOUT);
        assert_eq!(options.terminator.as_deref(), Some("\x03"));
        assert!(options.line_timeout.is_none());
        assert!(IterateOptions::new().no_terminator().terminator.is_none());
    }
}
