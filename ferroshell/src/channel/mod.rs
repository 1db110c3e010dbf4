//! Interactive command channel.
//!
//! A [`Channel`] wraps one long-lived shell, local or remote, and turns its
//! raw output streams into command results. A background reader task feeds
//! the per-stream buffers; the methods here send input and then wait for
//! the command to finish, either by quiescence (no output for an interval)
//! or by matching the shell's prompt.
//!
//! After each command the channel can ask the shell for `$?` through an
//! in-band marker (see [`exitcode`]) and, in careful mode, turn a non-zero
//! status into an error.

mod buffer;
pub mod exitcode;
mod output;
pub mod patterns;
pub mod prompt;

use std::fmt;
use std::ops::BitOr;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use regex::bytes::Regex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub use buffer::{LineSplitter, PatternBuffer};
pub use exitcode::{ShellFlavor, UNKNOWN_EXIT};
pub use output::{Listener, OutputMark};
pub use patterns::ExpectMatch;
pub use prompt::{Prompt, PromptState, detect_prompt};

pub(crate) use output::{Echo, Shared, lock};

use exitcode::{ExitcodeMarker, parse_exitcode};
use prompt::PromptStack;

use crate::config::EngineConfig;
use crate::driver::CommandResult;
use crate::error::{ChannelError, CommandError, Result, TransportError};
use crate::transport::{Backend, SshTransport};

/// Polling granularity for wait and expect loops.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Ceiling on the wait between lines of a multi-line block.
const INTER_LINE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a prompt match may take once a command is quiet.
const PROMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long the shell gets to answer an exit-code marker.
pub const EXITCODE_TIMEOUT: Duration = Duration::from_secs(3);

/// Trailing-output settle after a prompt match or marker answer.
const SETTLE: Duration = Duration::from_millis(100);

/// Settle after `stty -echo`.
const STTY_SETTLE: Duration = Duration::from_millis(250);

/// Which output stream of the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// Set of streams whose output is retained in the command buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputMask(u8);

impl OutputMask {
    pub const NONE: Self = Self(0);
    pub const STDOUT: Self = Self(1);
    pub const STDERR: Self = Self(2);
    pub const BOTH: Self = Self(3);

    /// Build from the `1 = stdout, 2 = stderr` bit convention.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 3)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Stdout => self.0 & 1 != 0,
            StreamKind::Stderr => self.0 & 2 != 0,
        }
    }
}

impl BitOr for OutputMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Options for [`Channel::sendline`].
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Quiescence interval that ends the command. `None` uses the current
    /// shell level's interval; zero marks a never-ending command that
    /// returns right after sending.
    pub output_timeout: Option<Duration>,

    /// Streams to retain. `None` keeps both, or none for a never-ending
    /// command.
    pub output: Option<OutputMask>,

    /// Use the prompt (when one is armed) instead of quiescence.
    pub wait_for_prompt: bool,

    /// Probe the exit code afterwards (when the channel has it enabled).
    pub check_exitcode: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            output_timeout: None,
            output: None,
            wait_for_prompt: true,
            check_exitcode: true,
        }
    }
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output_timeout(mut self, interval: Duration) -> Self {
        self.output_timeout = Some(interval);
        self
    }

    /// The command keeps running; send it and return immediately.
    pub fn never_ending(mut self) -> Self {
        self.output_timeout = Some(Duration::ZERO);
        self
    }

    pub fn output(mut self, mask: OutputMask) -> Self {
        self.output = Some(mask);
        self
    }

    pub fn no_prompt(mut self) -> Self {
        self.wait_for_prompt = false;
        self
    }

    pub fn no_exitcode(mut self) -> Self {
        self.check_exitcode = false;
        self
    }

    fn is_never_ending(&self) -> bool {
        self.output_timeout == Some(Duration::ZERO)
    }
}

/// Options for [`Channel::expect`].
#[derive(Debug, Clone)]
pub struct ExpectOptions {
    /// How long to wait for a match.
    pub timeout: Duration,

    /// Search stdout.
    pub stdout: bool,

    /// Search stderr.
    pub stderr: bool,

    /// Absolute search start; defaults to the start of the current command.
    pub position: Option<usize>,

    /// Return `Ok(None)` on timeout instead of an error.
    pub silent: bool,
}

impl Default for ExpectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            stdout: true,
            stderr: true,
            position: None,
            silent: false,
        }
    }
}

impl ExpectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stdout_only(mut self) -> Self {
        self.stdout = true;
        self.stderr = false;
        self
    }

    pub fn stderr_only(mut self) -> Self {
        self.stdout = false;
        self.stderr = true;
        self
    }

    /// Search only the given stream.
    pub fn stream(self, kind: StreamKind) -> Self {
        match kind {
            StreamKind::Stdout => self.stdout_only(),
            StreamKind::Stderr => self.stderr_only(),
        }
    }

    pub fn position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// Per-channel state guarded by the send lock.
///
/// Holding the lock means owning the shell: one command (or stream, or
/// console transition) at a time.
#[derive(Debug)]
pub(crate) struct SendState {
    pub prompts: PromptStack,
    pub marker: ExitcodeMarker,
    pub check_exitcode: bool,
    pub flavor: ShellFlavor,
}

pub(crate) type SendGuard<'a> = tokio::sync::MutexGuard<'a, SendState>;

/// A persistent interactive shell.
pub struct Channel {
    shared: Arc<Shared>,
    backend: Backend,
    reader: Mutex<Option<JoinHandle<()>>>,
    send: tokio::sync::Mutex<SendState>,
    timeout: Duration,
    careful: AtomicBool,
    closing: AtomicBool,
}

impl Channel {
    /// Start the configured local shell.
    pub async fn local(config: &EngineConfig) -> Result<Self> {
        Self::local_with_shell(config, &config.local_shell()).await
    }

    /// Start a specific local shell command line (e.g. `/bin/sh -i`).
    pub async fn local_with_shell(config: &EngineConfig, shell: &str) -> Result<Self> {
        let shared = Shared::new("local", echo_for(config));
        let (backend, reader) = Backend::spawn_local(shell, !config.no_pty, shared.clone()).await?;
        Self::start(
            backend,
            reader,
            shared,
            config,
            ShellFlavor::from_shell(shell),
        )
        .await
    }

    /// Open an interactive shell (with pty) on an SSH connection.
    pub async fn remote(transport: &SshTransport, config: &EngineConfig) -> Result<Self> {
        let shared = Shared::new(transport.host(), echo_for(config));
        let (backend, reader) = Backend::open_remote(transport, None, shared.clone()).await?;
        Self::start(backend, reader, shared, config, ShellFlavor::Posix).await
    }

    /// Run `shell` on an SSH connection as the channel's shell (no pty).
    pub async fn remote_with_shell(
        transport: &SshTransport,
        config: &EngineConfig,
        shell: &str,
    ) -> Result<Self> {
        let shared = Shared::new(transport.host(), echo_for(config));
        let (backend, reader) = Backend::open_remote(transport, Some(shell), shared.clone()).await?;
        Self::start(
            backend,
            reader,
            shared,
            config,
            ShellFlavor::from_shell(shell),
        )
        .await
    }

    async fn start(
        backend: Backend,
        reader: JoinHandle<()>,
        shared: Arc<Shared>,
        config: &EngineConfig,
        flavor: ShellFlavor,
    ) -> Result<Self> {
        let remote = backend.is_remote();
        let interval = config.interval(remote);
        let channel = Self {
            backend,
            reader: Mutex::new(Some(reader)),
            send: tokio::sync::Mutex::new(SendState {
                prompts: PromptStack::new(PromptState::quiescence(StreamKind::Stdout, interval)),
                marker: ExitcodeMarker::new(),
                check_exitcode: true,
                flavor,
            }),
            timeout: config.timeout(remote),
            careful: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            shared,
        };
        info!("[{}] channel opened", channel.shared.tag());

        channel.shared.touch();
        channel.settle(interval).await?;
        if channel.echoes_input() {
            channel.send_bytes(b"stty -echo\n").await?;
            channel.settle(STTY_SETTLE).await?;
        }
        channel.shared.reset_buffers();
        Ok(channel)
    }

    /// Tag used in log lines (`local` or the remote host).
    pub fn tag(&self) -> &str {
        self.shared.tag()
    }

    pub fn is_remote(&self) -> bool {
        self.backend.is_remote()
    }

    /// Whether the shell echoes what is sent (remote pty shells).
    pub fn echoes_input(&self) -> bool {
        self.backend.echoes_input()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Fail commands whose exit code is non-zero.
    pub fn set_careful(&self, careful: bool) {
        self.careful.store(careful, Ordering::SeqCst);
    }

    pub fn is_careful(&self) -> bool {
        self.careful.load(Ordering::SeqCst)
    }

    /// Completion ceiling for commands on this channel.
    pub fn command_timeout(&self) -> Duration {
        self.timeout
    }

    /// Exit code of the last probed command, or [`UNKNOWN_EXIT`].
    pub fn exitcode(&self) -> i32 {
        self.shared.exitcode()
    }

    /// Write raw input to the shell. No newline is added.
    pub async fn send(&self, data: &str) -> Result<()> {
        self.send_bytes(data.as_bytes()).await
    }

    pub(crate) async fn send_bytes(&self, data: &[u8]) -> Result<()> {
        if self.shared.is_closed() {
            return Err(ChannelError::Closed.into());
        }
        self.check_fault()?;
        trace!("[{}] send {:?}", self.tag(), String::from_utf8_lossy(data));
        self.backend.write(data).await?;
        self.shared.touch();
        Ok(())
    }

    fn check_fault(&self) -> Result<()> {
        match self.shared.fault() {
            Some(reason) => Err(TransportError::ReaderFailed(reason).into()),
            None => Ok(()),
        }
    }

    /// Send one or more lines and wait for them to complete.
    ///
    /// Lines are left-trimmed and blank ones skipped. Between lines the
    /// channel waits for quiescence; after the last it waits for the prompt
    /// (when armed) or quiescence, then probes the exit code.
    pub async fn sendline(&self, lines: &str, options: SendOptions) -> Result<CommandResult> {
        let mut state = self.send.lock().await;
        self.sendline_locked(&mut state, lines, &options).await
    }

    /// [`sendline`](Self::sendline) with default options.
    pub async fn run(&self, command: &str) -> Result<CommandResult> {
        self.sendline(command, SendOptions::default()).await
    }

    pub(crate) async fn sendline_locked(
        &self,
        state: &mut SendState,
        text: &str,
        options: &SendOptions,
    ) -> Result<CommandResult> {
        if self.shared.is_closed() {
            return Err(ChannelError::Closed.into());
        }

        let never_ending = options.is_never_ending();
        let interval = state.prompts.current().interval;
        let output_timeout = options.output_timeout.unwrap_or(interval);
        let keep = options.output.unwrap_or(if never_ending {
            OutputMask::NONE
        } else {
            OutputMask::BOTH
        });
        self.shared.begin_command(keep);

        let lines: Vec<&str> = text
            .lines()
            .map(str::trim_start)
            .filter(|l| !l.is_empty())
            .collect();
        let Some((last, head)) = lines.split_last() else {
            self.shared.touch();
            self.settle(interval).await?;
            return Ok(self.result());
        };

        let probe = options.check_exitcode && state.check_exitcode;
        for line in head {
            debug!("[{}] sendline: {}", self.tag(), line);
            self.send_bytes(format!("{line}\n").as_bytes()).await?;
            self.settle_bounded(interval, INTER_LINE_TIMEOUT).await?;
            if probe && self.is_careful() {
                let code = self.probe_exitcode(state, EXITCODE_TIMEOUT).await?;
                self.fail_if_careful(code)?;
            }
        }

        debug!("[{}] sendline: {}", self.tag(), last);
        self.send_bytes(format!("{last}\n").as_bytes()).await?;
        if never_ending {
            return Ok(self.result());
        }

        if options.wait_for_prompt && state.prompts.current().is_armed() {
            self.expect_prompt(state, output_timeout).await?;
        } else {
            self.shared.touch();
            self.wait(output_timeout, Some(self.timeout)).await?;
        }

        if probe {
            let code = self.probe_exitcode(state, EXITCODE_TIMEOUT).await?;
            self.fail_if_careful(code)?;
        }
        Ok(self.result())
    }

    fn fail_if_careful(&self, code: i32) -> Result<()> {
        if self.is_careful() && code > 0 {
            return Err(CommandError::Failed {
                code,
                stderr: self.shared.command_text(StreamKind::Stderr),
            }
            .into());
        }
        Ok(())
    }

    /// Wait until the shell is quiet for `interval`.
    ///
    /// With a `timeout`, continuous output longer than that is an error.
    pub async fn wait(&self, interval: Duration, timeout: Option<Duration>) -> Result<()> {
        self.wait_inner(interval, timeout, None).await
    }

    /// Like [`wait`](Self::wait), but quiescence only counts once some
    /// output has arrived after `mark`.
    pub async fn wait_for_output(
        &self,
        mark: OutputMark,
        interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.wait_inner(interval, timeout, Some(mark)).await
    }

    /// Current output position for [`wait_for_output`](Self::wait_for_output).
    pub fn output_mark(&self) -> OutputMark {
        self.shared.output_mark()
    }

    async fn wait_inner(
        &self,
        interval: Duration,
        timeout: Option<Duration>,
        since: Option<OutputMark>,
    ) -> Result<()> {
        let started = Instant::now();
        let tick = POLL_INTERVAL.min(interval.max(Duration::from_millis(1)));
        loop {
            self.check_fault()?;
            let now = Instant::now();
            let has_output = since.is_none_or(|mark| self.shared.output_mark() > mark);
            if has_output && now.duration_since(self.shared.last_io()) >= interval {
                return Ok(());
            }
            if let Some(timeout) = timeout {
                if now.duration_since(started) >= timeout {
                    return Err(ChannelError::timeout("wait", timeout).into());
                }
            }
            sleep(tick).await;
        }
    }

    /// Quiescence wait bounded by the command timeout.
    pub(crate) async fn settle(&self, interval: Duration) -> Result<()> {
        self.settle_bounded(interval, self.timeout).await
    }

    /// Quiescence wait that gives up quietly at `limit` (for commands that
    /// never stop talking).
    pub(crate) async fn settle_bounded(&self, interval: Duration, limit: Duration) -> Result<()> {
        match self.wait(interval, Some(limit)).await {
            Err(e) if e.is_timeout() => {
                debug!("[{}] output still flowing after {:?}", self.tag(), limit);
                Ok(())
            }
            other => other,
        }
    }

    /// Wait for any of `patterns` to appear.
    ///
    /// Patterns are case-insensitive regexes; the first one (in list order)
    /// that matches wins.
    pub async fn expect<S: AsRef<str>>(
        &self,
        patterns: &[S],
        options: ExpectOptions,
    ) -> Result<Option<ExpectMatch>> {
        let compiled = patterns::compile_all(patterns).map_err(ChannelError::from)?;
        self.expect_regex(&compiled, options).await
    }

    /// [`expect`](Self::expect) with precompiled patterns.
    pub async fn expect_regex(
        &self,
        patterns: &[Regex],
        options: ExpectOptions,
    ) -> Result<Option<ExpectMatch>> {
        let started = Instant::now();
        let streams: Vec<StreamKind> = [
            (options.stdout, StreamKind::Stdout),
            (options.stderr, StreamKind::Stderr),
        ]
        .into_iter()
        .filter_map(|(on, kind)| on.then_some(kind))
        .collect();

        loop {
            self.check_fault()?;
            for &kind in &streams {
                let found = self.shared.with_stream(kind, |s| {
                    let from = options.position.unwrap_or(s.command_start());
                    patterns::find_first(s.search(), kind, patterns, from)
                });
                if let Some(found) = found {
                    trace!("[{}] expect matched {:?}", self.tag(), found.text);
                    return Ok(Some(found));
                }
            }

            if started.elapsed() >= options.timeout {
                if options.silent {
                    return Ok(None);
                }
                let wanted: Vec<&str> = patterns.iter().map(Regex::as_str).collect();
                return Err(
                    ChannelError::timeout(format!("expect {:?}", wanted), options.timeout).into(),
                );
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait for the armed prompt past its cursor and advance the cursor.
    async fn expect_prompt(&self, state: &mut SendState, output_timeout: Duration) -> Result<()> {
        let current = state.prompts.current();
        let Some(pattern) = current.prompt.pattern().cloned() else {
            self.shared.touch();
            return self.wait(output_timeout, Some(self.timeout)).await;
        };
        let stream = current.prompt.stream();
        let start = self.shared.with_stream(stream, |s| s.command_start());
        let from = current.prompt.position().max(start);

        let options = ExpectOptions::new()
            .timeout(PROMPT_TIMEOUT)
            .stream(stream)
            .position(from);
        if let Some(found) = self.expect_regex(slice::from_ref(&pattern), options).await? {
            state.prompts.current_mut().prompt.advance_to(found.end);
        }
        self.settle(SETTLE).await
    }

    /// Ask the shell for the last exit status.
    ///
    /// Returns [`UNKNOWN_EXIT`] when no answer arrives within `timeout`.
    pub async fn get_exitcode(&self, timeout: Duration) -> Result<i32> {
        let mut state = self.send.lock().await;
        self.probe_exitcode(&mut state, timeout).await
    }

    pub(crate) async fn probe_exitcode(&self, state: &mut SendState, timeout: Duration) -> Result<i32> {
        if self.shared.has_ended() {
            return Ok(self.exited_status(timeout).await);
        }
        let probe = state.marker.next_probe(state.flavor);
        let marks = self.shared.stdout_marks();
        if let Err(e) = self.send_bytes(probe.command.as_bytes()).await {
            // Output may still be held open by a leftover child
            if !self.shared.is_closed() {
                if let Some(code) = self.backend.exit_status(&self.shared, Duration::ZERO).await {
                    self.shared.set_exitcode(code);
                    return Ok(code);
                }
            }
            return Err(e);
        }

        let options = ExpectOptions::new()
            .timeout(timeout)
            .stdout_only()
            .position(marks.search)
            .silent();
        let found = self
            .expect_regex(slice::from_ref(&probe.pattern), options)
            .await?;

        let code = match &found {
            Some(found) => {
                let code = parse_exitcode(found.group(1));
                self.consume_prompt_after(state, found.end).await?;
                code
            }
            None => {
                warn!("[{}] no answer to exit-code marker {}", self.tag(), probe.index);
                UNKNOWN_EXIT
            }
        };

        self.shared.truncate_stdout(marks);
        self.shared.set_exitcode(code);
        debug!("[{}] exit code {}", self.tag(), code);
        Ok(code)
    }

    /// Status of a shell whose output has ended, taken from the transport.
    async fn exited_status(&self, timeout: Duration) -> i32 {
        let code = self
            .backend
            .exit_status(&self.shared, timeout)
            .await
            .unwrap_or(UNKNOWN_EXIT);
        debug!("[{}] shell exited with {}", self.tag(), code);
        self.shared.set_exitcode(code);
        code
    }

    /// Eat the prompt that follows a marker answer so the next command does
    /// not mistake it for its own.
    async fn consume_prompt_after(&self, state: &mut SendState, from: usize) -> Result<()> {
        let current = state.prompts.current();
        let pattern = match current.prompt.pattern() {
            Some(pattern) if current.use_prompt => pattern.clone(),
            _ => return self.settle(SETTLE).await,
        };
        let stream = current.prompt.stream();
        let from = if stream == StreamKind::Stdout {
            from
        } else {
            self.shared.with_stream(stream, |s| s.command_start())
        };
        let from = from.max(current.prompt.position());

        let options = ExpectOptions::new()
            .timeout(PROMPT_TIMEOUT)
            .stream(stream)
            .position(from)
            .silent();
        if let Some(found) = self.expect_regex(slice::from_ref(&pattern), options).await? {
            state.prompts.current_mut().prompt.advance_to(found.end);
        }
        self.settle(SETTLE).await
    }

    /// Output of the current command.
    pub fn result(&self) -> CommandResult {
        CommandResult::new(
            &self.shared.command_text(StreamKind::Stdout),
            &self.shared.command_text(StreamKind::Stderr),
            self.shared.exitcode(),
        )
    }

    /// Everything the session produced so far.
    pub fn transcript(&self) -> CommandResult {
        CommandResult::new(
            &self.shared.all_text(StreamKind::Stdout),
            &self.shared.all_text(StreamKind::Stderr),
            self.shared.exitcode(),
        )
    }

    /// Inject output as if the shell had produced it.
    pub fn add_data(&self, stream: StreamKind, data: &[u8]) {
        self.shared.add_data(stream, data);
    }

    /// Start a fresh command buffer without sending anything.
    pub fn reset_buffers(&self) {
        self.shared.reset_buffers();
    }

    /// Snapshot of the current prompt state.
    pub async fn prompt_state(&self) -> PromptState {
        self.send.lock().await.prompts.current().clone()
    }

    /// Replace the current prompt.
    pub async fn set_prompt(&self, prompt: Prompt, use_prompt: bool) {
        let mut state = self.send.lock().await;
        let current = state.prompts.current_mut();
        current.prompt = prompt;
        current.use_prompt = use_prompt;
    }

    /// Change the quiescence interval of the current shell level.
    pub async fn set_interval(&self, interval: Duration) {
        self.send.lock().await.prompts.current_mut().interval = interval;
    }

    /// Number of nested shell levels entered.
    pub async fn depth(&self) -> usize {
        self.send.lock().await.prompts.depth()
    }

    /// Turn exit-code probing on or off.
    pub async fn set_check_exitcode(&self, enabled: bool) {
        self.send.lock().await.check_exitcode = enabled;
    }

    /// Guess a prompt from the tail of the current command's output.
    ///
    /// The returned prompt's cursor sits at the end of what was searched, so
    /// the prompt already on screen is not matched again.
    pub fn detect_prompt(&self) -> Option<Prompt> {
        [StreamKind::Stdout, StreamKind::Stderr]
            .into_iter()
            .find_map(|kind| {
                let (text, end) = self.shared.with_stream(kind, |s| {
                    (s.search().text_from(s.command_start()), s.search().len())
                });
                let keyword = detect_prompt(&text)?;
                let mut prompt = Prompt::literal(&keyword, kind).ok()?;
                prompt.advance_to(end);
                Some(prompt)
            })
    }

    pub(crate) async fn lock_state(&self) -> SendGuard<'_> {
        self.send.lock().await
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// End the session and return its whole transcript.
    ///
    /// Sends `exit`, waits for the shell (forcing it down after the command
    /// timeout) and records its final exit status. Closing twice returns the
    /// transcript again. In careful mode a non-zero final status is an
    /// error, raised after everything is torn down.
    ///
    /// A command or [`CommandStream`](crate::CommandStream) still holding
    /// the channel must finish first. If it does not let go within the
    /// command timeout, close fails with a timeout and the channel stays
    /// open.
    pub async fn close(&self) -> Result<CommandResult> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(self.transcript());
        }
        let _state = match tokio::time::timeout(self.timeout, self.send.lock()).await {
            Ok(state) => state,
            Err(_) => {
                warn!("[{}] channel still busy, not closing", self.tag());
                self.closing.store(false, Ordering::SeqCst);
                return Err(ChannelError::timeout("close", self.timeout).into());
            }
        };
        info!("[{}] closing channel", self.tag());

        let shutdown = self.backend.shutdown(&self.shared, self.timeout).await;
        self.shared.mark_closed();
        self.shared.request_shutdown();
        self.join_reader().await;
        self.shared.flush_pending();

        if let Some(code) = self.shared.transport_exit() {
            self.shared.set_exitcode(code);
        }
        shutdown?;

        let transcript = self.transcript();
        let code = transcript.exitcode;
        if self.is_careful() && code > 0 {
            return Err(CommandError::Failed {
                code,
                stderr: transcript.stderr,
            }
            .into());
        }
        Ok(transcript)
    }

    async fn join_reader(&self) {
        let handle = lock(&self.reader).take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(1), &mut handle)
                .await
                .is_err()
            {
                debug!("[{}] reader did not stop, aborting", self.tag());
                handle.abort();
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("tag", &self.shared.tag())
            .field("remote", &self.is_remote())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.closing.load(Ordering::SeqCst) {
            warn!("[{}] channel dropped without close()", self.shared.tag());
        }
        self.shared.request_shutdown();
        if let Some(handle) = lock(&self.reader).take() {
            handle.abort();
        }
    }
}

pub(crate) fn echo_for(config: &EngineConfig) -> Option<Echo> {
    config.verbose.then(|| Echo {
        stdout_prefix: config.stdout_prefix.clone(),
        stderr_prefix: config.stderr_prefix.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_mask() {
        assert!(OutputMask::BOTH.contains(StreamKind::Stdout));
        assert!(OutputMask::BOTH.contains(StreamKind::Stderr));
        assert!(!OutputMask::STDERR.contains(StreamKind::Stdout));
        assert_eq!(OutputMask::STDOUT | OutputMask::STDERR, OutputMask::BOTH);
        assert_eq!(OutputMask::from_bits(7), OutputMask::BOTH);
        assert_eq!(OutputMask::default(), OutputMask::NONE);
    }

    #[test]
    fn test_send_options() {
        let options = SendOptions::new();
        assert!(options.wait_for_prompt);
        assert!(options.check_exitcode);
        assert!(!options.is_never_ending());
        assert!(SendOptions::new().never_ending().is_never_ending());
    }

    #[test]
    fn test_expect_options_stream() {
        let options = ExpectOptions::new().stream(StreamKind::Stderr);
        assert!(!options.stdout);
        assert!(options.stderr);
        assert!(!options.silent);
    }

    #[test]
    fn test_stream_kind_display() {
        assert_eq!(StreamKind::Stdout.to_string(), "stdout");
        assert_eq!(StreamKind::Stderr.to_string(), "stderr");
    }
}
