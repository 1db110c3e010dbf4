//! State shared between a channel and its background reader task.
//!
//! The reader only ever calls [`Shared::add_data`]; everything else is
//! driven from the channel side. Locks here are plain `std` mutexes and are
//! never held across an `.await`.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use log::{debug, warn};
use tokio::sync::watch;

use super::buffer::StreamBuffer;
use super::exitcode::{UNKNOWN_EXIT, is_marker_line};
use super::{OutputMask, StreamKind};

/// Callback receiving complete output lines (without terminator).
pub type Listener = Arc<dyn Fn(StreamKind, &str) + Send + Sync>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marker for "output seen so far"; see [`Channel::output_mark`].
///
/// [`Channel::output_mark`]: super::Channel::output_mark
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OutputMark(pub(crate) u64);

/// Last-activity bookkeeping for quiescence detection.
#[derive(Debug)]
pub(crate) struct IoClock {
    last_io: Instant,
    output_seq: u64,
}

impl IoClock {
    fn new() -> Self {
        Self {
            last_io: Instant::now(),
            output_seq: 0,
        }
    }

    pub fn last_io(&self) -> Instant {
        self.last_io
    }

    pub fn mark(&self) -> OutputMark {
        OutputMark(self.output_seq)
    }
}

/// Prefixed echo of output lines to this process's stdout/stderr.
#[derive(Debug, Clone)]
pub(crate) struct Echo {
    pub stdout_prefix: String,
    pub stderr_prefix: String,
}

impl Echo {
    fn write(&self, stream: StreamKind, line: &[u8]) {
        // Echo failures are not the channel's problem
        let _ = match stream {
            StreamKind::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(self.stdout_prefix.as_bytes())
                    .and_then(|_| out.write_all(line))
                    .and_then(|_| out.write_all(b"\n"))
            }
            StreamKind::Stderr => {
                let mut out = std::io::stderr().lock();
                out.write_all(self.stderr_prefix.as_bytes())
                    .and_then(|_| out.write_all(line))
                    .and_then(|_| out.write_all(b"\n"))
            }
        };
    }
}

#[derive(Default)]
struct OutputState {
    stdout: StreamBuffer,
    stderr: StreamBuffer,
    keep: OutputMask,
    stdout_listener: Option<Listener>,
    stderr_listener: Option<Listener>,
}

impl OutputState {
    fn stream(&self, kind: StreamKind) -> &StreamBuffer {
        match kind {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    fn stream_mut(&mut self, kind: StreamKind) -> &mut StreamBuffer {
        match kind {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }

    fn listener(&self, kind: StreamKind) -> Option<Listener> {
        match kind {
            StreamKind::Stdout => self.stdout_listener.clone(),
            StreamKind::Stderr => self.stderr_listener.clone(),
        }
    }
}

/// Snapshot of stdout lengths taken before an exit-code probe.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StdoutMarks {
    pub search: usize,
    pub command: usize,
    pub all: usize,
}

pub(crate) struct Shared {
    tag: String,
    output: Mutex<OutputState>,
    clock: Mutex<IoClock>,
    echo: Option<Echo>,
    fault: Mutex<Option<String>>,
    closed: AtomicBool,
    ended: AtomicBool,
    exitcode: AtomicI32,
    transport_exit: Mutex<Option<i32>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    pub fn new(tag: impl Into<String>, echo: Option<Echo>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            tag: tag.into(),
            output: Mutex::new(OutputState {
                keep: OutputMask::BOTH,
                ..OutputState::default()
            }),
            clock: Mutex::new(IoClock::new()),
            echo,
            fault: Mutex::new(None),
            closed: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            exitcode: AtomicI32::new(UNKNOWN_EXIT),
            transport_exit: Mutex::new(None),
            shutdown,
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Deliver a chunk from the reader.
    pub fn add_data(&self, kind: StreamKind, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        {
            let mut clock = lock(&self.clock);
            clock.last_io = Instant::now();
            clock.output_seq += 1;
        }

        let (lines, listener) = {
            let mut out = lock(&self.output);
            let retain = out.keep.contains(kind);
            let stream = out.stream_mut(kind);
            stream.push(data, retain);
            let lines = stream.lines_mut().push(data);
            (lines, out.listener(kind))
        };
        self.forward(kind, &lines, listener.as_ref());
    }

    fn forward(&self, kind: StreamKind, lines: &[Bytes], listener: Option<&Listener>) {
        if listener.is_none() && self.echo.is_none() {
            return;
        }
        for line in lines.iter().filter(|l| !is_marker_line(l)) {
            if let Some(listener) = listener {
                listener(kind, &String::from_utf8_lossy(line));
            }
            if let Some(echo) = &self.echo {
                echo.write(kind, line);
            }
        }
    }

    /// Push any undelimited remainder out to listeners and the echo.
    pub fn flush_pending(&self) {
        for kind in [StreamKind::Stdout, StreamKind::Stderr] {
            let (rest, listener) = {
                let mut out = lock(&self.output);
                let rest = out.stream_mut(kind).lines_mut().take_remainder();
                (rest, out.listener(kind))
            };
            if let Some(rest) = rest {
                self.forward(kind, &[rest], listener.as_ref());
            }
        }
    }

    /// Start a new command: flush residue, reset the per-command buffers,
    /// drop listeners and set the retention mask.
    pub fn begin_command(&self, keep: OutputMask) {
        self.flush_pending();
        let mut out = lock(&self.output);
        out.stdout_listener = None;
        out.stderr_listener = None;
        out.keep = keep;
        out.stdout.reset_command();
        out.stderr.reset_command();
    }

    /// Reset the per-command buffers, keeping listeners and mask.
    pub fn reset_buffers(&self) {
        self.flush_pending();
        let mut out = lock(&self.output);
        out.stdout.reset_command();
        out.stderr.reset_command();
    }

    /// Install `listener` on the selected streams and stop retaining output.
    ///
    /// With `prime`, the complete lines already in the command buffers are
    /// returned so a follower does not miss what arrived before it.
    pub fn attach_listener(
        &self,
        streams: OutputMask,
        listener: Listener,
        prime: bool,
    ) -> Vec<(StreamKind, String)> {
        let mut out = lock(&self.output);
        let mut primed = Vec::new();
        for kind in [StreamKind::Stdout, StreamKind::Stderr] {
            if !streams.contains(kind) {
                continue;
            }
            if prime {
                let stream = out.stream_mut(kind);
                let pending = stream.lines_mut().pending_len();
                let command = stream.command();
                let complete = &command[..command.len().saturating_sub(pending)];
                primed.extend(
                    String::from_utf8_lossy(complete)
                        .lines()
                        .filter(|line| !is_marker_line(line.as_bytes()))
                        .map(|line| (kind, line.to_string())),
                );
            }
            match kind {
                StreamKind::Stdout => out.stdout_listener = Some(listener.clone()),
                StreamKind::Stderr => out.stderr_listener = Some(listener.clone()),
            }
        }
        out.keep = OutputMask::NONE;
        primed
    }

    /// Remove listeners and go back to retaining both streams.
    pub fn detach_listeners(&self) {
        let mut out = lock(&self.output);
        out.stdout_listener = None;
        out.stderr_listener = None;
        out.keep = OutputMask::BOTH;
    }

    /// Run `f` against one stream's buffers under the lock.
    pub(crate) fn with_stream<R>(&self, kind: StreamKind, f: impl FnOnce(&StreamBuffer) -> R) -> R {
        f(lock(&self.output).stream(kind))
    }

    pub fn command_text(&self, kind: StreamKind) -> String {
        self.with_stream(kind, |s| String::from_utf8_lossy(s.command()).into_owned())
    }

    pub fn all_text(&self, kind: StreamKind) -> String {
        self.with_stream(kind, |s| String::from_utf8_lossy(s.all()).into_owned())
    }

    pub fn stdout_marks(&self) -> StdoutMarks {
        self.with_stream(StreamKind::Stdout, |s| StdoutMarks {
            search: s.search().len(),
            command: s.command().len(),
            all: s.all().len(),
        })
    }

    /// Cut the marker exchange back out of the raw stdout buffers.
    pub fn truncate_stdout(&self, marks: StdoutMarks) {
        lock(&self.output).stdout.truncate(marks.command, marks.all);
    }

    /// Record activity without output (a send).
    pub fn touch(&self) {
        lock(&self.clock).last_io = Instant::now();
    }

    pub fn last_io(&self) -> Instant {
        lock(&self.clock).last_io()
    }

    pub fn output_mark(&self) -> OutputMark {
        lock(&self.clock).mark()
    }

    /// Record an unexpected reader failure; waiters fail fast on it.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("[{}] reader failed: {}", self.tag, reason);
        *lock(&self.fault) = Some(reason);
    }

    pub fn fault(&self) -> Option<String> {
        lock(&self.fault).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// The shell's output streams reached end of file: it has exited.
    pub fn has_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn mark_ended(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    pub fn exitcode(&self) -> i32 {
        self.exitcode.load(Ordering::SeqCst)
    }

    pub fn set_exitcode(&self, code: i32) {
        self.exitcode.store(code, Ordering::SeqCst);
    }

    /// Exit status reported by the transport itself (process or SSH channel).
    pub fn transport_exit(&self) -> Option<i32> {
        *lock(&self.transport_exit)
    }

    pub fn set_transport_exit(&self, code: i32) {
        debug!("[{}] transport exit status {}", self.tag, code);
        *lock(&self.transport_exit) = Some(code);
    }

    /// Ask the reader task to stop.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    fn collecting(shared: &Shared, kind: StreamKind) -> Arc<StdMutex<Vec<String>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let streams = match kind {
            StreamKind::Stdout => OutputMask::STDOUT,
            StreamKind::Stderr => OutputMask::STDERR,
        };
        shared.attach_listener(
            streams,
            Arc::new(move |_, line: &str| sink.lock().unwrap().push(line.to_string())),
            false,
        );
        seen
    }

    #[test]
    fn test_listener_gets_complete_lines() {
        let shared = Shared::new("test", None);
        let seen = collecting(&shared, StreamKind::Stdout);

        shared.add_data(StreamKind::Stdout, b"one\r\ntw");
        shared.add_data(StreamKind::Stdout, b"o\n__exitcode2--0--\nthree");
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);

        shared.flush_pending();
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_mask_controls_retention() {
        let shared = Shared::new("test", None);
        shared.begin_command(OutputMask::STDERR);
        shared.add_data(StreamKind::Stdout, b"out\n");
        shared.add_data(StreamKind::Stderr, b"err\n");

        assert_eq!(shared.command_text(StreamKind::Stdout), "");
        assert_eq!(shared.command_text(StreamKind::Stderr), "err\n");
        // Searchable text still sees everything
        let searchable = shared.with_stream(StreamKind::Stdout, |s| s.search().len());
        assert_eq!(searchable, 4);
    }

    #[test]
    fn test_begin_command_drops_listeners() {
        let shared = Shared::new("test", None);
        let seen = collecting(&shared, StreamKind::Stderr);
        shared.begin_command(OutputMask::BOTH);
        shared.add_data(StreamKind::Stderr, b"late\n");
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_attach_primes_complete_lines_only() {
        let shared = Shared::new("test", None);
        shared.add_data(StreamKind::Stdout, b"first\nsecond\npart");

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let primed = shared.attach_listener(
            OutputMask::STDOUT,
            Arc::new(move |_, line: &str| sink.lock().unwrap().push(line.to_string())),
            true,
        );
        assert_eq!(
            primed,
            vec![
                (StreamKind::Stdout, "first".to_string()),
                (StreamKind::Stdout, "second".to_string())
            ]
        );

        // The partial line is completed through the listener, once
        shared.add_data(StreamKind::Stdout, b"ial\n");
        assert_eq!(*seen.lock().unwrap(), vec!["partial"]);
        // Streaming output is not retained
        assert_eq!(shared.command_text(StreamKind::Stdout), "first\nsecond\npart");

        shared.detach_listeners();
        shared.add_data(StreamKind::Stdout, b"after\n");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_truncate_stdout() {
        let shared = Shared::new("test", None);
        shared.add_data(StreamKind::Stdout, b"hi\n");
        let marks = shared.stdout_marks();
        shared.add_data(StreamKind::Stdout, b"__exitcode0--0--\n");
        shared.truncate_stdout(marks);

        assert_eq!(shared.command_text(StreamKind::Stdout), "hi\n");
        assert_eq!(shared.all_text(StreamKind::Stdout), "hi\n");
    }

    #[test]
    fn test_output_mark_advances() {
        let shared = Shared::new("test", None);
        let before = shared.output_mark();
        shared.touch();
        assert_eq!(shared.output_mark(), before);
        shared.add_data(StreamKind::Stderr, b"x");
        assert!(shared.output_mark() > before);
    }
}
