//! Local shell process.
//!
//! The shell's stdin is always a pipe. Its stdout and stderr each get a
//! pty (or a plain pipe when ptys are disabled or unavailable). A single
//! reader task multiplexes both output descriptors into the channel's
//! shared buffers.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[cfg(unix)]
use super::pty::{self, PtyMaster};
use crate::channel::exitcode::UNKNOWN_EXIT;
use crate::channel::{Shared, StreamKind};
use crate::error::{Result, TransportError};

const READ_CHUNK: usize = 4096;

/// A spawned local shell.
pub(crate) struct LocalProcess {
    program: String,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
}

/// One readable output descriptor.
enum OutputSource {
    Pipe(Box<dyn AsyncRead + Send + Unpin>),
    #[cfg(unix)]
    Pty(PtyMaster),
}

impl OutputSource {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            OutputSource::Pipe(reader) => reader.read(buf).await,
            #[cfg(unix)]
            OutputSource::Pty(master) => master.read(buf).await,
        }
    }
}

/// What a single read produced.
enum ReadOutcome {
    Data(usize),
    Retire,
    Retry,
    Fatal(io::Error),
}

fn classify(result: io::Result<usize>) -> ReadOutcome {
    match result {
        Ok(0) => ReadOutcome::Retire,
        Ok(n) => ReadOutcome::Data(n),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::Retry,
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => ReadOutcome::Retire,
        #[cfg(unix)]
        Err(e) if pty::is_hangup(&e) => ReadOutcome::Retire,
        Err(e) => ReadOutcome::Fatal(e),
    }
}

impl LocalProcess {
    /// Spawn `shell` (a whitespace-separated command line) and start its
    /// reader task.
    pub async fn spawn(
        shell: &str,
        use_pty: bool,
        shared: Arc<Shared>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let mut words = shell.split_whitespace();
        let program = words.next().unwrap_or("/bin/sh").to_string();

        let mut command = Command::new(&program);
        command
            .args(words)
            .env("TERM", "vt100")
            .stdin(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let use_pty = use_pty && cfg!(unix);
        let mut sources = None;
        #[cfg(unix)]
        if use_pty {
            let out = pty::open().map_err(TransportError::Io)?;
            let err = pty::open().map_err(TransportError::Io)?;
            command.stdout(Stdio::from(out.slave));
            command.stderr(Stdio::from(err.slave));
            sources = Some((OutputSource::Pty(out.master), OutputSource::Pty(err.master)));
        }
        if sources.is_none() {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            program: program.clone(),
            source,
        })?;
        // The parent's copies of the pty slaves live in `command`; once they
        // are closed the masters hang up when the shell exits.
        drop(command);

        let (stdout, stderr) = match sources {
            Some(pair) => pair,
            None => {
                let stdout = child.stdout.take().ok_or(TransportError::Closed)?;
                let stderr = child.stderr.take().ok_or(TransportError::Closed)?;
                (
                    OutputSource::Pipe(Box::new(stdout)),
                    OutputSource::Pipe(Box::new(stderr)),
                )
            }
        };
        let stdin = child.stdin.take().ok_or(TransportError::Closed)?;

        info!(
            "[{}] spawned {} (pid {:?}, pty: {})",
            shared.tag(),
            shell,
            child.id(),
            use_pty
        );

        let reader = tokio::spawn(read_loop(stdout, stderr, shared));
        Ok((
            Self {
                program,
                child: Mutex::new(child),
                stdin: Mutex::new(Some(stdin)),
            },
            reader,
        ))
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(TransportError::Closed)?;
        pipe.write_all(data).await.map_err(write_error)?;
        pipe.flush().await.map_err(write_error)?;
        Ok(())
    }

    /// Reap the shell if it exits within `timeout`.
    pub async fn exit_status(&self, shared: &Shared, timeout: Duration) -> Option<i32> {
        let mut child = self.child.lock().await;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let code = exit_code(&status);
                shared.set_transport_exit(code);
                Some(code)
            }
            Ok(Err(e)) => {
                debug!("[{}] wait for {} failed: {}", shared.tag(), self.program, e);
                None
            }
            Err(_) => None,
        }
    }

    /// Ask the shell to exit, kill it after `timeout`, and record its
    /// status on `shared`.
    pub async fn shutdown(&self, shared: &Shared, timeout: Duration) -> Result<()> {
        if let Err(e) = self.write(b"exit\n").await {
            debug!("[{}] could not send exit: {}", shared.tag(), e);
        }
        // Closing stdin ends shells that ignore `exit` in odd states
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status.map_err(TransportError::Io)?,
            Err(_) => {
                warn!(
                    "[{}] {} did not exit within {:?}, killing",
                    shared.tag(),
                    self.program,
                    timeout
                );
                child.kill().await.map_err(TransportError::Io)?;
                child.wait().await.map_err(TransportError::Io)?
            }
        };
        shared.set_transport_exit(exit_code(&status));
        Ok(())
    }
}

fn write_error(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::BrokenPipe {
        TransportError::Closed
    } else {
        TransportError::Io(e)
    }
}

#[cfg(unix)]
pub(crate) fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(UNKNOWN_EXIT)
}

#[cfg(not(unix))]
pub(crate) fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(UNKNOWN_EXIT)
}

async fn read_loop(mut stdout: OutputSource, mut stderr: OutputSource, shared: Arc<Shared>) {
    let mut stop = shared.shutdown_signal();
    let mut out_buf = [0u8; READ_CHUNK];
    let mut err_buf = [0u8; READ_CHUNK];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        let (kind, outcome) = tokio::select! {
            r = stdout.read(&mut out_buf), if out_open => (StreamKind::Stdout, classify(r)),
            r = stderr.read(&mut err_buf), if err_open => (StreamKind::Stderr, classify(r)),
            _ = stop.changed() => break,
        };

        match outcome {
            ReadOutcome::Data(n) => {
                let chunk = match kind {
                    StreamKind::Stdout => &out_buf[..n],
                    StreamKind::Stderr => &err_buf[..n],
                };
                shared.add_data(kind, chunk);
            }
            ReadOutcome::Retire => {
                debug!("[{}] {} closed", shared.tag(), kind);
                match kind {
                    StreamKind::Stdout => out_open = false,
                    StreamKind::Stderr => err_open = false,
                }
            }
            ReadOutcome::Retry => {}
            ReadOutcome::Fatal(e) => {
                shared.fail(format!("{}: {}", kind, e));
                break;
            }
        }
    }
    if !out_open && !err_open {
        shared.mark_ended();
    }
    debug!("[{}] reader finished", shared.tag());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert!(matches!(classify(Ok(0)), ReadOutcome::Retire));
        assert!(matches!(classify(Ok(5)), ReadOutcome::Data(5)));
        assert!(matches!(
            classify(Err(io::Error::from(io::ErrorKind::Interrupted))),
            ReadOutcome::Retry
        ));
        assert!(matches!(
            classify(Err(io::Error::other("boom"))),
            ReadOutcome::Fatal(_)
        ));
        #[cfg(unix)]
        assert!(matches!(
            classify(Err(io::Error::from_raw_os_error(libc::EIO))),
            ReadOutcome::Retire
        ));
    }
}
