//! Byte-stream backends for channels.
//!
//! A channel talks to either a local child process or a shell on an SSH
//! connection. Both push output into the channel's shared buffers from a
//! background task and accept raw input writes.

pub mod config;
mod local;
#[cfg(unix)]
mod pty;
mod ssh;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

pub use config::{AuthMethod, HostKeyVerification, SshConfig};
pub use ssh::{ExecOutput, SshTransport};

use crate::channel::Shared;
use crate::error::Result;
use local::LocalProcess;
pub(crate) use local::exit_code;
use ssh::RemoteShell;

pub(crate) enum Backend {
    Local(LocalProcess),
    Remote(RemoteShell),
}

impl Backend {
    pub async fn spawn_local(
        shell: &str,
        use_pty: bool,
        shared: Arc<Shared>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let (process, reader) = LocalProcess::spawn(shell, use_pty, shared).await?;
        Ok((Backend::Local(process), reader))
    }

    /// Open a shell on `transport`; `command` runs instead of an
    /// interactive pty shell when given.
    pub async fn open_remote(
        transport: &SshTransport,
        command: Option<&str>,
        shared: Arc<Shared>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let channel = transport.open_shell(command).await?;
        let (shell, pump) = RemoteShell::start(channel, command.is_none(), shared);
        Ok((Backend::Remote(shell), pump))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Backend::Remote(_))
    }

    /// Whether input written to the backend is echoed back as output.
    ///
    /// Local stdin is a pipe, so it never echoes.
    pub fn echoes_input(&self) -> bool {
        match self {
            Backend::Local(_) => false,
            Backend::Remote(shell) => shell.echoes_input(),
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        match self {
            Backend::Local(process) => process.write(data).await,
            Backend::Remote(shell) => shell.write(data).await,
        }
    }

    /// Exit status of a shell that has gone away, waiting up to `timeout`
    /// for it. Recorded on `shared` when found.
    pub async fn exit_status(&self, shared: &Shared, timeout: Duration) -> Option<i32> {
        match self {
            Backend::Local(process) => process.exit_status(shared, timeout).await,
            Backend::Remote(shell) => shell.exit_status(shared, timeout).await,
        }
    }

    /// Graceful shutdown, forced after `timeout`. The final exit status is
    /// recorded on `shared` when known.
    pub async fn shutdown(&self, shared: &Shared, timeout: Duration) -> Result<()> {
        match self {
            Backend::Local(process) => process.shutdown(shared, timeout).await,
            Backend::Remote(shell) => shell.shutdown(shared, timeout).await,
        }
    }
}
