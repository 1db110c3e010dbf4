//! Pseudo-terminals for local child processes.
//!
//! Each output stream of a local shell gets its own pty so stdout and
//! stderr stay apart while the child still sees a terminal. The child's
//! descriptor is the slave device opened by path; the master is drained by
//! a blocking reader thread that hands chunks to the async side.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::thread;

use bytes::{Buf, Bytes};
use portable_pty::{MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;

const READ_CHUNK: usize = 4096;

/// Master and slave ends of a freshly opened pty.
pub(crate) struct PtyPair {
    pub master: PtyMaster,
    pub slave: File,
}

/// Open a pty and start draining its master.
pub(crate) fn open() -> io::Result<PtyPair> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: 24,
            cols: 511,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| io::Error::other(e.to_string()))?;

    let path = pair
        .master
        .tty_name()
        .ok_or_else(|| io::Error::other("pty has no device name"))?;
    let slave = OpenOptions::new().read(true).write(true).open(&path)?;
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| io::Error::other(e.to_string()))?;

    Ok(PtyPair {
        master: PtyMaster::start(pair.master, reader),
        slave,
    })
}

/// Async read side of a pty.
pub(crate) struct PtyMaster {
    chunks: mpsc::Receiver<io::Result<Bytes>>,
    pending: Bytes,
    _master: Box<dyn MasterPty + Send>,
}

impl PtyMaster {
    fn start(master: Box<dyn MasterPty + Send>, mut reader: Box<dyn Read + Send>) -> Self {
        let (tx, chunks) = mpsc::channel(64);
        thread::spawn(move || {
            let mut buffer = [0u8; READ_CHUNK];
            loop {
                let chunk = match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(count) => Ok(Bytes::copy_from_slice(&buffer[..count])),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => Err(e),
                };
                let failed = chunk.is_err();
                if tx.blocking_send(chunk).is_err() || failed {
                    break;
                }
            }
        });

        Self {
            chunks,
            pending: Bytes::new(),
            _master: master,
        }
    }

    /// Read whatever is available; `Ok(0)` once the slave side is gone.
    ///
    /// Linux may report the hang-up as `EIO` instead; see [`is_hangup`].
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.chunks.recv().await {
                Some(chunk) => self.pending = chunk?,
                None => return Ok(0),
            }
        }
        let count = buf.len().min(self.pending.len());
        buf[..count].copy_from_slice(&self.pending[..count]);
        self.pending.advance(count);
        Ok(count)
    }
}

/// Whether a read error just means the other side went away.
pub(crate) fn is_hangup(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn test_pty_delivers_slave_output() {
        let pair = open().unwrap();
        let mut master = pair.master;
        let mut slave = pair.slave;
        slave.write_all(b"one\ntwo\n").unwrap();

        let mut collected = Vec::new();
        let mut buf = [0u8; 64];
        while !collected.ends_with(b"two\r\n") {
            let n = master.read(&mut buf).await.unwrap();
            assert!(n > 0);
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"one\r\ntwo\r\n");
    }

    #[tokio::test]
    async fn test_pty_ends_when_slave_closes() {
        let pair = open().unwrap();
        let mut master = pair.master;
        drop(pair.slave);

        let mut buf = [0u8; 16];
        match master.read(&mut buf).await {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert!(is_hangup(&e)),
        }
    }

    #[test]
    fn test_hangup_is_eio() {
        assert!(is_hangup(&io::Error::from_raw_os_error(libc::EIO)));
        assert!(!is_hangup(&io::Error::from(io::ErrorKind::BrokenPipe)));
    }
}
