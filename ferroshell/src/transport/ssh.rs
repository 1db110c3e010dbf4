//! SSH transport implementation using russh.
//!
//! [`SshTransport`] owns one authenticated connection. Interactive shells
//! opened on it are driven by [`RemoteShell`]: a pump task owns the russh
//! channel, forwards its data and extended data into the channel's shared
//! buffers, and serialises writes coming from the front end.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use russh::client::{self, Handle, Msg};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use russh::{Channel, ChannelMsg};
use secrecy::ExposeSecret;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

use super::config::{AuthMethod, HostKeyVerification, SshConfig};
use crate::channel::exitcode::UNKNOWN_EXIT;
use crate::channel::{Shared, StreamKind, lock};
use crate::error::{Result, TransportError};

/// SSH extended-data type for stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Poll step while waiting for a remote exit status.
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Output of a one-shot remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
}

/// SSH transport wrapping russh client.
pub struct SshTransport {
    /// The russh session handle.
    session: Handle<SshHandler>,

    /// Configuration used for this connection.
    config: SshConfig,
}

impl SshTransport {
    /// Connect to the SSH server and authenticate.
    pub async fn connect(config: SshConfig) -> Result<Self> {
        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });

        let host_key_error: Arc<Mutex<Option<TransportError>>> = Arc::new(Mutex::new(None));

        let handler = SshHandler {
            host: config.host.clone(),
            port: config.port,
            host_key_verification: config.host_key_verification.clone(),
            known_hosts_path: config.known_hosts_path.clone(),
            host_key_error: host_key_error.clone(),
        };

        info!("Connecting to {}", config.socket_addr());
        let mut session = tokio::time::timeout(
            config.timeout,
            client::connect(ssh_config, (config.host.as_str(), config.port), handler),
        )
        .await
        .map_err(|_| TransportError::Timeout(config.timeout))?
        .map_err(|e| {
            // If check_server_key stored a detailed error, use that instead
            // of the generic russh::Error::UnknownKey
            lock(&host_key_error).take().unwrap_or_else(|| match e {
                russh::Error::IO(source) => TransportError::ConnectionFailed {
                    host: config.host.clone(),
                    port: config.port,
                    source,
                },
                other => TransportError::Ssh(other),
            })
        })?;

        Self::authenticate(&mut session, &config).await?;
        info!("Authenticated to {} as {}", config.socket_addr(), config.username);

        Ok(Self { session, config })
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Open a session channel running an interactive shell on a pty, or
    /// `command` without a pty.
    pub(crate) async fn open_shell(&self, command: Option<&str>) -> Result<Channel<Msg>> {
        let channel = self
            .session
            .channel_open_session()
            .await
            .map_err(TransportError::Ssh)?;

        match command {
            None => {
                channel
                    .request_pty(
                        true,
                        &self.config.terminal_type,
                        self.config.terminal_width,
                        self.config.terminal_height,
                        0,
                        0,
                        &[],
                    )
                    .await
                    .map_err(TransportError::Ssh)?;
                channel
                    .request_shell(true)
                    .await
                    .map_err(TransportError::Ssh)?;
            }
            Some(command) => {
                channel
                    .exec(true, command)
                    .await
                    .map_err(TransportError::Ssh)?;
            }
        }
        Ok(channel)
    }

    /// Run `command` to completion on a fresh channel (no pty).
    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        debug!("[{}] exec: {}", self.config.host, command);
        let mut channel = self.open_shell(Some(command)).await?;
        let mut output = ExecOutput::default();

        let collect = async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
                    ChannelMsg::ExtendedData { data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                        output.stderr.extend_from_slice(&data)
                    }
                    ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
        };
        tokio::time::timeout(timeout, collect)
            .await
            .map_err(|_| TransportError::Timeout(timeout))?;

        let _ = channel.close().await;
        Ok(output)
    }

    /// Authenticate with the server.
    async fn authenticate(session: &mut Handle<SshHandler>, config: &SshConfig) -> Result<()> {
        let success = match &config.auth {
            AuthMethod::None => session
                .authenticate_none(&config.username)
                .await
                .map_err(TransportError::Ssh)?
                .success(),
            AuthMethod::Password(password) => session
                .authenticate_password(&config.username, password.expose_secret())
                .await
                .map_err(TransportError::Ssh)?
                .success(),
            AuthMethod::PrivateKey { path, passphrase } => {
                let passphrase = passphrase.as_ref().map(|p| p.expose_secret());
                let key = load_secret_key(path, passphrase)
                    .map_err(|e| TransportError::Key(e.to_string()))?;

                // Get the best RSA hash algorithm supported by the server
                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(TransportError::Ssh)?
                    .flatten();

                session
                    .authenticate_publickey(
                        &config.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(TransportError::Ssh)?
                    .success()
            }
        };

        if !success {
            return Err(TransportError::AuthenticationFailed {
                user: config.username.clone(),
            }
            .into());
        }

        Ok(())
    }

    /// Close the connection.
    pub async fn close(&self) -> Result<()> {
        info!("Disconnecting from {}", self.config.socket_addr());
        self.session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(TransportError::Ssh)?;
        Ok(())
    }
}

enum RemoteRequest {
    Data(Vec<u8>, oneshot::Sender<std::result::Result<(), russh::Error>>),
    Close,
}

/// Front end of a remote shell; the pump task owns the russh channel.
pub(crate) struct RemoteShell {
    requests: mpsc::Sender<RemoteRequest>,
    echoes_input: bool,
}

impl RemoteShell {
    pub fn start(channel: Channel<Msg>, echoes_input: bool, shared: Arc<Shared>) -> (Self, JoinHandle<()>) {
        let (requests, rx) = mpsc::channel(32);
        let pump = tokio::spawn(pump(channel, rx, shared));
        (
            Self {
                requests,
                echoes_input,
            },
            pump,
        )
    }

    pub fn echoes_input(&self) -> bool {
        self.echoes_input
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.requests
            .send(RemoteRequest::Data(data.to_vec(), ack))
            .await
            .map_err(|_| TransportError::Closed)?;
        done.await
            .map_err(|_| TransportError::Closed)?
            .map_err(TransportError::Ssh)?;
        Ok(())
    }

    /// Send `exit` unless the shell is already gone, wait for its status
    /// until `timeout`, then close the channel.
    pub async fn shutdown(&self, shared: &Shared, timeout: Duration) -> Result<()> {
        if shared.transport_exit().is_none() {
            if let Err(e) = self.write(b"exit\n").await {
                debug!("[{}] could not send exit: {}", shared.tag(), e);
            }
        }

        if self.exit_status(shared, timeout).await.is_none() {
            warn!("[{}] remote shell did not exit within {:?}", shared.tag(), timeout);
        }

        // Force the channel down; the pump may already be gone
        let _ = self.requests.send(RemoteRequest::Close).await;
        Ok(())
    }

    /// Poll for the exit status the pump records, for up to `timeout`.
    pub async fn exit_status(&self, shared: &Shared, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = shared.transport_exit() {
                return Some(code);
            }
            if Instant::now() >= deadline || self.requests.is_closed() {
                return shared.transport_exit();
            }
            sleep(EXIT_POLL).await;
        }
    }
}

async fn pump(mut channel: Channel<Msg>, mut requests: mpsc::Receiver<RemoteRequest>, shared: Arc<Shared>) {
    let mut stop = shared.shutdown_signal();
    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => shared.add_data(StreamKind::Stdout, &data),
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == SSH_EXTENDED_DATA_STDERR {
                        shared.add_data(StreamKind::Stderr, &data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    shared.set_transport_exit(i32::try_from(exit_status).unwrap_or(UNKNOWN_EXIT));
                    shared.mark_ended();
                }
                Some(ChannelMsg::Eof) => debug!("[{}] remote eof", shared.tag()),
                Some(ChannelMsg::Close) | None => {
                    shared.mark_ended();
                    break;
                }
                Some(_) => {}
            },
            req = requests.recv() => match req {
                Some(RemoteRequest::Data(bytes, ack)) => {
                    let _ = ack.send(channel.data(&bytes[..]).await);
                }
                Some(RemoteRequest::Close) | None => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
            },
            _ = stop.changed() => {
                let _ = channel.close().await;
                break;
            }
        }
    }
    debug!("[{}] remote pump finished", shared.tag());
}

/// SSH client handler for russh.
struct SshHandler {
    host: String,
    port: u16,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
    /// Stores a detailed host-key error so connect() can surface it
    /// instead of the generic russh::Error::UnknownKey.
    host_key_error: Arc<Mutex<Option<TransportError>>>,
}

impl SshHandler {
    /// Check the host key against known_hosts.
    ///
    /// Returns `Ok(true)` if matched, `Ok(false)` if host not found,
    /// `Err(TransportError::HostKeyChanged)` if key changed.
    fn check_known_hosts(&self, pubkey: &PublicKey) -> std::result::Result<bool, TransportError> {
        let result = match &self.known_hosts_path {
            Some(path) => russh::keys::check_known_hosts_path(&self.host, self.port, pubkey, path),
            None => russh::keys::check_known_hosts(&self.host, self.port, pubkey),
        };

        match result {
            Ok(matched) => Ok(matched),
            Err(russh::keys::Error::KeyChanged { line }) => Err(TransportError::HostKeyChanged {
                host: self.host.clone(),
                port: self.port,
                line,
            }),
            Err(e) => Err(TransportError::KnownHosts(e.to_string())),
        }
    }

    fn learn_host_key(&self, pubkey: &PublicKey) -> std::result::Result<(), TransportError> {
        let result = match &self.known_hosts_path {
            Some(path) => {
                russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, pubkey, path)
            }
            None => russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, pubkey),
        };

        result.map_err(|e| TransportError::KnownHosts(e.to_string()))
    }

    fn reject(&self, error: TransportError) -> bool {
        *lock(&self.host_key_error) = Some(error);
        false
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let accepted = match self.host_key_verification {
            HostKeyVerification::Disabled => true,

            HostKeyVerification::AcceptNew => match self.check_known_hosts(server_public_key) {
                Ok(true) => true,
                Ok(false) => {
                    if let Err(e) = self.learn_host_key(server_public_key) {
                        warn!("Failed to save host key for {}: {}", self.host, e);
                    }
                    true
                }
                Err(e) => self.reject(e),
            },

            HostKeyVerification::Strict => match self.check_known_hosts(server_public_key) {
                Ok(true) => true,
                Ok(false) => self.reject(TransportError::HostKeyUnknown {
                    host: self.host.clone(),
                    port: self.port,
                }),
                Err(e) => self.reject(e),
            },
        };
        Ok(accepted)
    }
}
