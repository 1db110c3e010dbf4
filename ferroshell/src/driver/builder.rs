//! Builder for creating sessions.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use super::session::{Session, Target};
use crate::config::EngineConfig;
use crate::error::{ConfigError, Result};
use crate::transport::config::{AuthMethod, HostKeyVerification, SshConfig};
use crate::transport::SshTransport;

/// Builder for constructing [`Session`]s.
///
/// # Example
///
/// ```rust,no_run
/// use ferroshell::SessionBuilder;
///
/// # async fn example() -> Result<(), ferroshell::Error> {
/// let session = SessionBuilder::remote("192.168.1.1")
///     .username("admin")
///     .password("secret")
///     .build()
///     .await?;
///
/// let result = session.exec("uname -a").await?;
/// println!("{}", result);
/// session.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder {
    host: Option<String>,
    port: u16,
    username: Option<String>,
    auth: AuthMethod,
    timeout: Duration,
    terminal_width: u32,
    terminal_height: u32,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
    config: Option<EngineConfig>,
    careful: bool,
}

impl SessionBuilder {
    fn with_host(host: Option<String>) -> Self {
        Self {
            host,
            port: 22,
            username: None,
            auth: AuthMethod::None,
            timeout: Duration::from_secs(30),
            terminal_width: 511,
            terminal_height: 24,
            host_key_verification: HostKeyVerification::default(),
            known_hosts_path: None,
            config: None,
            careful: false,
        }
    }

    /// A session on this machine.
    pub fn local() -> Self {
        Self::with_host(None)
    }

    /// A session on `host` over SSH.
    pub fn remote(host: impl Into<String>) -> Self {
        Self::with_host(Some(host.into()))
    }

    /// Set the SSH port (default: 22).
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the username for authentication.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set password authentication.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.auth = AuthMethod::Password(SecretString::from(password.into()));
        self
    }

    /// Set private key authentication.
    pub fn private_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.auth = AuthMethod::PrivateKey {
            path: key_path.into(),
            passphrase: None,
        };
        self
    }

    /// Set private key authentication with passphrase.
    pub fn private_key_with_passphrase(
        mut self,
        key_path: impl Into<PathBuf>,
        passphrase: impl Into<String>,
    ) -> Self {
        self.auth = AuthMethod::PrivateKey {
            path: key_path.into(),
            passphrase: Some(SecretString::from(passphrase.into())),
        };
        self
    }

    /// Set the connection timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set terminal dimensions for remote shells.
    pub fn terminal_size(mut self, width: u32, height: u32) -> Self {
        self.terminal_width = width;
        self.terminal_height = height;
        self
    }

    /// Set how the server's host key is checked.
    pub fn host_key_verification(mut self, mode: HostKeyVerification) -> Self {
        self.host_key_verification = mode;
        self
    }

    /// Use a known_hosts file other than `~/.ssh/known_hosts`.
    pub fn known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    /// Engine tunables; defaults to [`EngineConfig::from_env`].
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Start the session in careful mode.
    pub fn careful(mut self, careful: bool) -> Self {
        self.careful = careful;
        self
    }

    /// Build the session, connecting and authenticating for remote hosts.
    pub async fn build(self) -> Result<Session> {
        let config = match self.config {
            Some(config) => config,
            None => EngineConfig::from_env()?,
        };

        let Some(host) = self.host else {
            return Ok(Session::new(Target::Local, config, self.careful));
        };
        let username = self.username.ok_or(ConfigError::MissingField("username"))?;

        let ssh_config = SshConfig {
            port: self.port,
            auth: self.auth,
            timeout: self.timeout,
            terminal_width: self.terminal_width,
            terminal_height: self.terminal_height,
            host_key_verification: self.host_key_verification,
            known_hosts_path: self.known_hosts_path,
            ..SshConfig::new(host, username)
        };
        let transport = SshTransport::connect(ssh_config).await?;

        Ok(Session::new(
            Target::Remote(transport.into()),
            config,
            self.careful,
        ))
    }
}
