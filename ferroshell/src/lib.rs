//! # Ferroshell
//!
//! Async interactive command channels for local processes and SSH shells.
//!
//! Ferroshell keeps a shell running and drives it the way a person at a
//! terminal would: send a line, wait until the output settles or the prompt
//! comes back, read what was printed. Exit codes are recovered in-band, so
//! they work the same locally, over SSH and inside nested consoles.
//!
//! ## Features
//!
//! - Local shells on pseudo-terminals (or pipes) and remote shells via russh
//! - Quiescence and prompt based completion detection
//! - Exit codes through an in-band marker, with optional careful mode
//! - Nested consoles: `sudo`, `su`, sub-shells and interactive programs
//! - Line streaming for never-ending commands
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ferroshell::{EngineConfig, SessionBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ferroshell::Error> {
//!     let session = SessionBuilder::local()
//!         .config(EngineConfig::from_env()?)
//!         .build()
//!         .await?;
//!
//!     let shell = session.shell(None).await?;
//!     shell.run("cd /tmp").await?;
//!     let result = shell.run("pwd").await?;
//!     println!("{} (exit {})", result.stdout.trim(), result.exitcode);
//!
//!     shell.close().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod driver;
pub mod error;
pub mod transport;

// Re-export main types for convenience
pub use channel::{
    Channel, ExpectMatch, ExpectOptions, OutputMask, Prompt, PromptState, SendOptions, StreamKind,
    UNKNOWN_EXIT,
};
pub use config::EngineConfig;
pub use driver::{
    CommandResult, CommandStream, Elevation, InteractiveProgram, IterateOptions, NestedConsole,
    Session, SessionBuilder, StreamLine,
};
pub use error::{Error, Result};
pub use transport::{AuthMethod, HostKeyVerification, SshConfig, SshTransport};
