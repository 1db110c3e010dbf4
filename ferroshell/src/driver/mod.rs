//! High-level API on top of channels.
//!
//! The driver layer adds sessions (one-shot execution, scripts, persistent
//! shells), nested consoles (sudo, su, sub-shells, interactive programs)
//! and line streaming for never-ending commands.

mod builder;
mod interactive;
mod privilege;
pub(crate) mod response;
mod session;
mod stream;

pub use builder::SessionBuilder;
pub use interactive::{DEFAULT_TERMINATOR, InteractiveProgram};
pub use privilege::{
    DEFAULT_AUTH_PATTERN, DEFAULT_FAILURE_PATTERNS, DEFAULT_SUDO_COMMAND, Elevation, NestedConsole,
};
pub use response::CommandResult;
pub use session::Session;
pub use stream::{CommandStream, DEFAULT_INTERRUPT, IterateOptions, StreamLine};
