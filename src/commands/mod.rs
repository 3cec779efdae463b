//! Command Layer
//!
//! Turns parsed requests into handler calls and handler results into replies.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  RESP Parser    │  (protocol module)
//! └────────┬────────┘
//!          │ Request
//!          ▼
//! ┌─────────────────┐
//! │ CommandRegistry │  name lookup, arity, argument decoding
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐      ┌──────────────┐
//! │ ArchiveHandler  │ ───> │ write queue  │ (queued mode)
//! └────────┬────────┘      └──────┬───────┘
//!          │                      │
//!          ▼                      ▼
//! ┌──────────────────────────────────────┐
//! │        FileResourceManager           │  (archive module)
//! └──────────────────────────────────────┘
//! ```
//!
//! ## Commands
//!
//! - `SET key content` - append `content` as a line to the archive `key`
//! - `PING [message]`
//! - `VERSION`
//! - `SELECT db` - accepted and ignored
//! - `FLUSHALL` - accepted and ignored
//! - `FLUSHDB db` - always an error

pub mod archive;
pub mod registry;
pub mod reply;

pub use archive::{ArchiveHandler, HandlerConfig, WriteMode};
pub use registry::{CommandFn, CommandRegistry, FromArg, RegistryBuilder, RegistryError};
pub use reply::{IntoReply, Status};

use crate::archive::ArchiveError;
use crate::protocol::RespValue;
use thiserror::Error;

/// Command-level failures. Each becomes a `-ERR ...` reply; none of them
/// closes the connection.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    /// An argument could not be decoded to its declared type
    #[error("{0}")]
    InvalidArgument(&'static str),

    #[error("{0}")]
    Param(String),

    #[error("{0} is not supported")]
    Unsupported(&'static str),

    #[error("write queue is full")]
    QueueFull,

    #[error("server is shutting down")]
    ShuttingDown,

    /// The detail is logged, never sent to the client
    #[error("internal server error")]
    Internal(String),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl CommandError {
    /// The error reply sent to the client.
    pub fn to_reply(&self) -> RespValue {
        RespValue::error(format!("ERR {}", self))
    }
}
