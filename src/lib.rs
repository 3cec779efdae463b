//! # logvault - A Redis-Protocol Log Archiving Daemon
//!
//! logvault speaks RESP so that any Redis client can ship log lines to it.
//! `SET key line` appends `line` to the file `<root>/key`; a handful of other
//! commands (`PING`, `SELECT`, ...) exist so that stock clients connect
//! without complaint.
//!
//! ## Features
//!
//! - **Redis-Compatible**: RESP2 requests and inline commands, over TCP or a Unix socket
//! - **Bounded Open Files**: one append handle per key, closed again when idle
//! - **Ordered Writes**: lines for one key are never interleaved or reordered
//! - **Queued Mode**: acknowledge before the disk write, drained on shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              logvault                                   │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP / Unix  │───>│ Connection  │───>│  Command    │                  │
//! │  │  Listener   │    │  Handler    │    │  Registry   │                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │                         │
//! │                                               ▼                         │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐   │
//! │  │   RESP      │    │  ArchiveHandler ──> write queue ──> writer   │   │
//! │  │   Parser    │    └──────────────────────┬───────────────────────┘   │
//! │  └─────────────┘                           ▼                           │
//! │                     ┌──────────────────────────────────────────────┐   │
//! │                     │            FileResourceManager               │   │
//! │                     │  ┌────────┐ ┌────────┐ ┌────────┐            │   │
//! │                     │  │ key A  │ │ key B  │ │ ...    │  watchers  │   │
//! │                     │  └────────┘ └────────┘ └────────┘            │   │
//! │                     └──────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use logvault::archive::{FileResourceManager, ManagerConfig};
//! use logvault::commands::{ArchiveHandler, HandlerConfig};
//! use logvault::server::{ListenAddr, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = FileResourceManager::new(ManagerConfig::new("/var/log/vault"));
//!     let handler = ArchiveHandler::new(manager, HandlerConfig::default());
//!     let server = Server::bind(&ListenAddr::parse("127.0.0.1:6379"), handler.commands()?).await?;
//!
//!     handler.init();
//!     server.serve(async { let _ = tokio::signal::ctrl_c().await; }).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP parser, reply values and requests
//! - [`archive`]: archive keys and the file resource manager
//! - [`commands`]: command registry, reply encoding and the archive command set
//! - [`server`]: listeners, connections and graceful shutdown
//! - [`config`]: command-line and environment configuration

pub mod archive;
pub mod commands;
pub mod config;
pub mod protocol;
pub mod server;

// Re-export commonly used types for convenience
pub use archive::{ArchiveError, FileResourceManager, ManagerConfig};
pub use commands::{ArchiveHandler, CommandError, CommandRegistry, HandlerConfig, WriteMode};
pub use config::{Config, ConfigError, Settings};
pub use protocol::{ParseError, RespParser, RespValue};
pub use server::{ListenAddr, Server, ServerError};

/// The default listen address (same port as Redis)
pub const DEFAULT_LISTEN: &str = "127.0.0.1:6379";

/// Version of logvault, also returned by `VERSION`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
