//! Archive Storage Module
//!
//! Everything that touches the archive directory lives here. The
//! [`FileResourceManager`] keeps one open append handle per archive key,
//! serializes writes to the same key and closes handles that have been idle
//! for longer than the configured timeout.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  FileResourceManager                         │
//! │                                                              │
//! │   registry: Mutex<HashMap<ArchiveKey, Arc<ArchiveEntry>>>    │
//! │                                                              │
//! │   ┌──────────────┐  ┌──────────────┐  ┌──────────────┐       │
//! │   │ access.log   │  │ error.log    │  │ app:audit    │  ...  │
//! │   │ Mutex<state> │  │ Mutex<state> │  │ Mutex<state> │       │
//! │   └──────┬───────┘  └──────┬───────┘  └──────┬───────┘       │
//! └──────────┼─────────────────┼─────────────────┼───────────────┘
//!            ▲                 ▲                 ▲
//!     eviction watcher  eviction watcher  eviction watcher
//!     (one Tokio task per open entry)
//! ```
//!
//! Lock order is always registry first, entry second. Appends only hold
//! the entry lock, so writes to different keys run in parallel.

pub mod fsutil;
pub mod key;
pub mod manager;

pub use key::{is_valid_key, ArchiveKey};
pub use manager::{ArchiveStats, FileResourceManager, ManagerConfig};

use thiserror::Error;

/// Errors raised while archiving a line.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Key does not match `[A-Za-z0-9_.:-]+`
    #[error("invalid archive key '{0}'")]
    InvalidKey(String),

    /// The file accepted fewer bytes than the line plus newline
    #[error("partial write: {written} of {expected} bytes written")]
    PartialWrite { expected: usize, written: usize },

    /// Open or write failure at the filesystem boundary
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The manager has been shut down
    #[error("archive is shut down")]
    Closed,
}
