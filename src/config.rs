//! Command-line and environment configuration.
//!
//! Every flag can also be set through a `LOGVAULT_*` environment variable.
//! [`Config::validate`] turns the raw values into a [`Settings`] the rest of
//! the crate consumes.

use crate::archive::fsutil::resolve_existing_dir;
use crate::archive::ManagerConfig;
use crate::commands::{HandlerConfig, WriteMode};
use crate::server::ListenAddr;
use clap::{Parser, ValueEnum};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Raw configuration as given on the command line.
#[derive(Parser, Debug, Clone)]
#[command(name = "logvault", version, about = "Redis-protocol log archiving daemon", long_about = None)]
pub struct Config {
    /// TCP `host:port` (or `:port`), or a Unix socket path.
    #[arg(long, env = "LOGVAULT_LISTEN", default_value = crate::DEFAULT_LISTEN)]
    pub listen: String,

    /// Archive root directory. Must already exist.
    #[arg(long, env = "LOGVAULT_DIR", default_value = "./data")]
    pub dir: PathBuf,

    /// Seconds without writes before an archive file is closed.
    #[arg(long, env = "LOGVAULT_TIMEOUT", default_value_t = 60)]
    pub timeout: u64,

    /// Octal permission bits for newly created archive files.
    #[arg(long, env = "LOGVAULT_PERM", default_value = "0644")]
    pub perm: String,

    /// Whether SET replies after the write or after enqueueing it.
    #[arg(long, env = "LOGVAULT_WRITE_MODE", value_enum, default_value_t = WriteModeArg::Queued)]
    pub write_mode: WriteModeArg,

    /// Capacity of the write queue in queued mode.
    #[arg(long, env = "LOGVAULT_QUEUE_CAPACITY", default_value_t = 1024)]
    pub queue_capacity: usize,

    /// Seconds connections get to finish on shutdown.
    #[arg(long, env = "LOGVAULT_GRACE", default_value_t = 10)]
    pub grace: u64,

    /// Default log filter; `RUST_LOG` takes precedence.
    #[arg(long, env = "LOGVAULT_LOG", default_value = "info")]
    pub log_level: String,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteModeArg {
    Sync,
    Queued,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("archive directory {path}: {source}")]
    Dir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("timeout must be greater than zero")]
    ZeroTimeout,

    #[error("invalid file permission '{0}', expected octal such as 0644")]
    InvalidPerm(String),

    #[error("queue capacity must be greater than zero")]
    ZeroQueueCapacity,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: ListenAddr,
    pub root: PathBuf,
    pub idle_timeout: Duration,
    pub file_mode: u32,
    pub write_mode: WriteMode,
    pub grace_period: Duration,
}

impl Config {
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        if self.timeout == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        let file_mode = parse_mode(&self.perm)?;

        let write_mode = match self.write_mode {
            WriteModeArg::Sync => WriteMode::Sync,
            WriteModeArg::Queued => {
                if self.queue_capacity == 0 {
                    return Err(ConfigError::ZeroQueueCapacity);
                }
                WriteMode::Queued {
                    capacity: self.queue_capacity,
                }
            }
        };

        let root = resolve_existing_dir(&self.dir).map_err(|source| ConfigError::Dir {
            path: self.dir.clone(),
            source,
        })?;

        Ok(Settings {
            listen: ListenAddr::parse(&self.listen),
            root,
            idle_timeout: Duration::from_secs(self.timeout),
            file_mode,
            write_mode,
            grace_period: Duration::from_secs(self.grace),
        })
    }
}

impl Settings {
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig::new(&self.root)
            .with_idle_timeout(self.idle_timeout)
            .with_file_mode(self.file_mode)
    }

    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            version: crate::VERSION.to_string(),
            write_mode: self.write_mode,
        }
    }
}

/// Parses `0644`, `644` or `0o644`.
fn parse_mode(raw: &str) -> Result<u32, ConfigError> {
    let digits = raw.strip_prefix("0o").unwrap_or(raw);
    match u32::from_str_radix(digits, 8) {
        Ok(mode) if !digits.is_empty() && mode <= 0o7777 => Ok(mode),
        _ => Err(ConfigError::InvalidPerm(raw.to_string())),
    }
}
