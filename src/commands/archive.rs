//! Archive Command Handler
//!
//! The wire-visible command set of logvault. `SET` is the only command that
//! does real work; the others exist so that stock Redis clients, which send
//! `SELECT`, `PING` and friends on connect, are happy.
//!
//! ## Write modes
//!
//! - [`WriteMode::Sync`]: `SET` replies after the line is on disk.
//! - [`WriteMode::Queued`]: `SET` validates the key, pushes the line onto a
//!   bounded queue and replies right away. A single background writer drains
//!   the queue in FIFO order, so lines for one key land in the order they
//!   were acknowledged. Delivery is at most once: a failed write is logged
//!   and dropped. A full queue is reported to the client as an error.

use crate::archive::{ArchiveKey, FileResourceManager};
use crate::commands::{CommandError, CommandRegistry, RegistryError, Status};
use crate::server::Lifecycle;
use bytes::Bytes;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default capacity of the write queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// How `SET` reaches the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Append before replying
    Sync,
    /// Enqueue before replying; a background task appends
    Queued { capacity: usize },
}

impl Default for WriteMode {
    fn default() -> Self {
        WriteMode::Queued {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Settings for an [`ArchiveHandler`].
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Returned by `VERSION`
    pub version: String,
    pub write_mode: WriteMode,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            version: crate::VERSION.to_string(),
            write_mode: WriteMode::default(),
        }
    }
}

/// A line waiting for the background writer.
#[derive(Debug)]
struct WriteItem {
    key: ArchiveKey,
    content: Bytes,
}

/// Queue plumbing for [`WriteMode::Queued`].
#[derive(Debug)]
struct WriteQueue {
    tx: mpsc::Sender<WriteItem>,
    rx: Mutex<Option<mpsc::Receiver<WriteItem>>>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Implements the archive command set on top of a [`FileResourceManager`].
#[derive(Debug)]
pub struct ArchiveHandler {
    manager: Arc<FileResourceManager>,
    version: String,
    queue: Option<WriteQueue>,
}

impl ArchiveHandler {
    pub fn new(manager: Arc<FileResourceManager>, config: HandlerConfig) -> Arc<Self> {
        let queue = match config.write_mode {
            WriteMode::Sync => None,
            WriteMode::Queued { capacity } => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                let (shutdown_tx, _) = watch::channel(false);
                Some(WriteQueue {
                    tx,
                    rx: Mutex::new(Some(rx)),
                    shutdown_tx,
                    worker: Mutex::new(None),
                })
            }
        };

        Arc::new(Self {
            manager,
            version: config.version,
            queue,
        })
    }

    pub fn manager(&self) -> &Arc<FileResourceManager> {
        &self.manager
    }

    pub fn write_mode(&self) -> WriteMode {
        match &self.queue {
            None => WriteMode::Sync,
            Some(queue) => WriteMode::Queued {
                capacity: queue.tx.max_capacity(),
            },
        }
    }

    /// Starts the background writer in queued mode. Calling it again is a
    /// no-op.
    pub fn init(&self) {
        let Some(queue) = &self.queue else {
            return;
        };
        let Some(rx) = lock(&queue.rx).take() else {
            return;
        };

        let shutdown_rx = queue.shutdown_tx.subscribe();
        let handle = tokio::spawn(run_writer(Arc::clone(&self.manager), rx, shutdown_rx));
        *lock(&queue.worker) = Some(handle);

        info!(capacity = queue.tx.max_capacity(), "background writer started");
    }

    /// Stops the writer (after draining what was already queued) and closes
    /// every archive file.
    pub async fn shutdown(&self) {
        if let Some(queue) = &self.queue {
            queue.shutdown_tx.send_replace(true);
            let worker = lock(&queue.worker).take();
            if let Some(worker) = worker {
                if let Err(e) = worker.await {
                    warn!(error = %e, "background writer ended abnormally");
                }
            }
        }
        self.manager.shutdown().await;
    }

    /// The explicit allow-list of wire-visible commands.
    pub fn commands(self: &Arc<Self>) -> Result<CommandRegistry<Self>, RegistryError> {
        Ok(CommandRegistry::builder(Arc::clone(self))
            .register("set", Self::set)?
            .register("select", Self::select)?
            .register("version", Self::version)?
            .register("ping", Self::ping)?
            .register("flushall", Self::flushall)?
            .register("flushdb", Self::flushdb)?
            .build())
    }

    /// `SET key content`
    pub async fn set(self: Arc<Self>, key: Bytes, content: Bytes) -> Result<(), CommandError> {
        let key = ArchiveKey::from_bytes(&key)?;

        match &self.queue {
            None => Ok(self.manager.save_key(&key, &content).await?),
            Some(queue) => match queue.tx.try_send(WriteItem { key, content }) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(item)) => {
                    warn!(key = %item.key, "write queue full, rejecting line");
                    Err(CommandError::QueueFull)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(CommandError::ShuttingDown),
            },
        }
    }

    /// `SELECT db`
    pub async fn select(self: Arc<Self>, _db: i64) -> Result<Status, CommandError> {
        Ok(Status::ok())
    }

    /// `VERSION`
    pub async fn version(self: Arc<Self>) -> Result<String, CommandError> {
        Ok(self.version.clone())
    }

    /// `PING [message]`
    pub async fn ping(self: Arc<Self>, message: Option<String>) -> Result<String, CommandError> {
        Ok(message.unwrap_or_else(|| "PONG".to_string()))
    }

    /// `FLUSHALL`
    pub async fn flushall(self: Arc<Self>) -> Result<Status, CommandError> {
        Ok(Status::ok())
    }

    /// `FLUSHDB db`
    pub async fn flushdb(self: Arc<Self>, _db: i64) -> Result<Status, CommandError> {
        Err(CommandError::Unsupported("FLUSHDB"))
    }
}

impl Lifecycle for ArchiveHandler {
    fn shutdown(&self) -> impl Future<Output = ()> + Send {
        ArchiveHandler::shutdown(self)
    }
}

/// Poison only happens if a holder panicked; the guarded values are plain
/// `Option`s, so they stay usable.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Background writer: drains the queue into the manager until shutdown.
async fn run_writer(
    manager: Arc<FileResourceManager>,
    mut rx: mpsc::Receiver<WriteItem>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => write_item(&manager, item).await,
                None => break,
            },
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Refuse new lines, then flush what was acknowledged already.
    rx.close();
    let mut drained = 0u64;
    while let Some(item) = rx.recv().await {
        write_item(&manager, item).await;
        drained += 1;
    }

    info!(drained, "background writer stopped");
}

async fn write_item(manager: &Arc<FileResourceManager>, item: WriteItem) {
    debug!(key = %item.key, bytes = item.content.len(), "archiving queued line");
    match manager.save_key(&item.key, &item.content).await {
        Ok(()) => debug!(key = %item.key, "queued line archived"),
        Err(e) => warn!(key = %item.key, error = %e, "dropping queued line"),
    }
}
