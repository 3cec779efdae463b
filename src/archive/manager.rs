//! File Resource Manager
//!
//! Owns the open archive files. Each key maps to one [`ArchiveEntry`] holding
//! the append handle and the time of the last write. An entry is created by
//! the first save for its key and lives until its eviction watcher finds it
//! idle, or until the manager shuts down.
//!
//! ## Eviction
//!
//! Every entry gets exactly one watcher task. The watcher wakes up every half
//! timeout and compares the entry's `last_activity` against the timeout.
//! Writers refresh `last_activity` while holding the entry lock, and the
//! watcher only tears an entry down after re-checking `last_activity` while
//! holding the registry lock and the entry lock. A writer that gets the
//! entry lock first therefore always cancels that round of eviction, and a
//! writer that arrives after an eviction sees the closed entry and looks the
//! key up again.

use crate::archive::{fsutil, ArchiveError, ArchiveKey};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Default idle timeout before an archive file is closed
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default mode for newly created archive files
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Settings for a [`FileResourceManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory archive files are created in
    pub root: PathBuf,
    /// How long a file may go without writes before it is closed
    pub idle_timeout: Duration,
    /// Permission bits for files the manager creates
    pub file_mode: u32,
}

impl ManagerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            file_mode: DEFAULT_FILE_MODE,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_file_mode(mut self, file_mode: u32) -> Self {
        self.file_mode = file_mode;
        self
    }
}

/// Counters describing archive activity.
#[derive(Debug, Default)]
pub struct ArchiveStats {
    /// Files opened (first write or write after eviction)
    pub opens: AtomicU64,
    /// Files closed by their eviction watcher
    pub evictions: AtomicU64,
    /// Lines appended successfully
    pub lines_written: AtomicU64,
    /// Bytes appended successfully, newlines included
    pub bytes_written: AtomicU64,
    /// Failed appends
    pub write_errors: AtomicU64,
}

impl ArchiveStats {
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }
}

/// One open archive file.
#[derive(Debug)]
struct ArchiveEntry {
    key: ArchiveKey,
    state: Mutex<EntryState>,
}

#[derive(Debug)]
struct EntryState {
    /// `None` once the entry has been evicted or shut down
    file: Option<Arc<File>>,
    last_activity: Instant,
}

impl ArchiveEntry {
    fn new(key: ArchiveKey, file: File) -> Self {
        Self {
            key,
            state: Mutex::new(EntryState {
                file: Some(Arc::new(file)),
                last_activity: Instant::now(),
            }),
        }
    }
}

/// Owns one append handle per archive key.
///
/// Shared as `Arc<FileResourceManager>`; eviction watchers hold a weak
/// reference back to it.
#[derive(Debug)]
pub struct FileResourceManager {
    config: ManagerConfig,
    entries: Mutex<HashMap<ArchiveKey, Arc<ArchiveEntry>>>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    stats: ArchiveStats,
}

impl FileResourceManager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            entries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown_tx,
            stats: ArchiveStats::default(),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn stats(&self) -> &ArchiveStats {
        &self.stats
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Appends `line` plus a newline to the archive file for `key`.
    ///
    /// The key is validated before anything is touched on disk.
    pub async fn save(self: &Arc<Self>, key: &str, line: &[u8]) -> Result<(), ArchiveError> {
        let key = ArchiveKey::parse(key)?;
        self.save_key(&key, line).await
    }

    /// Appends `line` plus a newline to the archive file for an already
    /// validated key.
    pub async fn save_key(self: &Arc<Self>, key: &ArchiveKey, line: &[u8]) -> Result<(), ArchiveError> {
        loop {
            let entry = self.acquire(key).await?;
            let mut state = entry.state.lock().await;

            let Some(file) = state.file.clone() else {
                // Evicted between the registry lookup and taking the lock.
                trace!(key = %key, "entry closed under us, reopening");
                continue;
            };

            state.last_activity = Instant::now();

            return match append_line(file, line).await {
                Ok(written) => {
                    self.stats.lines_written.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .bytes_written
                        .fetch_add(written as u64, Ordering::Relaxed);
                    Ok(())
                }
                Err(e) => {
                    self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "failed to append to archive file");
                    Err(e)
                }
            };
        }
    }

    /// Looks up the entry for `key`, opening the file if needed.
    async fn acquire(self: &Arc<Self>, key: &ArchiveKey) -> Result<Arc<ArchiveEntry>, ArchiveError> {
        let mut entries = self.entries.lock().await;

        if self.closed.load(Ordering::Acquire) {
            return Err(ArchiveError::Closed);
        }

        if let Some(entry) = entries.get(key) {
            return Ok(Arc::clone(entry));
        }

        let path = key.path_in(&self.config.root);
        let file = open_for_append(&path, self.config.file_mode)
            .await
            .inspect_err(|e| warn!(key = %key, path = %path.display(), error = %e, "failed to open archive file"))?;
        self.stats.opens.fetch_add(1, Ordering::Relaxed);

        let entry = Arc::new(ArchiveEntry::new(key.clone(), file));
        entries.insert(key.clone(), Arc::clone(&entry));
        self.spawn_watcher(&entry);

        info!(key = %key, path = %path.display(), "opened archive file");
        Ok(entry)
    }

    fn spawn_watcher(self: &Arc<Self>, entry: &Arc<ArchiveEntry>) {
        let manager = Arc::downgrade(self);
        let entry = Arc::clone(entry);
        let timeout = self.config.idle_timeout;
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(watch_entry(manager, entry, timeout, shutdown_rx));
    }

    /// Removes and closes `entry` if it is still idle.
    ///
    /// Returns `true` when the watcher should stop.
    async fn try_evict(&self, entry: &Arc<ArchiveEntry>, timeout: Duration) -> bool {
        let mut entries = self.entries.lock().await;

        // A held entry lock means a write is in progress, so the entry is
        // not idle. Never wait on it while holding the registry lock.
        let Ok(mut state) = entry.state.try_lock() else {
            return false;
        };

        if state.file.is_none() {
            return true;
        }

        let idle = state.last_activity.elapsed();
        if idle < timeout {
            return false;
        }

        if entries
            .get(&entry.key)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            entries.remove(&entry.key);
        }
        state.file = None;
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);

        info!(
            key = %entry.key,
            idle_ms = idle.as_millis() as u64,
            "closed idle archive file"
        );
        true
    }

    /// Number of currently open archive files.
    pub async fn open_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the file for `key` is currently open.
    pub async fn is_open(&self, key: &str) -> bool {
        match ArchiveKey::parse(key) {
            Ok(key) => self.entries.lock().await.contains_key(&key),
            Err(_) => false,
        }
    }

    /// Keys with an open file, sorted.
    pub async fn open_keys(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries.keys().map(|k| k.to_string()).collect();
        keys.sort();
        keys
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes every open file and stops every watcher. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;

        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_tx.send_replace(true);

        let count = entries.len();
        for (_, entry) in entries.drain() {
            let mut state = entry.state.lock().await;
            state.file = None;
        }

        info!(
            closed = count,
            lines_written = self.stats.lines_written(),
            "archive manager shut down"
        );
    }
}

/// Eviction loop for a single entry.
async fn watch_entry(
    manager: Weak<FileResourceManager>,
    entry: Arc<ArchiveEntry>,
    timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let period = (timeout / 2).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!(key = %entry.key, "eviction watcher stopped by shutdown");
                    return;
                }
                continue;
            }
        }

        {
            let state = entry.state.lock().await;
            if state.file.is_none() {
                return;
            }
            if state.last_activity.elapsed() < timeout {
                continue;
            }
        }

        let Some(manager) = manager.upgrade() else {
            return;
        };
        if manager.try_evict(&entry, timeout).await {
            return;
        }
    }
}

/// Opens `path` for appending, creating it and its parent directories.
async fn open_for_append(path: &Path, mode: u32) -> io::Result<File> {
    fsutil::ensure_parent_dir(path).await?;

    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    options.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;

    let file = options.open(path).await?;
    Ok(file.into_std().await)
}

/// Appends `line` and a newline with a single write call.
async fn append_line(file: Arc<File>, line: &[u8]) -> Result<usize, ArchiveError> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line);
    buf.push(b'\n');
    let expected = buf.len();

    let written = tokio::task::spawn_blocking(move || (&*file).write(&buf))
        .await
        .map_err(io::Error::other)??;

    if written != expected {
        return Err(ArchiveError::PartialWrite { expected, written });
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_in(root: &Path, timeout: Duration) -> Arc<FileResourceManager> {
        FileResourceManager::new(ManagerConfig::new(root).with_idle_timeout(timeout))
    }

    #[tokio::test]
    async fn test_save_appends_line() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), Duration::from_secs(60));

        manager.save("access.log", b"hello").await.unwrap();
        manager.save("access.log", b"world").await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("access.log")).unwrap();
        assert_eq!(content, "hello\nworld\n");
        assert_eq!(manager.stats().lines_written(), 2);
    }

    #[tokio::test]
    async fn test_save_creates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested/archive");
        let manager = manager_in(&root, Duration::from_secs(60));

        manager.save("app:events", b"started").await.unwrap();

        let content = std::fs::read_to_string(root.join("app:events")).unwrap();
        assert_eq!(content, "started\n");
    }

    #[tokio::test]
    async fn test_invalid_key_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let manager = manager_in(&root, Duration::from_secs(60));

        for key in ["bad/name", "with space", "", ".."] {
            let err = manager.save(key, b"x").await.unwrap_err();
            assert!(matches!(err, ArchiveError::InvalidKey(_)));
        }

        assert!(!root.exists());
        assert_eq!(manager.open_count().await, 0);
        assert_eq!(manager.stats().opens(), 0);
    }

    #[tokio::test]
    async fn test_repeated_saves_reuse_handle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), Duration::from_secs(60));

        for i in 0..10 {
            manager.save("reuse.log", format!("line {i}").as_bytes()).await.unwrap();
        }

        assert_eq!(manager.stats().opens(), 1);
        assert_eq!(manager.open_count().await, 1);
        assert!(manager.is_open("reuse.log").await);
    }

    #[tokio::test]
    async fn test_idle_entry_is_evicted_and_reopened() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), Duration::from_millis(100));

        manager.save("idle.log", b"first").await.unwrap();
        assert!(manager.is_open("idle.log").await);

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(!manager.is_open("idle.log").await);
        assert_eq!(manager.open_count().await, 0);
        assert_eq!(manager.stats().evictions(), 1);

        manager.save("idle.log", b"second").await.unwrap();
        assert_eq!(manager.stats().opens(), 2);

        let content = std::fs::read_to_string(dir.path().join("idle.log")).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_activity_keeps_entry_open() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), Duration::from_millis(200));

        for i in 0..12 {
            manager.save("busy.log", format!("{i}").as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(manager.stats().opens(), 1);
        assert_eq!(manager.stats().evictions(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_key_writes_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), Duration::from_secs(60));

        let mut handles = Vec::new();
        for task in 0..20 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    let line = format!("task-{task:02}-line-{i:02}-{}", "x".repeat(64));
                    manager.save("shared.log", line.as_bytes()).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let content = std::fs::read_to_string(dir.path().join("shared.log")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 500);
        assert!(lines
            .iter()
            .all(|l| l.starts_with("task-") && l.ends_with(&"x".repeat(64)) && l.len() == 80));
        assert_eq!(manager.stats().opens(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), Duration::from_secs(60));

        let mut handles = Vec::new();
        for k in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                let key = format!("key-{k}.log");
                for i in 0..50 {
                    manager.save(&key, format!("{i}").as_bytes()).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(manager.open_count().await, 8);
        for k in 0..8 {
            let content = std::fs::read_to_string(dir.path().join(format!("key-{k}.log"))).unwrap();
            let expected: String = (0..50).map(|i| format!("{i}\n")).collect();
            assert_eq!(content, expected);
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), Duration::from_secs(60));

        manager.save("a.log", b"a").await.unwrap();
        manager.save("b.log", b"b").await.unwrap();
        assert_eq!(manager.open_keys().await, vec!["a.log", "b.log"]);

        manager.shutdown().await;
        manager.shutdown().await;

        assert!(manager.is_closed());
        assert_eq!(manager.open_count().await, 0);
        assert!(matches!(
            manager.save("a.log", b"late").await,
            Err(ArchiveError::Closed)
        ));

        let content = std::fs::read_to_string(dir.path().join("a.log")).unwrap();
        assert_eq!(content, "a\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_mode_applied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let manager = FileResourceManager::new(ManagerConfig::new(dir.path()).with_file_mode(0o600));

        manager.save("private.log", b"secret").await.unwrap();

        let mode = std::fs::metadata(dir.path().join("private.log"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_open_failure_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        // The root is a regular file, so nothing can be created under it.
        let root = dir.path().join("not-a-dir");
        std::fs::write(&root, b"").unwrap();
        let manager = manager_in(&root, Duration::from_secs(60));

        let err = manager.save("x.log", b"line").await.unwrap_err();
        assert!(matches!(err, ArchiveError::Io(_)));
        assert_eq!(manager.open_count().await, 0);
    }
}
