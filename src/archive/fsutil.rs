//! Filesystem helpers for the archive root.

use std::io;
use std::path::{Path, PathBuf};

/// Mode used for directories created under the archive root.
pub const DIR_MODE: u32 = 0o755;

/// Creates every missing directory above `file`.
pub async fn ensure_parent_dir(file: &Path) -> io::Result<()> {
    let Some(parent) = file.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(DIR_MODE);

    builder.create(parent).await
}

/// Resolves `dir` to an absolute path and checks that it is an existing
/// directory.
pub fn resolve_existing_dir(dir: &Path) -> io::Result<PathBuf> {
    let absolute = std::path::absolute(dir)?;
    let meta = std::fs::metadata(&absolute)?;
    if !meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", absolute.display()),
        ));
    }
    Ok(absolute)
}
