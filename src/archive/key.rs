//! Archive key validation.

use crate::archive::ArchiveError;
use std::fmt;
use std::path::{Path, PathBuf};

/// A validated archive name.
///
/// Keys are limited to `[A-Za-z0-9_.:-]+`, so a key can never contain a path
/// separator and always names a single file directly under the archive root.
/// The names `.` and `..` are refused as well, since they would resolve to a
/// directory rather than a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveKey(String);

impl ArchiveKey {
    /// Validates `raw` as an archive key.
    pub fn parse(raw: &str) -> Result<Self, ArchiveError> {
        if is_valid_key(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(ArchiveError::InvalidKey(raw.to_string()))
        }
    }

    /// Validates raw bytes as an archive key.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ArchiveError> {
        match std::str::from_utf8(raw) {
            Ok(s) => Self::parse(s),
            Err(_) => Err(ArchiveError::InvalidKey(
                String::from_utf8_lossy(raw).into_owned(),
            )),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of the archive file for this key under `root`.
    pub fn path_in(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ArchiveKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Checks `key` against `^[A-Za-z0-9_.:-]+$`, excluding `.` and `..`.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key != "."
        && key != ".."
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b':' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_keys() {
        for key in ["access.log", "app:2024-01-01", "A_b-C.d:e", "0", "x..y"] {
            assert!(is_valid_key(key), "{key} should be valid");
        }
    }

    #[test]
    fn test_invalid_keys() {
        for key in ["", "bad/name", "with space", "tab\t", "..", ".", "ünï", "a\\b", "a\nb"] {
            assert!(!is_valid_key(key), "{key:?} should be invalid");
        }
    }

    #[test]
    fn test_parse_and_path() {
        let key = ArchiveKey::parse("access.log").unwrap();
        assert_eq!(key.as_str(), "access.log");
        assert_eq!(key.path_in(Path::new("/srv/logs")), PathBuf::from("/srv/logs/access.log"));

        let err = ArchiveKey::parse("../etc/passwd").unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidKey(k) if k == "../etc/passwd"));
    }

    #[test]
    fn test_from_bytes_rejects_invalid_utf8() {
        assert!(ArchiveKey::from_bytes(b"ok.log").is_ok());
        assert!(ArchiveKey::from_bytes(&[0xff, 0xfe]).is_err());
    }
}
