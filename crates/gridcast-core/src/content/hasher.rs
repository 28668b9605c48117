//! Content-addressed file hashing with a process-wide cache.
//!
//! Digests are 128-bit XXH3 over the full file contents, rendered as
//! 32-char lowercase hex. Files are read in fixed-size chunks; a full file
//! is never held in memory for hashing.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use xxhash_rust::xxh3::Xxh3;

use crate::constants::IO_BUF_SIZE;
use crate::error::Result;

/// Shared handle to the digest cache. Cloning is cheap; all clones see the
/// same cache.
#[derive(Debug, Clone, Default)]
pub struct ContentHasher {
    cache: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The digest of the file at `path`, computed lazily and cached by
    /// absolute path. Returns `Err` when the file cannot be read (the
    /// caller keeps settling and retries).
    pub fn digest(&self, path: &Path) -> Result<String> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hex) = cache.get(path) {
                return Ok(hex.clone());
            }
        }

        // Hash outside the lock; concurrent misses may both compute, the
        // second insert is harmless.
        let hex = hash_file(path)?;

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(path.to_path_buf(), hex.clone());
        Ok(hex)
    }

    /// Drop the cached digest for `path`. Must be called after every
    /// successful write to or delete of the file.
    pub fn invalidate(&self, path: &Path) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(path);
    }

    #[cfg(test)]
    fn cached(&self, path: &Path) -> Option<String> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(path).cloned()
    }
}

/// Streaming XXH3-128 of a file, as 32 lowercase hex chars.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Xxh3::new();
    let mut buf = [0u8; IO_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:032x}", hasher.digest128()))
}

/// Digest of an in-memory buffer, for receive-side pre-checks.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Xxh3::new();
    hasher.update(data);
    format!("{:032x}", hasher.digest128())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DIGEST_HEX_LEN;
    use std::fs;

    #[test]
    fn digest_is_32_lowercase_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        fs::write(&path, b"hello").unwrap();

        let hex = hash_file(&path).unwrap();
        assert_eq!(hex.len(), DIGEST_HEX_LEN);
        assert!(hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn file_and_bytes_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let data = vec![7u8; IO_BUF_SIZE * 3 + 11]; // spans chunk boundaries
        fs::write(&path, &data).unwrap();

        assert_eq!(hash_file(&path).unwrap(), hash_bytes(&data));
    }

    #[test]
    fn cache_hit_and_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        fs::write(&path, b"one").unwrap();

        let hasher = ContentHasher::new();
        let first = hasher.digest(&path).unwrap();
        assert_eq!(hasher.cached(&path), Some(first.clone()));

        // A stale cache survives mutation until invalidated.
        fs::write(&path, b"two").unwrap();
        assert_eq!(hasher.digest(&path).unwrap(), first);

        hasher.invalidate(&path);
        let second = hasher.digest(&path).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn missing_file_is_an_error() {
        let hasher = ContentHasher::new();
        assert!(hasher.digest(Path::new("/nonexistent/nope.bin")).is_err());
    }

    #[test]
    fn clones_share_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        fs::write(&path, b"shared").unwrap();

        let a = ContentHasher::new();
        let b = a.clone();
        let hex = a.digest(&path).unwrap();
        assert_eq!(b.cached(&path), Some(hex));
    }
}
