//! Shared test fixtures for gridcast crates.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use gridcast_core::content::hasher::hash_file;
use gridcast_core::NodeId;

/// A throwaway shared root with helpers for seeding content.
pub struct TestRoot {
    dir: TempDir,
}

impl Default for TestRoot {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRoot {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp root"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file under the root, creating parent directories.
    pub fn write(&self, rel: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parents");
        }
        std::fs::write(&path, contents).expect("write fixture file");
        path
    }

    pub fn remove(&self, rel: &str) {
        std::fs::remove_file(self.dir.path().join(rel)).expect("remove fixture file");
    }

    pub fn read(&self, rel: &str) -> Vec<u8> {
        std::fs::read(self.dir.path().join(rel)).expect("read fixture file")
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.dir.path().join(rel).exists()
    }

    /// Digest of a file under the root.
    pub fn digest(&self, rel: &str) -> String {
        hash_file(&self.dir.path().join(rel)).expect("hash fixture file")
    }

    /// Sorted relative paths of every regular file under the root.
    pub fn rel_files(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![self.dir.path().to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).expect("read fixture dir").flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.is_file() {
                    let rel = path
                        .strip_prefix(self.dir.path())
                        .expect("fixture under root")
                        .to_string_lossy()
                        .replace('\\', "/");
                    out.push(rel);
                }
            }
        }
        out.sort();
        out
    }
}

/// Fixed node IDs for tests.
pub fn node_a() -> NodeId {
    "AAAAAAAA".parse().expect("valid fixture id")
}

pub fn node_b() -> NodeId {
    "BBBBBBBB".parse().expect("valid fixture id")
}

/// Poll `check` every 20 ms until it returns true or `timeout` elapses.
pub async fn wait_until(timeout: std::time::Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    check()
}
