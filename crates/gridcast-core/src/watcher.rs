//! Debounced recursive filesystem watcher.
//!
//! A dedicated thread rescans the watched root on a fixed interval and
//! emits batches of relative paths whose contents have reached a stable
//! state different from the last confirmed one. Writers that touch a file
//! repeatedly (network receives, renders in progress) hold the path in a
//! settling window; the digest is only computed, and the change only
//! emitted, once the mtime has stopped moving for the settle time.
//!
//! Guarantees:
//! - a newly created file emits exactly one change when it first stabilizes
//! - rewrites that do not change the digest do not emit
//! - `.tmp` paths never emit (atomic-write staging)
//! - vanished files are forgotten silently

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::constants::{SCAN_INTERVAL, SETTLE_TIME};
use crate::content::{hasher::hash_file, normalize_rel_path};

// =============================================================================
// Configuration
// =============================================================================

/// Watcher timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    /// How often the root is rescanned.
    pub scan_interval: Duration,
    /// How long an mtime must hold still before a change is confirmed.
    pub settle_time: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            scan_interval: SCAN_INTERVAL,
            settle_time: SETTLE_TIME,
        }
    }
}

// =============================================================================
// Tracked State
// =============================================================================

#[derive(Debug)]
struct WatchEntry {
    confirmed_mtime: Option<SystemTime>,
    confirmed_digest: String,
    candidate_mtime: SystemTime,
    settling_started_at: Instant,
    is_settling: bool,
}

// =============================================================================
// Watcher
// =============================================================================

/// Handle to a running watcher thread.
///
/// Change batches arrive on [`FolderWatcher::recv`]; dropping the handle
/// without calling [`FolderWatcher::stop`] detaches the thread, which will
/// exit on its next tick once the stop flag is set by `Drop`.
pub struct FolderWatcher {
    rx: mpsc::UnboundedReceiver<Vec<String>>,
    entries: Arc<Mutex<HashMap<String, WatchEntry>>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FolderWatcher {
    /// Start watching `root` with the given knobs.
    pub fn spawn(root: PathBuf, config: WatcherConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let entries: Arc<Mutex<HashMap<String, WatchEntry>>> = Arc::default();
        let stop = Arc::new(AtomicBool::new(false));

        let thread_entries = entries.clone();
        let thread_stop = stop.clone();
        let thread =
            std::thread::spawn(move || scan_loop(root, config, thread_entries, thread_stop, tx));

        Self {
            rx,
            entries,
            stop,
            thread: Some(thread),
        }
    }

    /// Await the next batch of changed relative paths. `None` after stop.
    pub async fn recv(&mut self) -> Option<Vec<String>> {
        self.rx.recv().await
    }

    /// Non-blocking poll for a pending batch.
    pub fn try_recv(&mut self) -> Option<Vec<String>> {
        self.rx.try_recv().ok()
    }

    /// Sorted snapshot of every currently tracked relative path.
    pub fn all_items(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut items: Vec<String> = entries.keys().cloned().collect();
        items.sort();
        items
    }

    /// Stop the scan thread and join it. Quiesces within one scan interval.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FolderWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Scan Loop
// =============================================================================

fn scan_loop(
    root: PathBuf,
    config: WatcherConfig,
    entries: Arc<Mutex<HashMap<String, WatchEntry>>>,
    stop: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Vec<String>>,
) {
    while !stop.load(Ordering::SeqCst) {
        let started = Instant::now();
        let changes = scan_once(&root, config.settle_time, &entries);
        if !changes.is_empty() {
            debug!(count = changes.len(), "watcher confirmed changes");
            if tx.send(changes).is_err() {
                // Receiver gone; nothing left to feed.
                return;
            }
        }

        // Sleep the remainder of the interval in small slices so the stop
        // flag is observed promptly.
        let budget = config.scan_interval.saturating_sub(started.elapsed());
        let deadline = Instant::now() + budget.max(Duration::from_millis(10));
        while Instant::now() < deadline {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

fn scan_once(
    root: &Path,
    settle_time: Duration,
    entries: &Mutex<HashMap<String, WatchEntry>>,
) -> Vec<String> {
    let mut changes = Vec::new();
    let now = Instant::now();

    let mut seen: Vec<String> = Vec::new();
    let mut found: Vec<(String, PathBuf, SystemTime)> = Vec::new();
    collect_files(root, root, &mut found);

    let mut entries = entries.lock().unwrap_or_else(|e| e.into_inner());

    for (rel, abs, mtime) in found {
        seen.push(rel.clone());

        let entry = entries.entry(rel.clone()).or_insert_with(|| {
            trace!(path = %rel, "watcher tracking new file");
            WatchEntry {
                confirmed_mtime: None,
                confirmed_digest: String::new(),
                candidate_mtime: mtime,
                settling_started_at: now,
                is_settling: true,
            }
        });

        if entry.confirmed_mtime == Some(mtime) {
            // Back at the confirmed state.
            entry.is_settling = false;
            continue;
        }

        if !entry.is_settling {
            entry.is_settling = true;
            entry.candidate_mtime = mtime;
            entry.settling_started_at = now;
            continue;
        }

        if mtime != entry.candidate_mtime {
            // Still being written; restart the window.
            entry.candidate_mtime = mtime;
            entry.settling_started_at = now;
            continue;
        }

        if now.duration_since(entry.settling_started_at) >= settle_time {
            match hash_file(&abs) {
                Ok(digest) => {
                    if digest != entry.confirmed_digest {
                        changes.push(rel.clone());
                        entry.confirmed_digest = digest;
                    }
                    entry.confirmed_mtime = Some(mtime);
                    entry.is_settling = false;
                }
                // Not readable yet: keep settling, try again next scan.
                Err(err) => trace!(path = %rel, %err, "watcher digest deferred"),
            }
        }
    }

    // Vanished files are dropped without emission.
    entries.retain(|rel, _| seen.contains(rel));

    changes
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf, SystemTime)>) {
    let Ok(read) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in read.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            collect_files(root, &path, out);
            continue;
        }
        if !meta.is_file() {
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel = normalize_rel_path(&rel.to_string_lossy());
        if rel.ends_with(".tmp") {
            continue;
        }
        let Ok(mtime) = meta.modified() else { continue };
        out.push((rel, path, mtime));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            scan_interval: Duration::from_millis(30),
            settle_time: Duration::from_millis(60),
        }
    }

    async fn collect_batches(watcher: &mut FolderWatcher, window: Duration) -> Vec<Vec<String>> {
        let mut batches = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, watcher.recv()).await {
                Ok(Some(batch)) => batches.push(batch),
                _ => break,
            }
        }
        batches
    }

    #[tokio::test]
    async fn new_file_emits_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("clip.mp4"), b"frames").unwrap();

        let mut watcher = FolderWatcher::spawn(dir.path().to_path_buf(), fast_config());
        let batches = collect_batches(&mut watcher, Duration::from_millis(600)).await;
        watcher.stop();

        let total: usize = batches
            .iter()
            .map(|b| b.iter().filter(|p| *p == "clip.mp4").count())
            .sum();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn repeated_writes_debounce_to_one_emission() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        fs::write(&path, b"v0").unwrap();

        let mut watcher = FolderWatcher::spawn(dir.path().to_path_buf(), fast_config());

        // Three writes inside the settle window.
        for i in 0..3u8 {
            fs::write(&path, format!("rev-{i}")).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let batches = collect_batches(&mut watcher, Duration::from_millis(800)).await;
        watcher.stop();

        let total: usize = batches
            .iter()
            .map(|b| b.iter().filter(|p| *p == "clip.mp4").count())
            .sum();
        assert_eq!(total, 1, "debounce collapsed the writes: {batches:?}");
    }

    #[tokio::test]
    async fn tmp_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("stage.tmp"), b"partial").unwrap();

        let mut watcher = FolderWatcher::spawn(dir.path().to_path_buf(), fast_config());
        let batches = collect_batches(&mut watcher, Duration::from_millis(300)).await;

        assert!(batches.iter().flatten().all(|p| p != "stage.tmp"));
        assert!(watcher.all_items().is_empty());
        watcher.stop();
    }

    #[tokio::test]
    async fn deleted_files_vanish_silently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.mp4");
        fs::write(&path, b"data").unwrap();

        let mut watcher = FolderWatcher::spawn(dir.path().to_path_buf(), fast_config());
        // Let it confirm once, then delete.
        let _ = collect_batches(&mut watcher, Duration::from_millis(300)).await;
        fs::remove_file(&path).unwrap();
        let after = collect_batches(&mut watcher, Duration::from_millis(300)).await;
        watcher.stop();

        assert!(after.iter().flatten().all(|p| p != "gone.mp4"));
        assert!(watcher.all_items().is_empty());
    }

    #[tokio::test]
    async fn subdirectories_use_forward_slashes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("videos/sub")).unwrap();
        fs::write(dir.path().join("videos/sub/a.mp4"), b"x").unwrap();

        let mut watcher = FolderWatcher::spawn(dir.path().to_path_buf(), fast_config());
        let batches = collect_batches(&mut watcher, Duration::from_millis(600)).await;
        watcher.stop();

        assert!(batches.iter().flatten().any(|p| p == "videos/sub/a.mp4"));
    }

    #[test]
    fn stop_joins_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = FolderWatcher::spawn(dir.path().to_path_buf(), fast_config());
        let started = Instant::now();
        watcher.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
