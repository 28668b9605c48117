//! Bulk-transport server: serves the shared root to peer sync engines.
//!
//! Listens on an OS-assigned ephemeral port (the node's advertised sync
//! port). Each accepted connection is one session: a command loop that
//! idles out after ten seconds without a request. Commands and framing
//! live in `gridcast_core::transfer`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gridcast_core::constants::{IO_BUF_SIZE, PROGRESS_INTERVAL, SESSION_IDLE_TIMEOUT};
use gridcast_core::content::{encode_listing, normalize_rel_path, ContentEntry, ContentHasher, ContentSet};
use gridcast_core::error::{Error, Result};
use gridcast_core::transfer::{
    read_command, resolve_within, write_err, write_ok, write_ok_sized, CMD_DELETE,
    CMD_GET, CMD_LIST, CMD_PING, CMD_PUT,
};

// =============================================================================
// Progress Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Upload,
    Download,
    Delete,
}

/// Progress of one server-side transfer, emitted about every 64 KiB.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub kind: TransferKind,
    pub rel: String,
    pub bytes: u64,
    pub total: u64,
}

type ProgressSender = Option<mpsc::UnboundedSender<TransferProgress>>;

fn emit(progress: &ProgressSender, kind: TransferKind, rel: &str, bytes: u64, total: u64) {
    if let Some(tx) = progress {
        let _ = tx.send(TransferProgress {
            kind,
            rel: rel.to_string(),
            bytes,
            total,
        });
    }
}

// =============================================================================
// Server
// =============================================================================

/// Handle to the running bulk server.
pub struct BulkServer {
    port: u16,
    handle: JoinHandle<()>,
}

impl BulkServer {
    /// Bind an ephemeral port on all interfaces and start accepting.
    pub async fn spawn(
        root: PathBuf,
        hasher: ContentHasher,
        progress: ProgressSender,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();
        info!(port, root = %root.display(), "bulk server listening");

        let handle = tokio::spawn(accept_loop(listener, root, hasher, progress, shutdown));
        Ok(Self { port, handle })
    }

    /// The advertised sync port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the accept loop to wind down after shutdown is signalled.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    root: PathBuf,
    hasher: ContentHasher,
    progress: ProgressSender,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                };
                debug!(%peer, "session opened");
                tokio::spawn(handle_session(
                    stream,
                    peer,
                    root.clone(),
                    hasher.clone(),
                    progress.clone(),
                ));
            }
        }
    }
}

// =============================================================================
// Session Handler
// =============================================================================

async fn handle_session(
    stream: TcpStream,
    peer: SocketAddr,
    root: PathBuf,
    hasher: ContentHasher,
    progress: ProgressSender,
) {
    let mut stream = BufStream::new(stream);
    loop {
        let command = match tokio::time::timeout(SESSION_IDLE_TIMEOUT, read_command(&mut stream)).await {
            Err(_) => {
                debug!(%peer, "session idle timeout");
                return;
            }
            Ok(Err(err)) => {
                debug!(%peer, %err, "session read failed");
                return;
            }
            Ok(Ok(None)) => {
                debug!(%peer, "session closed by peer");
                return;
            }
            Ok(Ok(Some(command))) => command,
        };

        let outcome = match command {
            (CMD_PING, _) => write_ok(&mut stream).await,
            (CMD_LIST, _) => serve_list(&mut stream, &root, &hasher).await,
            (CMD_GET, rel) => serve_get(&mut stream, &root, &rel, &progress).await,
            (CMD_PUT, rel) => serve_put(&mut stream, &root, &rel, &hasher, &progress).await,
            (CMD_DELETE, rel) => serve_delete(&mut stream, &root, &rel, &hasher, &progress).await,
            (cmd, _) => {
                warn!(%peer, cmd, "unknown command, closing session");
                return;
            }
        };

        if let Err(err) = outcome {
            debug!(%peer, %err, "session command failed");
            return;
        }
    }
}

async fn serve_list(
    stream: &mut BufStream<TcpStream>,
    root: &Path,
    hasher: &ContentHasher,
) -> Result<()> {
    let root = root.to_path_buf();
    let hasher = hasher.clone();
    let listing = tokio::task::spawn_blocking(move || build_listing(&root, &hasher))
        .await
        .map_err(|e| Error::Transfer {
            message: format!("listing task failed: {e}"),
        })?;

    write_ok_sized(stream, listing.len() as u64).await?;
    stream.write_all(listing.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Walk the shared root and render its content set as listing lines.
/// Unreadable files are skipped; they will appear once they settle.
fn build_listing(root: &Path, hasher: &ContentHasher) -> String {
    let mut set = ContentSet::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                stack.push(path);
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
            let Ok(digest) = hasher.digest(&path) else {
                continue;
            };
            set.insert(
                rel,
                ContentEntry {
                    size: meta.len(),
                    digest,
                },
            );
        }
    }
    encode_listing(&set)
}

async fn serve_get(
    stream: &mut BufStream<TcpStream>,
    root: &Path,
    rel: &str,
    progress: &ProgressSender,
) -> Result<()> {
    let abs = match resolve_within(root, rel) {
        Ok(abs) => abs,
        Err(err) => {
            warn!(%rel, %err, "GET rejected");
            return write_err(stream, "Invalid path").await;
        }
    };
    let mut file = match File::open(&abs).await {
        Ok(file) => file,
        Err(_) => return write_err(stream, "File not found").await,
    };
    let total = file.metadata().await?.len();
    write_ok_sized(stream, total).await?;

    let mut buf = vec![0u8; IO_BUF_SIZE];
    let mut sent: u64 = 0;
    let mut last_report: u64 = 0;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
        sent += n as u64;
        if sent - last_report >= PROGRESS_INTERVAL || sent == total {
            emit(progress, TransferKind::Download, rel, sent, total);
            last_report = sent;
        }
    }
    stream.flush().await?;
    Ok(())
}

async fn serve_put(
    stream: &mut BufStream<TcpStream>,
    root: &Path,
    rel: &str,
    hasher: &ContentHasher,
    progress: &ProgressSender,
) -> Result<()> {
    let total = stream.read_u64().await?;

    let abs = match resolve_within(root, rel) {
        Ok(abs) => abs,
        Err(err) => {
            warn!(%rel, %err, "PUT rejected");
            return write_err(stream, "Invalid path").await;
        }
    };
    if let Some(parent) = abs.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Stage next to the target so the rename stays on one filesystem and
    // the watcher's `.tmp` rule hides the partial write.
    let staging = staging_path(&abs);
    let mut file = match File::create(&staging).await {
        Ok(file) => file,
        Err(err) => {
            warn!(%rel, %err, "PUT cannot create staging file");
            return write_err(stream, "Cannot create file").await;
        }
    };
    write_ok(stream).await?;

    let mut buf = vec![0u8; IO_BUF_SIZE];
    let mut received: u64 = 0;
    let mut last_report: u64 = 0;
    let mut disk_failed = false;
    while received < total {
        let want = ((total - received) as usize).min(buf.len());
        stream.read_exact(&mut buf[..want]).await?;
        if !disk_failed {
            if let Err(err) = file.write_all(&buf[..want]).await {
                // Keep draining so the session stays framed; drop the file.
                warn!(%rel, %err, "PUT disk write failed, draining transfer");
                disk_failed = true;
            }
        }
        received += want as u64;
        if received - last_report >= PROGRESS_INTERVAL || received == total {
            emit(progress, TransferKind::Upload, rel, received, total);
            last_report = received;
        }
    }

    if disk_failed {
        drop(file);
        let _ = tokio::fs::remove_file(&staging).await;
        return Ok(());
    }

    file.flush().await?;
    drop(file);
    tokio::fs::rename(&staging, &abs).await?;
    hasher.invalidate(&abs);
    debug!(%rel, total, "PUT committed");
    Ok(())
}

async fn serve_delete(
    stream: &mut BufStream<TcpStream>,
    root: &Path,
    rel: &str,
    hasher: &ContentHasher,
    progress: &ProgressSender,
) -> Result<()> {
    let abs = match resolve_within(root, rel) {
        Ok(abs) => abs,
        Err(err) => {
            warn!(%rel, %err, "DELETE rejected");
            return write_err(stream, "Invalid path").await;
        }
    };
    if !abs.is_file() {
        return write_err(stream, "File not found").await;
    }
    match tokio::fs::remove_file(&abs).await {
        Ok(()) => {
            hasher.invalidate(&abs);
            write_ok(stream).await?;
            emit(progress, TransferKind::Delete, rel, 1, 1);
            debug!(%rel, "DELETE committed");
            Ok(())
        }
        Err(err) => {
            warn!(%rel, %err, "DELETE failed");
            write_err(stream, "Delete failed").await
        }
    }
}

fn staging_path(abs: &Path) -> PathBuf {
    match abs.extension().and_then(|e| e.to_str()) {
        Some(ext) => abs.with_extension(format!("{ext}.tmp")),
        None => abs.with_extension("tmp"),
    }
}
