//! Client sessions against peer bulk servers.
//!
//! Sessions are cached per peer endpoint and reused across convergence
//! cycles. Before reuse a cached session is probed with PING; a probe that
//! does not come back OK within the ping window discards the entry and a
//! fresh connection is made. Servers idle sessions out after ten seconds,
//! so probe failures are routine, not errors.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use gridcast_core::constants::{IO_BUF_SIZE, PING_TIMEOUT, PROGRESS_INTERVAL};
use gridcast_core::content::{decode_listing, ContentSet};
use gridcast_core::error::{Error, Result};
use gridcast_core::transfer::{
    read_sized_text, read_status, write_command, CMD_DELETE, CMD_GET, CMD_LIST, CMD_PING, CMD_PUT,
};

// =============================================================================
// Peer Session
// =============================================================================

/// One live session to a peer's bulk server.
pub struct PeerSession {
    stream: BufStream<TcpStream>,
    addr: SocketAddrV4,
}

impl PeerSession {
    /// Connect a fresh session.
    pub async fn connect(addr: SocketAddrV4) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: BufStream::new(stream),
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    /// Liveness probe. Must complete within [`PING_TIMEOUT`].
    pub async fn ping(&mut self) -> Result<()> {
        let probe = async {
            write_command(&mut self.stream, CMD_PING, "").await?;
            read_status(&mut self.stream).await
        };
        match tokio::time::timeout(PING_TIMEOUT, probe).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Fetch the peer's content set.
    pub async fn list(&mut self) -> Result<ContentSet> {
        write_command(&mut self.stream, CMD_LIST, "").await?;
        read_status(&mut self.stream).await?;
        let text = read_sized_text(&mut self.stream).await?;
        Ok(decode_listing(&text))
    }

    /// Upload a local file to the peer under `rel`. `on_progress` receives
    /// `(bytes_sent, total)` about every 64 KiB.
    pub async fn upload(
        &mut self,
        local: &Path,
        rel: &str,
        mut on_progress: impl FnMut(u64, u64),
    ) -> Result<()> {
        let mut file = File::open(local).await?;
        let total = file.metadata().await?.len();

        write_command(&mut self.stream, CMD_PUT, rel).await?;
        self.stream.write_u64(total).await?;
        self.stream.flush().await?;
        read_status(&mut self.stream).await?;

        let mut buf = vec![0u8; IO_BUF_SIZE];
        let mut sent: u64 = 0;
        let mut last_report: u64 = 0;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.stream.write_all(&buf[..n]).await?;
            sent += n as u64;
            if sent - last_report >= PROGRESS_INTERVAL || sent == total {
                on_progress(sent, total);
                last_report = sent;
            }
        }
        self.stream.flush().await?;

        if sent != total {
            return Err(Error::Transfer {
                message: format!("{rel}: file shrank mid-upload ({sent} of {total} bytes)"),
            });
        }
        Ok(())
    }

    /// Download `rel` from the peer into `dest`, staged through `.tmp`.
    pub async fn download(&mut self, rel: &str, dest: &Path) -> Result<()> {
        write_command(&mut self.stream, CMD_GET, rel).await?;
        read_status(&mut self.stream).await?;
        let total = self.stream.read_u64().await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = dest.with_extension(match dest.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{ext}.tmp"),
            None => "tmp".to_string(),
        });
        let mut file = File::create(&staging).await?;

        let mut buf = vec![0u8; IO_BUF_SIZE];
        let mut received: u64 = 0;
        while received < total {
            let want = ((total - received) as usize).min(buf.len());
            self.stream.read_exact(&mut buf[..want]).await?;
            file.write_all(&buf[..want]).await?;
            received += want as u64;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&staging, dest).await?;
        Ok(())
    }

    /// Remove `rel` on the peer.
    pub async fn delete(&mut self, rel: &str) -> Result<()> {
        write_command(&mut self.stream, CMD_DELETE, rel).await?;
        read_status(&mut self.stream).await
    }
}

// =============================================================================
// Session Cache
// =============================================================================

/// Cached sessions keyed by `ip:port`. Owned by the sync dispatcher, so no
/// locking: at most one session per peer is ever active.
#[derive(Default)]
pub struct SessionCache {
    sessions: HashMap<String, PeerSession>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse the cached session for `key` when it still answers a PING,
    /// otherwise open a fresh one.
    pub async fn get(&mut self, key: &str, addr: SocketAddrV4) -> Result<&mut PeerSession> {
        if let Some(mut session) = self.sessions.remove(key) {
            match session.ping().await {
                Ok(()) => {
                    trace!(%key, "reusing cached session");
                    return Ok(self.sessions.entry(key.to_string()).or_insert(session));
                }
                Err(err) => debug!(%key, %err, "cached session stale, reconnecting"),
            }
        }
        let session = PeerSession::connect(addr).await?;
        Ok(self.sessions.entry(key.to_string()).or_insert(session))
    }

    /// Drop the cached session after a mid-operation failure.
    pub fn discard(&mut self, key: &str) {
        self.sessions.remove(key);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
