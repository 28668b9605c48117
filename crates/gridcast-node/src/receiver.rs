//! Receive side of control-plane file pushes.
//!
//! A FILE_OFFER opens an assembly buffer (unless the local copy already
//! matches the offered digest), FILE_CHUNK frames fill it by offset, and
//! FILE_END commits it through a `.tmp` staging file renamed over the
//! target. The staging suffix keeps the watcher from emitting the partial
//! write, and the digest pre-check makes replayed pushes no-ops.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use gridcast_core::content::hasher::hash_bytes;
use gridcast_core::content::ContentHasher;
use gridcast_core::error::Result;
use gridcast_core::protocol::{FileChunk, FileOffer};
use gridcast_core::transfer::resolve_within;

struct IncomingFile {
    rel: String,
    abs: PathBuf,
    digest: String,
    total_size: u32,
    buf: Vec<u8>,
}

/// Assembles pushed files under the shared root. At most one file is in
/// flight at a time (offers supersede each other, matching the one-stream
/// broadcast they arrive on).
pub struct PushReceiver {
    root: PathBuf,
    hasher: ContentHasher,
    current: Option<IncomingFile>,
}

impl PushReceiver {
    pub fn new(root: PathBuf, hasher: ContentHasher) -> Self {
        Self {
            root,
            hasher,
            current: None,
        }
    }

    /// Handle an offer: silently dropped when the local file already has
    /// the offered digest, otherwise opens the assembly buffer.
    pub fn handle_offer(&mut self, offer: &FileOffer) {
        let abs = match resolve_within(&self.root, &offer.name) {
            Ok(abs) => abs,
            Err(err) => {
                warn!(name = %offer.name, %err, "rejecting pushed file path");
                return;
            }
        };

        if let Ok(local) = self.hasher.digest(&abs) {
            if local == offer.digest {
                debug!(name = %offer.name, "offer matches local content, ignoring");
                return;
            }
        }

        if let Some(dropped) = self.current.take() {
            warn!(name = %dropped.rel, "new offer supersedes incomplete transfer");
        }

        info!(name = %offer.name, size = offer.total_size, "receiving pushed file");
        self.current = Some(IncomingFile {
            rel: offer.name.clone(),
            abs,
            digest: offer.digest.clone(),
            total_size: offer.total_size,
            buf: vec![0u8; offer.total_size as usize],
        });
    }

    /// Store one chunk, iff it fits the announced size.
    pub fn handle_chunk(&mut self, chunk: &FileChunk) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        let offset = chunk.offset as usize;
        let end = offset.saturating_add(chunk.data.len());
        if end > current.total_size as usize {
            debug!(
                name = %current.rel,
                offset,
                len = chunk.data.len(),
                "chunk exceeds offered size, ignoring"
            );
            return;
        }
        current.buf[offset..end].copy_from_slice(&chunk.data);
    }

    /// Commit the assembled buffer: write `<name>.tmp`, rename over
    /// `<name>`, invalidate the digest cache. A write failure aborts this
    /// transfer and nothing else.
    pub fn handle_end(&mut self) -> Result<()> {
        let Some(current) = self.current.take() else {
            return Ok(());
        };

        let received = hash_bytes(&current.buf);
        if received != current.digest {
            warn!(
                name = %current.rel,
                "assembled digest mismatch (lost chunks), discarding"
            );
            return Ok(());
        }

        if let Some(parent) = current.abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staging = current.abs.with_extension(tmp_extension(&current.abs));
        std::fs::write(&staging, &current.buf)?;
        std::fs::rename(&staging, &current.abs)?;
        self.hasher.invalidate(&current.abs);
        info!(name = %current.rel, size = current.total_size, "pushed file committed");
        Ok(())
    }

    /// True while a transfer is being assembled.
    pub fn is_receiving(&self) -> bool {
        self.current.is_some()
    }
}

fn tmp_extension(path: &std::path::Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use gridcast_core::content::hasher::hash_file;

    fn offer_for(data: &[u8], name: &str) -> FileOffer {
        FileOffer {
            total_size: data.len() as u32,
            digest: hash_bytes(data),
            name: name.to_string(),
        }
    }

    fn push(receiver: &mut PushReceiver, data: &[u8], name: &str) {
        receiver.handle_offer(&offer_for(data, name));
        for (i, slice) in data.chunks(4).enumerate() {
            receiver.handle_chunk(&FileChunk {
                offset: (i * 4) as u32,
                data: Bytes::copy_from_slice(slice),
            });
        }
        receiver.handle_end().unwrap();
    }

    #[test]
    fn offer_chunks_end_commits_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = PushReceiver::new(dir.path().to_path_buf(), ContentHasher::new());

        push(&mut receiver, b"projection frames", "videos/foo.mp4");

        let written = std::fs::read(dir.path().join("videos/foo.mp4")).unwrap();
        assert_eq!(written, b"projection frames");
        assert!(!receiver.is_receiving());
        // No stray staging file survives.
        assert!(!dir.path().join("videos/foo.mp4.tmp").exists());
    }

    #[test]
    fn matching_digest_drops_the_offer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("videos")).unwrap();
        std::fs::write(dir.path().join("videos/foo.mp4"), b"same bytes").unwrap();

        let mut receiver = PushReceiver::new(dir.path().to_path_buf(), ContentHasher::new());
        receiver.handle_offer(&offer_for(b"same bytes", "videos/foo.mp4"));
        assert!(!receiver.is_receiving());
    }

    #[test]
    fn replayed_push_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let hasher = ContentHasher::new();
        let mut receiver = PushReceiver::new(dir.path().to_path_buf(), hasher.clone());

        push(&mut receiver, b"payload", "clip.bin");
        let digest_once = hash_file(&dir.path().join("clip.bin")).unwrap();

        // Replay: the offer is dropped on the pre-check, nothing re-opens.
        receiver.handle_offer(&offer_for(b"payload", "clip.bin"));
        assert!(!receiver.is_receiving());
        receiver.handle_end().unwrap();
        assert_eq!(hash_file(&dir.path().join("clip.bin")).unwrap(), digest_once);
    }

    #[test]
    fn out_of_bounds_chunks_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = PushReceiver::new(dir.path().to_path_buf(), ContentHasher::new());

        let data = b"12345678";
        receiver.handle_offer(&offer_for(data, "clip.bin"));
        receiver.handle_chunk(&FileChunk {
            offset: 4,
            data: Bytes::from_static(b"too long tail"),
        });
        receiver.handle_chunk(&FileChunk {
            offset: 0,
            data: Bytes::copy_from_slice(data),
        });
        receiver.handle_end().unwrap();

        assert_eq!(std::fs::read(dir.path().join("clip.bin")).unwrap(), data);
    }

    #[test]
    fn lost_chunks_discard_the_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = PushReceiver::new(dir.path().to_path_buf(), ContentHasher::new());

        receiver.handle_offer(&offer_for(b"full content here", "clip.bin"));
        // Only half arrives.
        receiver.handle_chunk(&FileChunk {
            offset: 0,
            data: Bytes::from_static(b"full con"),
        });
        receiver.handle_end().unwrap();

        assert!(!dir.path().join("clip.bin").exists());
    }

    #[test]
    fn escaping_offer_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = PushReceiver::new(dir.path().to_path_buf(), ContentHasher::new());
        receiver.handle_offer(&FileOffer {
            total_size: 4,
            digest: hash_bytes(b"evil"),
            name: "../evil.bin".into(),
        });
        assert!(!receiver.is_receiving());
    }

    #[test]
    fn end_without_offer_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = PushReceiver::new(dir.path().to_path_buf(), ContentHasher::new());
        receiver.handle_end().unwrap();
    }
}
