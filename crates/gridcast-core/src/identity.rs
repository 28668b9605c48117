//! Node identity: short fixed-length IDs and their on-disk persistence.
//!
//! Every node carries an 8-character base62 ID, generated once and stored
//! in `settings.json` so it survives restarts on the same machine. The ID
//! doubles as the 8-byte sender field of every control frame.

use std::cell::Cell;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::constants::NODE_ID_LEN;
use crate::error::{Error, Result};

const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

thread_local! {
    static COUNTER: Cell<u16> = const { Cell::new(0) };
}

// =============================================================================
// NodeId
// =============================================================================

/// Stable 8-character node identifier, unique by convention on a segment.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Generate a fresh ID from a millisecond timestamp, a thread-local
    /// counter, and PRNG-seeded entropy folded into base62.
    pub fn generate() -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            & 0xFFFF_FFFF_FFFF; // 48 bits of time

        let cnt = COUNTER.with(|c| {
            let v = c.get();
            c.set(v.wrapping_add(1));
            v
        });

        let mut rnd = rand::thread_rng().next_u64();
        rnd ^= rnd << 13;
        rnd ^= rnd >> 7;
        rnd ^= rnd << 17;

        // 48-bit time + 16-bit counter + 64-bit random = 128 bits, folded
        // pairwise into 8 base62 characters with a running carry so every
        // character depends on all the entropy before it.
        let hi = (ts << 16) | cnt as u64;
        let lo = rnd;
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&hi.to_be_bytes());
        raw[8..].copy_from_slice(&lo.to_be_bytes());

        let mut out = [0u8; NODE_ID_LEN];
        let mut carry = 0u64;
        for (i, slot) in out.iter_mut().enumerate() {
            let folded = raw[i] as u64 ^ ((raw[i + 8] as u64) << 3);
            let idx = (folded + carry) % 62;
            carry = idx;
            *slot = BASE62[idx as usize];
        }

        NodeId(out)
    }

    /// The fixed 8-byte wire form of this ID.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Parse the wire form. Rejects anything outside `[0-9A-Za-z]`.
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Result<Self> {
        if bytes.iter().all(|b| b.is_ascii_alphanumeric()) {
            Ok(NodeId(bytes))
        } else {
            Err(Error::InvalidNodeId(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        }
    }

    pub fn as_str(&self) -> &str {
        // Validated as ASCII alphanumeric on construction.
        std::str::from_utf8(&self.0).unwrap_or("????????")
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != NODE_ID_LEN {
            return Err(Error::InvalidNodeId(s.to_string()));
        }
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes.copy_from_slice(s.as_bytes());
        Self::from_bytes(bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.as_str())
    }
}

// =============================================================================
// Settings
// =============================================================================

/// The local settings document, persisted next to the project root.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(rename = "ID", default)]
    pub id: String,
}

impl Settings {
    /// Load the settings document, generating and persisting a fresh node ID
    /// when the file is absent or its ID is not a valid 8-character base62
    /// string. The returned ID is stable across restarts.
    pub fn load_or_create(path: &Path) -> Result<(Settings, NodeId)> {
        let mut settings = match fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => Settings::default(),
        };

        match NodeId::from_str(&settings.id) {
            Ok(id) => Ok((settings, id)),
            Err(_) => {
                let id = NodeId::generate();
                settings.id = id.to_string();
                settings.save(path)?;
                info!(id = %id, "generated new node id");
                Ok((settings, id))
            }
        }
    }

    /// Write the settings document back to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid() {
        for _ in 0..100 {
            let id = NodeId::generate();
            assert_eq!(id.as_str().len(), NODE_ID_LEN);
            assert!(id.as_str().bytes().all(|b| b.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn generated_ids_differ() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn parse_roundtrip() {
        let id: NodeId = "AAAAAAAA".parse().unwrap();
        assert_eq!(id.to_string(), "AAAAAAAA");
        assert_eq!(id.as_bytes(), b"AAAAAAAA");
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!("short".parse::<NodeId>().is_err());
        assert!("toolongtoolong".parse::<NodeId>().is_err());
        assert!("with spc".parse::<NodeId>().is_err());
        assert!("dash-one".parse::<NodeId>().is_err());
    }

    #[test]
    fn settings_persist_id_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let (_, first) = Settings::load_or_create(&path).unwrap();
        let (_, second) = Settings::load_or_create(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn settings_regenerate_malformed_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"ID": "nope"}"#).unwrap();

        let (settings, id) = Settings::load_or_create(&path).unwrap();
        assert_eq!(settings.id, id.to_string());
        assert_eq!(id.as_str().len(), NODE_ID_LEN);

        // Regenerated ID was written back.
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains(id.as_str()));
    }
}
