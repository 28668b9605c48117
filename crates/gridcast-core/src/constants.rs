//! Protocol and configuration constants for gridcast.

use std::time::Duration;

// =============================================================================
// Identity Constants
// =============================================================================

/// Length of a node ID in bytes (base62 characters).
pub const NODE_ID_LEN: usize = 8;

/// Length of a content digest in lowercase hex characters.
pub const DIGEST_HEX_LEN: usize = 32;

// =============================================================================
// Control-Plane Constants
// =============================================================================

/// Well-known UDP port for presence and control frames.
pub const PRESENCE_PORT: u16 = 11999;

/// First byte of every control frame.
pub const FRAME_MAGIC: u8 = 0xAA;

/// Maximum accepted control datagram, header included (32 KiB).
pub const MAX_FRAME_SIZE: usize = 32 * 1024;

/// Payload bytes carried by one FILE_CHUNK frame.
pub const FILE_CHUNK_SIZE: usize = 1024;

/// Maximum sync filename bytes carried in a heartbeat.
pub const HEARTBEAT_NAME_MAX: usize = 63;

// =============================================================================
// Timing Constants
// =============================================================================

/// Interval between heartbeat broadcasts.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// A peer not heard from for this long is evicted.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// Default watcher rescan interval.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Default watcher settle window before a changed file is confirmed.
pub const SETTLE_TIME: Duration = Duration::from_millis(250);

/// Sync dispatcher wakes at least this often even without work.
pub const SYNC_TICK: Duration = Duration::from_secs(1);

/// Server-side session handler idles out after this long without a command.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// A cached session must answer a liveness probe within this window.
pub const PING_TIMEOUT: Duration = Duration::from_millis(200);

/// Pause between FILE_CHUNK datagrams to bound burst loss.
pub const FILE_CHUNK_PACE: Duration = Duration::from_millis(2);

/// Gap between a FILE_OFFER and its first chunk.
pub const FILE_OFFER_LEAD: Duration = Duration::from_millis(100);

/// Service tasks must join within this bound at shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Sync Engine Constants
// =============================================================================

/// Maximum convergence passes against one peer in a single cycle.
pub const MAX_SYNC_PASSES: u32 = 5;

/// Retries when a peer returns an empty listing while the local root is not.
pub const LIST_RETRIES: u32 = 3;

// =============================================================================
// Bulk Transport Constants
// =============================================================================

/// Buffer size for streamed file IO and hashing.
pub const IO_BUF_SIZE: usize = 8192;

/// Progress events are emitted about this often (bytes).
pub const PROGRESS_INTERVAL: u64 = 64 * 1024;

/// Largest accepted command argument (a relative path).
pub const MAX_ARG_LEN: usize = 4096;

/// Largest accepted LIST payload (16 MiB).
pub const MAX_LIST_SIZE: u64 = 16 * 1024 * 1024;
