//! Control-plane frame definitions.
//!
//! Every control datagram is one frame: a fixed header
//! `{magic, type, sender_id[8]}` followed by a type-specific body. The
//! sender field drives the single loopback defense: receivers drop any
//! frame stamped with their own node ID before further processing.

mod codec;

pub use codec::{decode, encode, HEADER_LEN};

use std::net::SocketAddrV4;

use bytes::Bytes;

use crate::identity::NodeId;

// =============================================================================
// Frame Types
// =============================================================================

/// Wire IDs for every frame type. Fixed once chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Heartbeat = 1,
    Announce = 2,
    AnnounceReply = 3,
    PointEdit = 4,
    StructureSnapshot = 5,
    FileOffer = 6,
    FileChunk = 7,
    FileEnd = 8,
    ScriptReload = 9,
    ScriptCall = 10,
}

impl FrameType {
    pub fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            1 => FrameType::Heartbeat,
            2 => FrameType::Announce,
            3 => FrameType::AnnounceReply,
            4 => FrameType::PointEdit,
            5 => FrameType::StructureSnapshot,
            6 => FrameType::FileOffer,
            7 => FrameType::FileChunk,
            8 => FrameType::FileEnd,
            9 => FrameType::ScriptReload,
            10 => FrameType::ScriptCall,
            _ => return None,
        })
    }
}

// =============================================================================
// Bodies
// =============================================================================

/// Which control-point grid a point edit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GridKind {
    /// Texture-space grid (where the content is sampled).
    Source = 1,
    /// Screen-space grid (where the content lands).
    Output = 2,
}

impl GridKind {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(GridKind::Source),
            2 => Some(GridKind::Output),
            _ => None,
        }
    }
}

/// Periodic presence beacon, also carrying the sender's sync status.
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub is_master: bool,
    /// The sender's bulk-transport port (its sync endpoint).
    pub sync_port: u16,
    pub is_syncing: bool,
    /// Progress of the transfer named below, in `[0, 1]`.
    pub progress: f32,
    /// Relative path currently transferring, truncated for the wire.
    pub filename: String,
}

/// Startup handshake: tells receivers the sender's sync endpoint without
/// waiting a full heartbeat. Broadcast on start; answered unicast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announce {
    pub endpoint: SocketAddrV4,
}

/// One control-point move, authored by the master.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointEdit {
    /// The peer whose mapping document owns the surface.
    pub owner: NodeId,
    pub surface_index: u8,
    pub grid: GridKind,
    pub point_index: u16,
    /// Normalized coordinates in `[0, 1]`.
    pub x: f32,
    pub y: f32,
}

/// Offer of one pushed file: receivers compare the digest against their
/// local copy and silently ignore offers for content they already hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    pub total_size: u32,
    /// 32-char lowercase hex digest of the full file.
    pub digest: String,
    /// Relative path under the shared root.
    pub name: String,
}

/// One slice of a pushed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub offset: u32,
    pub data: Bytes,
}

/// A decoded control frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Heartbeat(Heartbeat),
    Announce(Announce),
    AnnounceReply(Announce),
    PointEdit(PointEdit),
    /// Full mapping document as JSON, superseding any lost deltas.
    StructureSnapshot(Bytes),
    FileOffer(FileOffer),
    FileChunk(FileChunk),
    FileEnd,
    ScriptReload,
    /// Opaque JSON payload forwarded to the embedding application.
    ScriptCall(Bytes),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Heartbeat(_) => FrameType::Heartbeat,
            Frame::Announce(_) => FrameType::Announce,
            Frame::AnnounceReply(_) => FrameType::AnnounceReply,
            Frame::PointEdit(_) => FrameType::PointEdit,
            Frame::StructureSnapshot(_) => FrameType::StructureSnapshot,
            Frame::FileOffer(_) => FrameType::FileOffer,
            Frame::FileChunk(_) => FrameType::FileChunk,
            Frame::FileEnd => FrameType::FileEnd,
            Frame::ScriptReload => FrameType::ScriptReload,
            Frame::ScriptCall(_) => FrameType::ScriptCall,
        }
    }
}

/// A frame together with the sender that stamped it.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender: NodeId,
    pub frame: Frame,
}
