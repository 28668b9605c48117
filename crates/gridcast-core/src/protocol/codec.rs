//! Wire codec for control-plane frames.
//!
//! Layout: `{magic u8}{type u8}{sender_id [u8;8]}` then a type-specific
//! body. Multi-byte integers are big-endian; floats travel as IEEE-754
//! bits. One frame per datagram; there is no streaming reassembly here.

use std::net::SocketAddrV4;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{
    DIGEST_HEX_LEN, FRAME_MAGIC, HEARTBEAT_NAME_MAX, MAX_FRAME_SIZE, NODE_ID_LEN,
};
use crate::error::{Error, Result};
use crate::identity::NodeId;

use super::{Announce, Envelope, FileChunk, FileOffer, Frame, FrameType, GridKind, Heartbeat, PointEdit};

/// Length of the fixed frame header.
pub const HEADER_LEN: usize = 2 + NODE_ID_LEN;

fn codec_err(message: impl Into<String>) -> Error {
    Error::Codec {
        message: message.into(),
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode a frame stamped with `sender` into one datagram payload.
pub fn encode(sender: NodeId, frame: &Frame) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
    buf.put_u8(FRAME_MAGIC);
    buf.put_u8(frame.frame_type() as u8);
    buf.put_slice(sender.as_bytes());

    match frame {
        Frame::Heartbeat(hb) => {
            let name = truncate_name(&hb.filename);
            buf.put_u8(hb.is_master as u8);
            buf.put_u16(hb.sync_port);
            buf.put_u8(hb.is_syncing as u8);
            buf.put_f32(hb.progress);
            buf.put_u8(name.len() as u8);
            buf.put_slice(name.as_bytes());
        }
        Frame::Announce(a) | Frame::AnnounceReply(a) => {
            let text = a.endpoint.to_string();
            if text.len() > u8::MAX as usize {
                return Err(codec_err("endpoint string too long"));
            }
            buf.put_u8(text.len() as u8);
            buf.put_slice(text.as_bytes());
        }
        Frame::PointEdit(pe) => {
            buf.put_slice(pe.owner.as_bytes());
            buf.put_u8(pe.surface_index);
            buf.put_u8(pe.grid as u8);
            buf.put_u16(pe.point_index);
            buf.put_f32(pe.x);
            buf.put_f32(pe.y);
        }
        Frame::StructureSnapshot(json) => {
            buf.put_slice(json);
        }
        Frame::FileOffer(offer) => {
            if offer.digest.len() != DIGEST_HEX_LEN {
                return Err(codec_err("file offer digest must be 32 hex chars"));
            }
            if offer.name.len() > u16::MAX as usize {
                return Err(codec_err("file offer name too long"));
            }
            buf.put_u32(offer.total_size);
            buf.put_u16(offer.name.len() as u16);
            buf.put_slice(offer.digest.as_bytes());
            buf.put_slice(offer.name.as_bytes());
        }
        Frame::FileChunk(chunk) => {
            if chunk.data.len() > u16::MAX as usize {
                return Err(codec_err("file chunk too large"));
            }
            buf.put_u32(chunk.offset);
            buf.put_u16(chunk.data.len() as u16);
            buf.put_slice(&chunk.data);
        }
        Frame::FileEnd | Frame::ScriptReload => {}
        Frame::ScriptCall(json) => {
            if json.len() > u16::MAX as usize {
                return Err(codec_err("script call payload too large"));
            }
            buf.put_u16(json.len() as u16);
            buf.put_slice(json);
        }
    }

    if buf.len() > MAX_FRAME_SIZE {
        return Err(codec_err(format!(
            "frame of {} bytes exceeds maximum {}",
            buf.len(),
            MAX_FRAME_SIZE
        )));
    }
    Ok(buf.freeze())
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode one datagram into an envelope.
pub fn decode(datagram: &[u8]) -> Result<Envelope> {
    if datagram.len() > MAX_FRAME_SIZE {
        return Err(codec_err("datagram exceeds maximum frame size"));
    }
    let mut buf = datagram;
    if buf.remaining() < HEADER_LEN {
        return Err(codec_err("datagram shorter than frame header"));
    }
    let magic = buf.get_u8();
    if magic != FRAME_MAGIC {
        return Err(codec_err(format!("bad magic byte 0x{magic:02X}")));
    }
    let type_byte = buf.get_u8();
    let frame_type = FrameType::from_wire(type_byte)
        .ok_or_else(|| codec_err(format!("unknown frame type {type_byte}")))?;

    let mut sender_bytes = [0u8; NODE_ID_LEN];
    buf.copy_to_slice(&mut sender_bytes);
    let sender = NodeId::from_bytes(sender_bytes)
        .map_err(|_| codec_err("sender id is not 8 base62 chars"))?;

    let frame = match frame_type {
        FrameType::Heartbeat => {
            need(buf, 1 + 2 + 1 + 4 + 1)?;
            let is_master = buf.get_u8() != 0;
            let sync_port = buf.get_u16();
            let is_syncing = buf.get_u8() != 0;
            let progress = buf.get_f32();
            let name_len = buf.get_u8() as usize;
            need(buf, name_len)?;
            let filename = take_string(&mut buf, name_len)?;
            Frame::Heartbeat(Heartbeat {
                is_master,
                sync_port,
                is_syncing,
                progress,
                filename,
            })
        }
        FrameType::Announce | FrameType::AnnounceReply => {
            need(buf, 1)?;
            let len = buf.get_u8() as usize;
            need(buf, len)?;
            let text = take_string(&mut buf, len)?;
            let endpoint: SocketAddrV4 = text
                .parse()
                .map_err(|_| codec_err(format!("bad announce endpoint {text:?}")))?;
            let announce = Announce { endpoint };
            match frame_type {
                FrameType::Announce => Frame::Announce(announce),
                _ => Frame::AnnounceReply(announce),
            }
        }
        FrameType::PointEdit => {
            need(buf, NODE_ID_LEN + 1 + 1 + 2 + 4 + 4)?;
            let mut owner_bytes = [0u8; NODE_ID_LEN];
            buf.copy_to_slice(&mut owner_bytes);
            let owner = NodeId::from_bytes(owner_bytes)
                .map_err(|_| codec_err("point edit owner is not 8 base62 chars"))?;
            let surface_index = buf.get_u8();
            let grid_byte = buf.get_u8();
            let grid = GridKind::from_wire(grid_byte)
                .ok_or_else(|| codec_err(format!("unknown grid kind {grid_byte}")))?;
            let point_index = buf.get_u16();
            let x = buf.get_f32();
            let y = buf.get_f32();
            Frame::PointEdit(PointEdit {
                owner,
                surface_index,
                grid,
                point_index,
                x,
                y,
            })
        }
        FrameType::StructureSnapshot => Frame::StructureSnapshot(Bytes::copy_from_slice(buf)),
        FrameType::FileOffer => {
            need(buf, 4 + 2 + DIGEST_HEX_LEN)?;
            let total_size = buf.get_u32();
            let name_len = buf.get_u16() as usize;
            let digest = take_string(&mut buf, DIGEST_HEX_LEN)?;
            need(buf, name_len)?;
            let name = take_string(&mut buf, name_len)?;
            Frame::FileOffer(FileOffer {
                total_size,
                digest,
                name,
            })
        }
        FrameType::FileChunk => {
            need(buf, 4 + 2)?;
            let offset = buf.get_u32();
            let size = buf.get_u16() as usize;
            need(buf, size)?;
            let data = Bytes::copy_from_slice(&buf[..size]);
            Frame::FileChunk(FileChunk { offset, data })
        }
        FrameType::FileEnd => Frame::FileEnd,
        FrameType::ScriptReload => Frame::ScriptReload,
        FrameType::ScriptCall => {
            need(buf, 2)?;
            let len = buf.get_u16() as usize;
            need(buf, len)?;
            Frame::ScriptCall(Bytes::copy_from_slice(&buf[..len]))
        }
    };

    Ok(Envelope { sender, frame })
}

fn need(buf: &[u8], len: usize) -> Result<()> {
    if buf.remaining() < len {
        Err(codec_err("truncated frame body"))
    } else {
        Ok(())
    }
}

fn take_string(buf: &mut &[u8], len: usize) -> Result<String> {
    let bytes = &buf[..len];
    let text = std::str::from_utf8(bytes)
        .map_err(|_| codec_err("string field is not UTF-8"))?
        .to_string();
    buf.advance(len);
    Ok(text)
}

fn truncate_name(name: &str) -> &str {
    if name.len() <= HEARTBEAT_NAME_MAX {
        return name;
    }
    // Back off to a char boundary so the wire form stays valid UTF-8.
    let mut end = HEARTBEAT_NAME_MAX;
    while end > 0 && !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

// =============================================================================
// Tests
// =============================================================================
