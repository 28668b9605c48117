//! Control-plane messenger: framed UDP datagrams over the presence port.
//!
//! One socket, bound to all interfaces with address reuse and broadcast
//! enabled, carries every control frame: heartbeats, announces, point
//! edits, structure snapshots, and pushed files. Every outbound frame is
//! stamped with the local node ID; every inbound frame stamped with it is
//! dropped before processing, the only defense against broadcast
//! loopback.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use gridcast_core::constants::{
    FILE_CHUNK_PACE, FILE_CHUNK_SIZE, FILE_OFFER_LEAD, MAX_FRAME_SIZE,
};
use gridcast_core::content::hasher::hash_file;
use gridcast_core::error::{Error, Result};
use gridcast_core::protocol::{self, Envelope, FileChunk, FileOffer, Frame};
use gridcast_core::NodeId;

/// A decoded foreign frame and where it came from.
pub type Inbound = (Envelope, SocketAddr);

/// Shared handle to the control-plane socket.
pub struct Messenger {
    socket: Arc<UdpSocket>,
    node_id: NodeId,
    broadcast_addr: SocketAddrV4,
}

impl Messenger {
    /// Bind the control socket on `port` across all interfaces.
    ///
    /// SO_REUSEADDR lets several nodes share the port on one machine (and
    /// survives restarts in TIME_WAIT); SO_BROADCAST lets the same socket
    /// send to the subnet broadcast address.
    pub fn bind(node_id: NodeId, broadcast_ip: Ipv4Addr, port: u16) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            socket: Arc::new(socket),
            node_id,
            broadcast_addr: SocketAddrV4::new(broadcast_ip, port),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Send one frame to the subnet broadcast address.
    pub async fn broadcast(&self, frame: &Frame) -> Result<()> {
        let datagram = protocol::encode(self.node_id, frame)?;
        self.socket
            .send_to(&datagram, SocketAddr::V4(self.broadcast_addr))
            .await?;
        Ok(())
    }

    /// Send one frame to a single peer.
    pub async fn send_to(&self, addr: SocketAddr, frame: &Frame) -> Result<()> {
        let datagram = protocol::encode(self.node_id, frame)?;
        self.socket.send_to(&datagram, addr).await?;
        Ok(())
    }

    /// Spawn the receive loop. Decoded foreign frames are forwarded on
    /// `tx`; frames stamped with the local node ID and malformed datagrams
    /// are dropped here.
    pub fn spawn_recv_loop(
        &self,
        tx: mpsc::UnboundedSender<Inbound>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let node_id = self.node_id;
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_FRAME_SIZE];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    received = socket.recv_from(&mut buf) => {
                        let (len, from) = match received {
                            Ok(pair) => pair,
                            Err(err) => {
                                warn!(%err, "control socket receive failed");
                                continue;
                            }
                        };
                        let envelope = match protocol::decode(&buf[..len]) {
                            Ok(envelope) => envelope,
                            Err(err) => {
                                debug!(%from, %err, "dropping malformed control frame");
                                continue;
                            }
                        };
                        if envelope.sender == node_id {
                            trace!("dropping loopback frame");
                            continue;
                        }
                        if tx.send((envelope, from)).is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Push one shared file to every peer: OFFER, paced CHUNKs, END.
    ///
    /// Receivers holding identical content drop the offer on the digest
    /// pre-check, so re-pushing an unchanged file is cheap and idempotent.
    pub async fn push_file(&self, abs: &Path, rel: &str) -> Result<()> {
        let digest = hash_file(abs)?;
        let data = tokio::fs::read(abs).await?;
        let total_size = u32::try_from(data.len()).map_err(|_| Error::Transfer {
            message: format!("{rel}: too large for a control-plane push"),
        })?;

        self.broadcast(&Frame::FileOffer(FileOffer {
            total_size,
            digest,
            name: rel.to_string(),
        }))
        .await?;
        tokio::time::sleep(FILE_OFFER_LEAD).await;

        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + FILE_CHUNK_SIZE).min(data.len());
            self.broadcast(&Frame::FileChunk(FileChunk {
                offset: offset as u32,
                data: Bytes::copy_from_slice(&data[offset..end]),
            }))
            .await?;
            offset = end;
            tokio::time::sleep(FILE_CHUNK_PACE).await;
        }

        self.broadcast(&Frame::FileEnd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridcast_core::protocol::Heartbeat;

    fn id(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    /// Two messengers talking over loopback unicast.
    #[tokio::test]
    async fn unicast_send_and_receive() {
        let a = Messenger::bind(id("AAAAAAAA"), Ipv4Addr::LOCALHOST, 0).unwrap();
        let b = Messenger::bind(id("BBBBBBBB"), Ipv4Addr::LOCALHOST, 0).unwrap();
        let b_addr = b.socket.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _loop = b.spawn_recv_loop(tx, shutdown_rx);

        let frame = Frame::Heartbeat(Heartbeat {
            is_master: true,
            sync_port: 7,
            is_syncing: false,
            progress: 0.0,
            filename: String::new(),
        });
        a.send_to(b_addr, &frame).await.unwrap();

        let (envelope, _) = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.sender, id("AAAAAAAA"));
        assert_eq!(envelope.frame, frame);
    }

    /// A frame stamped with the receiver's own ID never surfaces.
    #[tokio::test]
    async fn loopback_frames_are_suppressed() {
        let a = Messenger::bind(id("AAAAAAAA"), Ipv4Addr::LOCALHOST, 0).unwrap();
        let b = Messenger::bind(id("AAAAAAAA"), Ipv4Addr::LOCALHOST, 0).unwrap();
        let b_addr = b.socket.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _loop = b.spawn_recv_loop(tx, shutdown_rx);

        a.send_to(b_addr, &Frame::ScriptReload).await.unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_millis(300), rx.recv()).await;
        assert!(got.is_err(), "loopback frame must be dropped");
    }

    /// Malformed datagrams are skipped without killing the loop.
    #[tokio::test]
    async fn malformed_datagrams_are_skipped() {
        let b = Messenger::bind(id("BBBBBBBB"), Ipv4Addr::LOCALHOST, 0).unwrap();
        let b_addr = b.socket.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _loop = b.spawn_recv_loop(tx, shutdown_rx);

        let raw = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(b"garbage", b_addr).await.unwrap();

        let a = Messenger::bind(id("AAAAAAAA"), Ipv4Addr::LOCALHOST, 0).unwrap();
        a.send_to(b_addr, &Frame::ScriptReload).await.unwrap();

        let (envelope, _) = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.frame, Frame::ScriptReload);
    }
}
