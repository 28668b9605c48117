//! Interface discovery: preferred outbound IPv4 and its subnet broadcast.
//!
//! The preferred address is whatever source address the OS would pick to
//! reach the public internet, read back from an unconnected datagram
//! socket. The broadcast address comes from the netmask of the interface
//! carrying that address, falling back to the limited broadcast address
//! when the interface cannot be determined.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::warn;

use crate::error::{Error, Result};

/// Well-known public endpoint used only for route selection; no packet is
/// ever sent to it.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// The preferred local IPv4 address and the broadcast address of its subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPair {
    pub preferred: Ipv4Addr,
    pub broadcast: Ipv4Addr,
}

/// The IPv4 address the OS would use as source toward the internet.
pub fn preferred_ip() -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    socket.connect(ROUTE_PROBE_ADDR)?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(_) => Err(Error::DiscoveryFailed),
    }
}

/// The subnet broadcast address of the interface carrying `ip`, if that
/// interface (and its netmask) can be found.
pub fn broadcast_for_ip(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    let interfaces = if_addrs::get_if_addrs().ok()?;
    for iface in interfaces {
        if let if_addrs::IfAddr::V4(v4) = iface.addr {
            if v4.ip == ip {
                // Prefer the kernel-reported broadcast, else derive it.
                if let Some(bcast) = v4.broadcast {
                    return Some(bcast);
                }
                let addr = u32::from(v4.ip);
                let mask = u32::from(v4.netmask);
                return Some(Ipv4Addr::from(addr & mask | !mask));
            }
        }
    }
    None
}

/// Discover both addresses, warning and falling back to the limited
/// broadcast address (`255.255.255.255`) when the subnet broadcast cannot
/// be determined.
pub fn discover() -> Result<IpPair> {
    let preferred = preferred_ip()?;
    let broadcast = match broadcast_for_ip(preferred) {
        Some(addr) => addr,
        None => {
            warn!(%preferred, "no broadcast address for interface, using limited broadcast");
            Ipv4Addr::BROADCAST
        }
    };
    Ok(IpPair {
        preferred,
        broadcast,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_math_from_netmask() {
        // 192.168.1.7/24 -> 192.168.1.255
        let addr = u32::from(Ipv4Addr::new(192, 168, 1, 7));
        let mask = u32::from(Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(
            Ipv4Addr::from(addr & mask | !mask),
            Ipv4Addr::new(192, 168, 1, 255)
        );

        // 10.0.0.1/8 -> 10.255.255.255
        let addr = u32::from(Ipv4Addr::new(10, 0, 0, 1));
        let mask = u32::from(Ipv4Addr::new(255, 0, 0, 0));
        assert_eq!(
            Ipv4Addr::from(addr & mask | !mask),
            Ipv4Addr::new(10, 255, 255, 255)
        );
    }

    #[test]
    fn loopback_has_no_subnet_broadcast_or_is_consistent() {
        // Whatever interface set the host has, the lookup must not panic and
        // a found broadcast must be in the same network as the input.
        if let Some(bcast) = broadcast_for_ip(Ipv4Addr::new(127, 0, 0, 1)) {
            assert_eq!(u32::from(bcast) & 0xFF00_0000, 0x7F00_0000);
        }
    }
}
