//! Broadcast address discovery from local network interfaces.
//!
//! Used when a wake request does not carry an explicit broadcast address:
//! every non-loopback IPv4 subnet gets its own magic packet.

use if_addrs::{get_if_addrs, IfAddr, Interface};
use std::net::Ipv4Addr;
use tracing::debug;

/// Source of candidate broadcast addresses.
pub trait BroadcastResolver: Send + Sync {
    /// Returns every broadcast address worth sending to. An empty list is
    /// a valid answer; the dispatcher decides what it means.
    fn broadcast_addresses(&self) -> std::io::Result<Vec<Ipv4Addr>>;
}

/// Resolver backed by the host's interface table.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterfaceResolver;

impl BroadcastResolver for InterfaceResolver {
    fn broadcast_addresses(&self) -> std::io::Result<Vec<Ipv4Addr>> {
        Ok(broadcasts_of(get_if_addrs()?))
    }
}

/// Broadcast addresses of the non-loopback IPv4 interfaces, first seen first.
pub fn broadcasts_of(ifaces: impl IntoIterator<Item = Interface>) -> Vec<Ipv4Addr> {
    let mut out = Vec::new();
    for iface in ifaces {
        if iface.is_loopback() {
            continue;
        }
        // WoL goes out over IPv4/UDP only
        let IfAddr::V4(v4) = &iface.addr else { continue };
        let bcast = broadcast_address(v4.ip, v4.netmask);
        debug!(interface = %iface.name, ip = %v4.ip, broadcast = %bcast, "found broadcast address");
        push_unique(&mut out, bcast);
    }
    out
}

/// `ip | !mask`, octet by octet.
pub fn broadcast_address(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    let ip = ip.octets();
    let mask = mask.octets();
    let mut out = [0u8; 4];
    for i in 0..4 {
        out[i] = ip[i] | !mask[i];
    }
    Ipv4Addr::from(out)
}

fn push_unique(list: &mut Vec<Ipv4Addr>, addr: Ipv4Addr) {
    if !list.contains(&addr) {
        list.push(addr);
    }
}
