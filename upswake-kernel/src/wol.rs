//! Wake-on-LAN magic packet construction and dispatch.
//!
//! Magic packet format:
//! - 6 bytes of 0xFF
//! - target MAC repeated 16 times (96 bytes)
//! - total: 102 bytes, no checksum, no SecureOn password

use crate::config::WakeTarget;
use crate::net::BroadcastResolver;
use async_trait::async_trait;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::info;

pub const MAGIC_PACKET_LEN: usize = 102;
pub const DEFAULT_WOL_PORT: u16 = 9;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid MAC address: {0:?}")]
pub struct InvalidMac(pub String);

#[derive(Debug, Error)]
pub enum WakeError {
    #[error(transparent)]
    InvalidMac(#[from] InvalidMac),

    #[error("invalid broadcast address: {0:?}")]
    InvalidBroadcast(String),

    #[error("short write to {addr}: sent {sent} of {MAGIC_PACKET_LEN} bytes")]
    ShortWrite { addr: SocketAddr, sent: usize },

    #[error("no broadcast addresses available")]
    NoBroadcastAddresses,

    #[error("failed to enumerate network interfaces: {0}")]
    Interfaces(#[source] std::io::Error),

    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

/// A 6-octet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl FromStr for MacAddr {
    type Err = InvalidMac;

    /// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` and `aabb.ccdd.eeff`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || InvalidMac(s.to_string());
        let s_trim = s.trim();

        let groups: Vec<&str> = if s_trim.contains(':') {
            s_trim.split(':').collect()
        } else if s_trim.contains('-') {
            s_trim.split('-').collect()
        } else if s_trim.contains('.') {
            s_trim.split('.').collect()
        } else {
            return Err(bad());
        };

        let hex: String = match groups.len() {
            6 if groups.iter().all(|g| g.len() == 2) => groups.concat(),
            3 if s_trim.contains('.') && groups.iter().all(|g| g.len() == 4) => groups.concat(),
            _ => return Err(bad()),
        };

        let mut out = [0u8; 6];
        for (i, byte) in out.iter_mut().enumerate() {
            let pair = hex.get(i * 2..i * 2 + 2).ok_or_else(bad)?;
            *byte = u8::from_str_radix(pair, 16).map_err(|_| bad())?;
        }
        Ok(MacAddr(out))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

pub fn magic_packet(mac: MacAddr) -> [u8; MAGIC_PACKET_LEN] {
    let mut pkt = [0xFFu8; MAGIC_PACKET_LEN];
    for chunk in pkt[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac.0);
    }
    pkt
}

/// Datagram sink. Returns the number of bytes the OS accepted.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to(&self, packet: &[u8], addr: SocketAddr) -> std::io::Result<usize>;
}

/// Opens a fresh UDP socket per send; nothing is pooled.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpTransport;

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, packet: &[u8], addr: SocketAddr) -> std::io::Result<usize> {
        let local: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        if addr.is_ipv4() {
            socket.set_broadcast(true)?;
        }
        socket.send_to(packet, addr).await
    }
}

#[derive(Clone)]
pub struct WakeDispatcher {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn BroadcastResolver>,
}

impl WakeDispatcher {
    pub fn new(transport: Arc<dyn Transport>, resolver: Arc<dyn BroadcastResolver>) -> Self {
        Self { transport, resolver }
    }

    /// Real UDP sockets and the host interface table.
    pub fn udp() -> Self {
        Self::new(Arc::new(UdpTransport), Arc::new(crate::net::InterfaceResolver))
    }

    /// Wakes a configured target. Targets without a broadcast address fall
    /// back to every discovered local broadcast address.
    pub async fn wake(&self, target: &WakeTarget) -> Result<(), WakeError> {
        let mac: MacAddr = target.mac.parse()?;
        match target.broadcast.as_deref().map(str::trim) {
            Some(b) if !b.is_empty() => {
                let ip = parse_broadcast(b)?;
                self.send(mac, SocketAddr::new(ip, target.port)).await
            }
            _ => self.broadcast_wake_mac(mac, target.port).await,
        }
    }

    /// Unconditional wake to an explicit broadcast address.
    pub async fn wake_to(&self, mac: &str, broadcast: &str, port: u16) -> Result<(), WakeError> {
        let mac: MacAddr = mac.parse()?;
        let ip = parse_broadcast(broadcast)?;
        self.send(mac, SocketAddr::new(ip, port)).await
    }

    /// Unconditional wake to every discovered broadcast address.
    /// Fails fast on the first address that cannot be reached.
    pub async fn broadcast_wake(&self, mac: &str, port: u16) -> Result<(), WakeError> {
        let mac: MacAddr = mac.parse()?;
        self.broadcast_wake_mac(mac, port).await
    }

    async fn broadcast_wake_mac(&self, mac: MacAddr, port: u16) -> Result<(), WakeError> {
        let addrs = self
            .resolver
            .broadcast_addresses()
            .map_err(WakeError::Interfaces)?;
        if addrs.is_empty() {
            return Err(WakeError::NoBroadcastAddresses);
        }
        for ip in addrs {
            self.send(mac, SocketAddr::new(IpAddr::V4(ip), port)).await?;
        }
        Ok(())
    }

    pub async fn send(&self, mac: MacAddr, addr: SocketAddr) -> Result<(), WakeError> {
        let pkt = magic_packet(mac);
        let sent = self.transport.send_to(&pkt, addr).await?;
        if sent != MAGIC_PACKET_LEN {
            return Err(WakeError::ShortWrite { addr, sent });
        }
        info!(mac = %mac, %addr, "Wake on LAN sent");
        Ok(())
    }
}

fn parse_broadcast(s: &str) -> Result<IpAddr, WakeError> {
    s.trim()
        .parse::<IpAddr>()
        .map_err(|_| WakeError::InvalidBroadcast(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        accept: usize,
        sent: Mutex<Vec<SocketAddr>>,
    }

    impl Recorder {
        fn new(accept: usize) -> Arc<Self> {
            Arc::new(Self { accept, sent: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn send_to(&self, packet: &[u8], addr: SocketAddr) -> std::io::Result<usize> {
            assert_eq!(packet.len(), MAGIC_PACKET_LEN);
            self.sent.lock().push(addr);
            Ok(self.accept.min(packet.len()))
        }
    }

    struct Fixed(Vec<Ipv4Addr>);

    impl BroadcastResolver for Fixed {
        fn broadcast_addresses(&self) -> std::io::Result<Vec<Ipv4Addr>> {
            Ok(self.0.clone())
        }
    }

    fn target(broadcast: Option<&str>) -> WakeTarget {
        WakeTarget {
            name: "nas".into(),
            mac: "00:11:22:33:44:55".into(),
            broadcast: broadcast.map(String::from),
            port: 9,
            interval: "5m".into(),
            rules: vec![],
        }
    }

    #[test]
    fn test_parse_mac_formats() {
        let want = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!("aa:bb:cc:dd:ee:ff".parse::<MacAddr>().unwrap(), want);
        assert_eq!("AA-BB-CC-DD-EE-FF".parse::<MacAddr>().unwrap(), want);
        assert_eq!("aabb.ccdd.eeff".parse::<MacAddr>().unwrap(), want);
        assert_eq!(want.to_string(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_parse_mac_rejects_garbage() {
        for bad in [
            "",
            "invalid",
            "aa:bb:cc:dd:ee",
            "aa:bb:cc:dd:ee:gg",
            "aabbccddeeff",
            "a:bb:cc:dd:ee:fff",
        ] {
            assert_eq!(bad.parse::<MacAddr>(), Err(InvalidMac(bad.to_string())), "{bad}");
        }
    }

    #[test]
    fn test_magic_packet_format() {
        let pkt = magic_packet("01:02:03:04:05:06".parse().unwrap());
        assert_eq!(pkt.len(), 102);
        assert_eq!(&pkt[0..6], &[0xFF; 6]);
        for i in 0..16 {
            let offset = 6 + i * 6;
            assert_eq!(&pkt[offset..offset + 6], &[1, 2, 3, 4, 5, 6]);
        }
    }

    #[tokio::test]
    async fn test_wake_uses_configured_broadcast() {
        let rec = Recorder::new(MAGIC_PACKET_LEN);
        let d = WakeDispatcher::new(rec.clone(), Arc::new(Fixed(vec![])));
        d.wake(&target(Some("192.168.1.255"))).await.unwrap();
        assert_eq!(*rec.sent.lock(), vec!["192.168.1.255:9".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_short_write_is_an_error() {
        let rec = Recorder::new(50);
        let d = WakeDispatcher::new(rec, Arc::new(Fixed(vec![])));
        let err = d.wake(&target(Some("192.168.1.255"))).await.unwrap_err();
        assert!(matches!(err, WakeError::ShortWrite { sent: 50, .. }));
    }

    #[tokio::test]
    async fn test_invalid_mac_before_any_send() {
        let rec = Recorder::new(MAGIC_PACKET_LEN);
        let d = WakeDispatcher::new(rec.clone(), Arc::new(Fixed(vec![Ipv4Addr::BROADCAST])));
        let err = d.broadcast_wake("zz:zz", 9).await.unwrap_err();
        assert!(matches!(err, WakeError::InvalidMac(_)));
        assert!(rec.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_wake_without_addresses() {
        let d = WakeDispatcher::new(Recorder::new(MAGIC_PACKET_LEN), Arc::new(Fixed(vec![])));
        let err = d.broadcast_wake("00:11:22:33:44:55", 9).await.unwrap_err();
        assert!(matches!(err, WakeError::NoBroadcastAddresses));
        assert_eq!(err.to_string(), "no broadcast addresses available");
    }

    #[tokio::test]
    async fn test_broadcast_wake_fans_out_and_fails_fast() {
        let addrs = vec![Ipv4Addr::new(10, 0, 0, 255), Ipv4Addr::new(192, 168, 1, 255)];
        let rec = Recorder::new(MAGIC_PACKET_LEN);
        let d = WakeDispatcher::new(rec.clone(), Arc::new(Fixed(addrs.clone())));
        d.broadcast_wake("00:11:22:33:44:55", 7).await.unwrap();
        assert_eq!(rec.sent.lock().len(), 2);

        let short = Recorder::new(10);
        let d = WakeDispatcher::new(short.clone(), Arc::new(Fixed(addrs)));
        assert!(d.broadcast_wake("00:11:22:33:44:55", 7).await.is_err());
        assert_eq!(short.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_target_without_broadcast_falls_back_to_discovery() {
        let rec = Recorder::new(MAGIC_PACKET_LEN);
        let resolver = Arc::new(Fixed(vec![Ipv4Addr::new(10, 9, 9, 255)]));
        let d = WakeDispatcher::new(rec.clone(), resolver);
        d.wake(&target(None)).await.unwrap();
        assert_eq!(*rec.sent.lock(), vec!["10.9.9.255:9".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_udp_transport_sends_full_packet() {
        let rx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = rx.local_addr().unwrap();
        let d = WakeDispatcher::new(Arc::new(UdpTransport), Arc::new(Fixed(vec![])));
        d.wake_to("01:02:03:04:05:06", "127.0.0.1", addr.port()).await.unwrap();

        let mut buf = [0u8; 256];
        let (n, _) = rx.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, MAGIC_PACKET_LEN);
        assert_eq!(&buf[..n], &magic_packet("01:02:03:04:05:06".parse().unwrap())[..]);
    }
}
