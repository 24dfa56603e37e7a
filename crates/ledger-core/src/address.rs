//! Remote endpoint descriptors as they travel in `addr`/`version` payloads.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_PORT, PEER_ADDRESS_SIZE};
use crate::error::AddressError;

/// Host, port, service flags and last-seen time of a peer.
///
/// IPv4 hosts are kept in their IPv4-mapped IPv6 form, which is how they
/// are encoded on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    ip: Ipv6Addr,
    port: u16,
    services: u64,
    last_seen: u32,
}

impl PeerAddress {
    /// Parse `host:port`, `host`, `[v6]:port` or a bare IPv6 literal.
    /// The host must be an IP literal; a missing port means [`DEFAULT_PORT`].
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let invalid = || AddressError::InvalidAddress(s.to_string());
        let s = s.trim();
        if s.is_empty() {
            return Err(invalid());
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            match tail {
                "" => (host, None),
                _ => (host, Some(tail.strip_prefix(':').ok_or_else(invalid)?)),
            }
        } else if s.matches(':').count() == 1 {
            let (host, port) = s.split_once(':').ok_or_else(invalid)?;
            (host, Some(port))
        } else {
            (s, None)
        };

        let ip = IpAddr::from_str(host).map_err(|_| invalid())?;
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };
        Ok(Self::from_ip(ip, port))
    }

    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        let ip = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            ip,
            port,
            services: 0,
            last_seen: 0,
        }
    }

    /// From the raw 16-byte wire form of the host.
    pub fn from_raw(raw: [u8; 16], port: u16) -> Self {
        Self::from_ip(IpAddr::V6(Ipv6Addr::from(raw)), port)
    }

    /// Copy host and port of another address. Services and last-seen start over.
    pub fn from_peer(other: &PeerAddress) -> Self {
        Self::from_ip(IpAddr::V6(other.ip), other.port)
    }

    pub fn with_services(mut self, services: u64) -> Self {
        self.services = services;
        self
    }

    pub fn with_last_seen(mut self, last_seen: u32) -> Self {
        self.last_seen = last_seen;
        self
    }

    /// The host, unmapped back to IPv4 when it is an IPv4-mapped address.
    pub fn ip(&self) -> IpAddr {
        match self.ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(self.ip),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn services(&self) -> u64 {
        self.services
    }

    pub fn last_seen(&self) -> u32 {
        self.last_seen
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), self.port)
    }

    pub fn to_bytes(&self) -> [u8; PEER_ADDRESS_SIZE] {
        let mut out = [0u8; PEER_ADDRESS_SIZE];
        out[0..4].copy_from_slice(&self.last_seen.to_le_bytes());
        out[4..12].copy_from_slice(&self.services.to_le_bytes());
        out[12..28].copy_from_slice(&self.ip.octets());
        out[28..30].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        if bytes.len() != PEER_ADDRESS_SIZE {
            return Err(AddressError::InvalidAddress(format!(
                "expected {PEER_ADDRESS_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut last_seen = [0u8; 4];
        let mut services = [0u8; 8];
        let mut raw = [0u8; 16];
        let mut port = [0u8; 2];
        last_seen.copy_from_slice(&bytes[0..4]);
        services.copy_from_slice(&bytes[4..12]);
        raw.copy_from_slice(&bytes[12..28]);
        port.copy_from_slice(&bytes[28..30]);
        Ok(Self::from_raw(raw, u16::from_be_bytes(port))
            .with_services(u64::from_le_bytes(services))
            .with_last_seen(u32::from_le_bytes(last_seen)))
    }
}

impl FromStr for PeerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip(), addr.port())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn parses_host_and_port() {
        let addr = PeerAddress::parse("10.0.0.1:18333").unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(addr.port(), 18333);
        assert_eq!(addr.to_string(), "10.0.0.1:18333");
    }

    #[test]
    fn default_port_when_missing() {
        assert_eq!(PeerAddress::parse("127.0.0.1").unwrap().port(), DEFAULT_PORT);
        assert_eq!(PeerAddress::parse("::1").unwrap().port(), DEFAULT_PORT);
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let addr: PeerAddress = "[2001:db8::1]:9000".parse().unwrap();
        assert_eq!(addr.port(), 9000);
        assert_eq!(addr.ip(), "2001:db8::1".parse::<IpAddr>().unwrap());
        assert_eq!(PeerAddress::parse("[::1]").unwrap().port(), DEFAULT_PORT);
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "seed.example.org:8333", "1.2.3.4:notaport", "1.2.3.4:70000", "[::1", "[::1]x"] {
            assert!(
                matches!(PeerAddress::parse(bad), Err(AddressError::InvalidAddress(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn wire_record_layout() {
        let addr = PeerAddress::parse("1.2.3.4:8333")
            .unwrap()
            .with_services(1)
            .with_last_seen(0x0102_0304);
        let bytes = addr.to_bytes();
        assert_eq!(bytes.len(), 30);
        assert_eq!(&bytes[0..4], &[4, 3, 2, 1]);
        assert_eq!(&bytes[4..12], &1u64.to_le_bytes());
        assert_eq!(&bytes[12..24], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(&bytes[24..28], &[1, 2, 3, 4]);
        assert_eq!(&bytes[28..30], &[0x20, 0x8d]);
        assert_eq!(PeerAddress::from_bytes(&bytes).unwrap(), addr);
        assert!(PeerAddress::from_bytes(&bytes[..29]).is_err());
    }

    #[test]
    fn raw_and_copy_constructors() {
        let mapped = Ipv4Addr::new(192, 168, 1, 7).to_ipv6_mapped().octets();
        let addr = PeerAddress::from_raw(mapped, 8333).with_services(9);
        assert_eq!(addr.to_string(), "192.168.1.7:8333");
        let copy = PeerAddress::from_peer(&addr);
        assert_eq!(copy.socket_addr(), addr.socket_addr());
        assert_eq!(copy.services(), 0);
    }
}
