//! Martian endpoint filtering.
//!
//! A martian endpoint is unroutable or reserved and must never enter the
//! routing table or be handed to clients: the DHT would otherwise happily
//! redirect traffic at loopback, private ranges or multicast groups.

use std::net::{IpAddr, SocketAddr};

/// Ports below this are rejected unless the local policy allows them;
/// nothing legitimate announces a DHT node on a system port.
const MIN_PEER_PORT: u16 = 1024;

/// Whether `ep` must be filtered from DHT traffic.
pub fn is_martian(ep: &SocketAddr) -> bool {
    if ep.port() == 0 || ep.port() < MIN_PEER_PORT {
        return true;
    }
    match ep.ip() {
        IpAddr::V4(ip) => {
            ip.is_unspecified()
                || ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_multicast()
                || ip.is_broadcast()
        }
        IpAddr::V6(ip) => {
            ip.is_unspecified()
                || ip.is_loopback()
                || ip.is_multicast()
                // Unique-local fc00::/7 and link-local fe80::/10.
                || (ip.segments()[0] & 0xfe00) == 0xfc00
                || (ip.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// `is_martian`, but with loopback allowed. Tests and single-host setups
/// run whole swarms on 127.0.0.1.
pub fn is_martian_allow_loopback(ep: &SocketAddr) -> bool {
    if ep.ip().is_loopback() {
        return ep.port() == 0;
    }
    is_martian(ep)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_martian_v4() {
        assert!(is_martian(&ep("0.0.0.0:6881")));
        assert!(is_martian(&ep("127.0.0.1:6881")));
        assert!(is_martian(&ep("10.0.0.1:6881")));
        assert!(is_martian(&ep("172.16.5.5:6881")));
        assert!(is_martian(&ep("192.168.1.1:6881")));
        assert!(is_martian(&ep("169.254.0.1:6881")));
        assert!(is_martian(&ep("224.0.0.1:6881")));
        assert!(is_martian(&ep("8.8.8.8:80"))); // low port
        assert!(!is_martian(&ep("8.8.8.8:6881")));
    }

    #[test]
    fn test_martian_v6() {
        assert!(is_martian(&ep("[::]:6881")));
        assert!(is_martian(&ep("[::1]:6881")));
        assert!(is_martian(&ep("[fe80::1]:6881")));
        assert!(is_martian(&ep("[fc00::1]:6881")));
        assert!(is_martian(&ep("[ff02::1]:6881")));
        assert!(!is_martian(&ep("[2001:db8::1]:6881")));
    }

    #[test]
    fn test_loopback_exception() {
        assert!(!is_martian_allow_loopback(&ep("127.0.0.1:6881")));
        assert!(!is_martian_allow_loopback(&ep("127.0.0.1:80")));
        assert!(is_martian_allow_loopback(&ep("10.0.0.1:6881")));
    }
}
