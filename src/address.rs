//! Network-layer addressing: the single address shape this crate supports
//! (spec.md Non-goals explicitly exclude multi-family parsing), plus the
//! `Endpoint` round trip of spec.md §6.

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use crate::error::TcpError;

/// The one network-layer address shape this crate speaks: an IPv6-like
/// 128-bit address. Reusing [`Ipv6Addr`] gives us a battle-tested textual
/// form for free instead of hand-rolling one.
pub type Addr = Ipv6Addr;

/// A fully or partially specified endpoint: address, port, and an optional
/// network-interface index, matching the `ep_from_str`/`ep_to_str` contract
/// of spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: Addr,
    pub port: u16,
    pub netif: u32,
}

impl Endpoint {
    pub const UNSPECIFIED: Addr = Ipv6Addr::UNSPECIFIED;

    pub fn new(addr: Addr, port: u16, netif: u32) -> Self {
        Self { addr, port, netif }
    }

    pub fn unspecified(port: u16) -> Self {
        Self::new(Self::UNSPECIFIED, port, 0)
    }

    pub fn is_unspecified_addr(&self) -> bool {
        self.addr == Self::UNSPECIFIED
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.addr)?;
        if self.port != 0 {
            write!(f, ":{}", self.port)?;
        }
        if self.netif != 0 {
            write!(f, "%{}", self.netif)?;
        }
        Ok(())
    }
}

/// Parses the bracketed endpoint form `"[" address "]" [":" port] ["%" netif]`.
///
/// Empty port or netif components yield zero, per spec.md §6.
pub fn ep_from_str(s: &str) -> Result<Endpoint, TcpError> {
    let s = s.trim();
    let rest = s.strip_prefix('[').ok_or(TcpError::InvalidArg)?;
    let close = rest.find(']').ok_or(TcpError::InvalidArg)?;
    let (addr_str, tail) = rest.split_at(close);
    let tail = &tail[1..]; // drop ']'

    let addr = Addr::from_str(addr_str).map_err(|_| TcpError::InvalidArg)?;

    let mut port: u16 = 0;
    let mut netif: u32 = 0;

    if let Some(pct) = tail.find('%') {
        let (port_part, netif_part) = tail.split_at(pct);
        let netif_part = &netif_part[1..];
        if !port_part.is_empty() {
            let port_part = port_part.strip_prefix(':').ok_or(TcpError::InvalidArg)?;
            if !port_part.is_empty() {
                port = port_part.parse().map_err(|_| TcpError::InvalidArg)?;
            }
        }
        if !netif_part.is_empty() {
            netif = netif_part.parse().map_err(|_| TcpError::InvalidArg)?;
        }
    } else if !tail.is_empty() {
        let port_part = tail.strip_prefix(':').ok_or(TcpError::InvalidArg)?;
        if !port_part.is_empty() {
            port = port_part.parse().map_err(|_| TcpError::InvalidArg)?;
        }
    }

    Ok(Endpoint::new(addr, port, netif))
}

/// Renders an endpoint in the format `ep_from_str` accepts.
pub fn ep_to_str(ep: &Endpoint) -> String {
    ep.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_full_endpoint() {
        let ep = Endpoint::new("::1".parse().unwrap(), 7777, 3);
        let s = ep_to_str(&ep);
        assert_eq!(ep_from_str(&s).unwrap(), ep);
    }

    #[test]
    fn round_trips_bare_address() {
        let ep = Endpoint::new("fe80::1".parse().unwrap(), 0, 0);
        let s = ep_to_str(&ep);
        assert_eq!(s, "[fe80::1]");
        assert_eq!(ep_from_str(&s).unwrap(), ep);
    }

    #[test]
    fn empty_port_and_netif_are_zero() {
        let ep = ep_from_str("[::1]:%").unwrap();
        assert_eq!(ep.port, 0);
        assert_eq!(ep.netif, 0);

        let ep = ep_from_str("[::1]%5").unwrap();
        assert_eq!(ep.port, 0);
        assert_eq!(ep.netif, 5);
    }

    #[test]
    fn rejects_missing_brackets() {
        assert_eq!(ep_from_str("::1:80"), Err(TcpError::InvalidArg));
    }
}
