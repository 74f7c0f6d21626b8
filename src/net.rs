//! The network-layer collaborator (spec.md §6): a capability set the TCP
//! core needs from whatever delivers datagrams. Grounded on the Design
//! Notes' "polymorphic face interface" guidance — modeled as a trait
//! rather than the source's up/down/send/destroy capability struct, since
//! this core only ever needs `send` and a blocking `recv`.

use std::sync::mpsc::{self, Receiver, Sender};

use crate::address::Endpoint;
use crate::error::{Result, TcpError};

/// Synchronous best-effort datagram emission, plus the blocking receive
/// the event loop polls. A real embedded stack would implement this over
/// its netface/L2 driver; tests drive two TCBs over [`LoopbackPair`].
pub trait NetworkEndpoint: Send + Sync {
    fn send(&self, dst: Endpoint, bytes: &[u8]) -> Result<()>;

    /// Blocks until a datagram arrives. Returns the sender's endpoint
    /// (source address/port/netif) and the payload.
    fn recv(&self) -> Option<(Endpoint, Vec<u8>)>;
}

/// A single side of an in-memory loopback pair: `send` pushes onto the
/// peer's channel, `recv` pulls from its own.
pub struct LoopbackEndpoint {
    local: Endpoint,
    peer: Endpoint,
    outbound: Sender<(Endpoint, Vec<u8>)>,
    inbound: Receiver<(Endpoint, Vec<u8>)>,
}

impl NetworkEndpoint for LoopbackEndpoint {
    fn send(&self, dst: Endpoint, bytes: &[u8]) -> Result<()> {
        if dst.addr != self.peer.addr {
            return Err(TcpError::FamilyUnsupported);
        }
        self.outbound
            .send((self.local, bytes.to_vec()))
            .map_err(|_| TcpError::NotConnected)
    }

    fn recv(&self) -> Option<(Endpoint, Vec<u8>)> {
        self.inbound.recv().ok()
    }
}

/// Two [`LoopbackEndpoint`]s wired directly together, used only by tests
/// to drive two TCBs back-to-back without a real NIC (spec.md §8).
pub struct LoopbackPair {
    pub a: LoopbackEndpoint,
    pub b: LoopbackEndpoint,
}

impl LoopbackPair {
    pub fn new(a_addr: Endpoint, b_addr: Endpoint) -> Self {
        let (a_to_b, b_from_a) = mpsc::channel();
        let (b_to_a, a_from_b) = mpsc::channel();
        Self {
            a: LoopbackEndpoint {
                local: a_addr,
                peer: b_addr,
                outbound: a_to_b,
                inbound: a_from_b,
            },
            b: LoopbackEndpoint {
                local: b_addr,
                peer: a_addr,
                outbound: b_to_a,
                inbound: b_from_a,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagrams_cross_from_a_to_b() {
        let pair = LoopbackPair::new(Endpoint::unspecified(1), Endpoint::unspecified(2));
        pair.a.send(pair.b.local, b"hello").unwrap();
        let (src, bytes) = pair.b.recv().unwrap();
        assert_eq!(src, pair.a.local);
        assert_eq!(bytes, b"hello");
    }
}
