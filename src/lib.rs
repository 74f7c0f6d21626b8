//! A per-connection TCP finite state machine for embedded network stacks:
//! the TCB, the pure FSM core, the timer service and mailbox it talks
//! through, and the event-loop/blocking-API pair that wires it to a real
//! (or loopback) network collaborator.

pub mod address;
pub mod config;
pub mod error;
pub mod net;

mod api;
mod buffer_pool;
mod codec;
mod event_loop;
mod fsm;
mod mailbox;
mod runtime;
mod tcb;
mod timer;

pub use address::{ep_from_str, ep_to_str, Addr, Endpoint};
pub use api::{TcpListener, TcpStack, TcpStream};
pub use config::Config;
pub use error::{Result, TcpError};
pub use net::{LoopbackEndpoint, LoopbackPair, NetworkEndpoint};

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn stacks() -> (Arc<TcpStack>, Arc<TcpStack>, Endpoint, Endpoint) {
        let a_ep = Endpoint::new("fe80::a".parse().unwrap(), 0, 0);
        let b_ep = Endpoint::new("fe80::b".parse().unwrap(), 0, 0);
        let pair = LoopbackPair::new(a_ep, b_ep);
        let a = TcpStack::new(Arc::new(pair.a), a_ep.addr, Config::default());
        let b = TcpStack::new(Arc::new(pair.b), b_ep.addr, Config::default());
        (a, b, a_ep, b_ep)
    }

    #[test]
    fn handshake_and_data_transfer() {
        let (a, b, a_ep, b_ep) = stacks();
        let listener = b.listen(7000).unwrap();

        let server = thread::spawn(move || {
            let mut stream = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").unwrap();
            stream
        });

        let mut client = a
            .connect(6000, Endpoint::new(b_ep.addr, 7000, 0))
            .unwrap();
        client.write_all(b"hello").unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"world");

        let _server_stream = server.join().unwrap();
        let _ = a_ep;
    }

    #[test]
    fn graceful_close_reaches_closed_on_both_sides() {
        let (a, b, _a_ep, b_ep) = stacks();
        let listener = b.listen(7001).unwrap();

        let server = thread::spawn(move || {
            let stream = listener.accept().unwrap();
            let mut buf = [0u8; 1];
            // EOF once the client's FIN has been processed.
            assert_eq!(stream.recv(&mut buf, None).unwrap(), 0);
            stream.close().unwrap();
        });

        let client = a.connect(6001, Endpoint::new(b_ep.addr, 7001, 0)).unwrap();
        client.close().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn reset_surfaces_as_conn_reset() {
        let (a, b, _a_ep, b_ep) = stacks();
        let listener = b.listen(7002).unwrap();

        let server = thread::spawn(move || {
            let stream = listener.accept().unwrap();
            stream.abort();
        });

        let client = a.connect(6002, Endpoint::new(b_ep.addr, 7002, 0)).unwrap();
        server.join().unwrap();
        let mut buf = [0u8; 1];
        let err = client.recv(&mut buf, Some(5_000)).unwrap_err();
        assert_eq!(err, TcpError::ConnReset);
    }

    #[test]
    fn connect_to_silent_peer_times_out_without_blocking_forever() {
        let a_ep = Endpoint::new("fe80::c".parse().unwrap(), 0, 0);
        let b_ep = Endpoint::new("fe80::d".parse().unwrap(), 0, 0);
        let pair = LoopbackPair::new(a_ep, b_ep);
        // `b`'s endpoint is wired but nothing ever calls `listen`/`accept`
        // on it, so every SYN vanishes into the ether like a silent peer.
        let _keep_b_alive = Arc::new(pair.b);

        let mut config = Config::default();
        config.rto_initial_ms = 10;
        config.rto_min_ms = 10;
        config.rto_max_ms = 40;
        config.retries_max = 3;
        let a = TcpStack::new(Arc::new(pair.a), a_ep.addr, config);

        let err = a
            .connect(6003, Endpoint::new(b_ep.addr, 7003, 0))
            .unwrap_err();
        assert_eq!(err, TcpError::TimedOut);
    }

    #[test]
    fn recv_with_zero_timeout_does_not_block() {
        let (a, b, _a_ep, b_ep) = stacks();
        let listener = b.listen(7004).unwrap();
        let server = thread::spawn(move || listener.accept().unwrap());

        let client = a.connect(6004, Endpoint::new(b_ep.addr, 7004, 0)).unwrap();
        let _server_stream = server.join().unwrap();

        let mut buf = [0u8; 1];
        let err = client.recv(&mut buf, Some(0)).unwrap_err();
        assert_eq!(err, TcpError::WouldBlock);
    }

    #[test]
    fn addr_in_use_rejects_duplicate_listener() {
        let (_a, b, _a_ep, _b_ep) = stacks();
        let _first = b.listen(7005).unwrap();
        let err = b.listen(7005).unwrap_err();
        assert_eq!(err, TcpError::AddrInUse);
    }
}
