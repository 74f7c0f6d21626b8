//! The connection registry and the single network-reading thread that feeds
//! it (spec.md §4.5). Grounded on the teacher's `segment_loop`/`Manager`
//! pattern in `src_old/lib.rs`: one thread blocks on the network
//! collaborator's `recv`, decodes, finds the owning TCB under its FSM lock,
//! and steps it. A second thread drains the stack's shared housekeeping
//! mailbox, which is where the TIME_WAIT timer (and, defensively, any other
//! timer firing with no user call bound) lands once the blocking call that
//! armed it has already returned.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::address::{Addr, Endpoint};
use crate::buffer_pool::BufferPool;
use crate::codec::{self, PseudoHeader, TcpHeader};
use crate::config::Config;
use crate::fsm::{self, Event};
use crate::mailbox::{Mailbox, MailboxMsg, MailboxSender, TimeoutKind};
use crate::net::NetworkEndpoint;
use crate::runtime::apply_effects;
use crate::tcb::{State, Tcb};
use crate::timer::TimerService;

pub type ConnId = u64;

/// The accept queue a passive-open listener hands established children
/// through, woken by a `Condvar` as each handshake completes.
pub struct ListenerShared {
    pub queue: Mutex<VecDeque<ConnId>>,
    pub cvar: Condvar,
}

impl ListenerShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            cvar: Condvar::new(),
        })
    }
}

/// One registry entry. The FSM lock (`tcb`) and the function lock
/// (`call_lock`) are deliberately separate: invariant 1 only needs the
/// former held while stepping the FSM, while invariant 2 needs the latter
/// held for the whole duration of a blocking user call.
pub struct Connection {
    pub id: ConnId,
    pub tcb: Mutex<Tcb>,
    pub call_lock: Mutex<()>,
    established_key: Option<(u16, Endpoint)>,
    listening_port: Option<u16>,
    pub listener: Option<Arc<ListenerShared>>,
}

#[derive(Default)]
pub struct Registry {
    next_id: ConnId,
    conns: HashMap<ConnId, Arc<Connection>>,
    established: HashMap<(u16, Endpoint), ConnId>,
    listening: HashMap<u16, ConnId>,
}

impl Registry {
    fn alloc_id(&mut self) -> ConnId {
        self.next_id += 1;
        self.next_id
    }

    pub fn insert_active(&mut self, local_port: u16, peer: Endpoint, tcb: Tcb) -> Arc<Connection> {
        let id = self.alloc_id();
        let conn = Arc::new(Connection {
            id,
            tcb: Mutex::new(tcb),
            call_lock: Mutex::new(()),
            established_key: Some((local_port, peer)),
            listening_port: None,
            listener: None,
        });
        self.established.insert((local_port, peer), id);
        self.conns.insert(id, conn.clone());
        conn
    }

    pub fn insert_listener(&mut self, local_port: u16, tcb: Tcb) -> Arc<Connection> {
        let id = self.alloc_id();
        let conn = Arc::new(Connection {
            id,
            tcb: Mutex::new(tcb),
            call_lock: Mutex::new(()),
            established_key: None,
            listening_port: Some(local_port),
            listener: Some(ListenerShared::new()),
        });
        self.listening.insert(local_port, id);
        self.conns.insert(id, conn.clone());
        conn
    }

    fn insert_child(
        &mut self,
        local_port: u16,
        peer: Endpoint,
        tcb: Tcb,
        listener: Arc<ListenerShared>,
    ) -> Arc<Connection> {
        let id = self.alloc_id();
        let conn = Arc::new(Connection {
            id,
            tcb: Mutex::new(tcb),
            call_lock: Mutex::new(()),
            established_key: Some((local_port, peer)),
            listening_port: None,
            listener: Some(listener),
        });
        self.established.insert((local_port, peer), id);
        self.conns.insert(id, conn.clone());
        conn
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.conns.get(&id).cloned()
    }

    fn lookup_established(&self, local_port: u16, peer: Endpoint) -> Option<Arc<Connection>> {
        self.established
            .get(&(local_port, peer))
            .and_then(|id| self.conns.get(id))
            .cloned()
    }

    /// True if `local_port` is already bound by a listener or an
    /// established/pending connection (spec.md §7 `ADDR_IN_USE`).
    pub fn port_in_use(&self, local_port: u16) -> bool {
        self.listening.contains_key(&local_port)
            || self.established.keys().any(|(port, _)| *port == local_port)
    }

    fn lookup_listener(&self, local_port: u16) -> Option<Arc<Connection>> {
        self.listening
            .get(&local_port)
            .and_then(|id| self.conns.get(id))
            .cloned()
    }

    /// Removes a connection that has reached CLOSED from every index.
    pub fn retire(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.remove(&id) {
            if let Some(key) = conn.established_key {
                self.established.remove(&key);
            }
            if let Some(port) = conn.listening_port {
                self.listening.remove(&port);
            }
        }
    }
}

/// Everything the network-reading thread, the housekeeping thread, and the
/// blocking user API (api.rs) all need a handle to.
pub struct Shared {
    pub network: Arc<dyn NetworkEndpoint>,
    pub local_addr: Addr,
    pub registry: Mutex<Registry>,
    pub timers: TimerService,
    pub buffers: Arc<BufferPool>,
    pub config: Arc<Config>,
    /// Fallback target for timers armed with no user call bound to the TCB.
    /// The receiving half lives only in the housekeeping thread's own stack
    /// (see `spawn`) so this struct stays `Send + Sync` for sharing via
    /// `Arc` — a `mpsc::Receiver` is not `Sync`, and a sender clone is all
    /// `apply_effects` ever needs.
    pub housekeeping: MailboxSender,
    housekeeping_rx: Mutex<Option<Mailbox>>,
}

impl Shared {
    pub fn new(network: Arc<dyn NetworkEndpoint>, local_addr: Addr, config: Config) -> Arc<Self> {
        let config = Arc::new(config);
        let buffers = BufferPool::new(config.buffer_pool_size, config.buffer_size);
        let mailbox = Mailbox::new(config.rounded_queue_size());
        let housekeeping = mailbox.sender();
        Arc::new(Self {
            network,
            local_addr,
            registry: Mutex::new(Registry::default()),
            timers: TimerService::new(),
            buffers,
            config,
            housekeeping,
            housekeeping_rx: Mutex::new(Some(mailbox)),
        })
    }

    pub fn new_timers(&self) -> crate::tcb::Timers {
        crate::tcb::Timers {
            retransmit: self.timers.new_handle(),
            probe: self.timers.new_handle(),
            misc: self.timers.new_handle(),
        }
    }

    /// Spawns the reader and housekeeping background threads. Daemon-style:
    /// they run for the lifetime of the `TcpStack` these live in and are
    /// never joined, matching the teacher's always-on segment loop.
    pub fn spawn(self: &Arc<Self>) {
        let reader = self.clone();
        thread::Builder::new()
            .name("tcpcore-reader".into())
            .spawn(move || run_reader(reader))
            .expect("failed to spawn reader thread");

        let housekeeper = self.clone();
        let mailbox = self
            .housekeeping_rx
            .lock()
            .unwrap()
            .take()
            .expect("Shared::spawn called more than once");
        thread::Builder::new()
            .name("tcpcore-housekeeping".into())
            .spawn(move || run_housekeeping(housekeeper, mailbox))
            .expect("failed to spawn housekeeping thread");
    }
}

fn run_reader(shared: Arc<Shared>) {
    loop {
        match shared.network.recv() {
            Some((src, bytes)) => dispatch_inbound(&shared, src, bytes),
            None => return,
        }
    }
}

fn run_housekeeping(shared: Arc<Shared>, mailbox: Mailbox) {
    loop {
        match mailbox.get() {
            MailboxMsg::Timeout(kind, tag) => handle_housekeeping_timeout(&shared, kind, tag),
            MailboxMsg::NotifyUser => {
                // No one is listening on the housekeeping mailbox for
                // progress notifications; only timers land here.
            }
        }
    }
}

pub fn event_for(kind: TimeoutKind) -> Event<'static> {
    match kind {
        TimeoutKind::Retransmit => Event::TimeoutRetransmit,
        TimeoutKind::TimeWait => Event::TimeoutTimeWait,
        TimeoutKind::Connection => Event::TimeoutConnection,
        TimeoutKind::Probe => Event::ProbeTimeout,
        TimeoutKind::UserSpec => Event::UserSpecTimeout,
    }
}

fn handle_housekeeping_timeout(shared: &Arc<Shared>, kind: TimeoutKind, tag: ConnId) {
    let Some(conn) = shared.registry.lock().unwrap().get(tag) else {
        return;
    };
    step_and_apply(shared, &conn, event_for(kind));
}

/// Steps `conn`'s FSM with `event`, applies the resulting effects, and
/// handles the two cross-cutting consequences a step can have: a
/// SYN_RCVD -> ESTABLISHED transition waking an `accept()`, or a
/// transition to CLOSED retiring the connection from the registry.
pub fn step_and_apply(shared: &Arc<Shared>, conn: &Arc<Connection>, event: Event<'_>) -> fsm::Outcome {
    let mut tcb = conn.tcb.lock().unwrap();
    let old_state = tcb.state;
    let fsm::StepResult { outcome, effects } = fsm::step(&mut tcb, event);
    let new_state = tcb.state;
    apply_effects(
        conn.id,
        &mut tcb,
        effects,
        &*shared.network,
        &shared.timers,
        &shared.housekeeping,
    );
    drop(tcb);

    if old_state == State::SynRcvd && new_state == State::Established {
        if let Some(listener) = &conn.listener {
            listener.queue.lock().unwrap().push_back(conn.id);
            listener.cvar.notify_one();
        }
    }
    if new_state == State::Closed && old_state != State::Closed {
        shared.registry.lock().unwrap().retire(conn.id);
    }

    outcome
}

/// Finds (or creates) the connection an inbound segment belongs to and
/// steps its FSM. Segments addressed to nobody get an RST per spec.md §4.5,
/// except RSTs themselves, which are always dropped silently.
fn dispatch_inbound(shared: &Arc<Shared>, src: Endpoint, bytes: Vec<u8>) {
    let pseudo = PseudoHeader {
        src: shared.local_addr,
        dst: src.addr,
    };
    let Some((header, payload)) = codec::decode(&bytes, &pseudo) else {
        return;
    };
    let peer = Endpoint::new(src.addr, header.src_port, src.netif);
    let local_port = header.dst_port;

    let existing = shared.registry.lock().unwrap().lookup_established(local_port, peer);
    if let Some(conn) = existing {
        step_and_apply(shared, &conn, Event::RcvdPkt { header: &header, payload, src: peer });
        return;
    }

    let listener = shared.registry.lock().unwrap().lookup_listener(local_port);
    if let Some(listener_conn) = listener {
        if header.flags.syn && !header.flags.ack {
            spawn_child_from_listener(shared, &listener_conn, &header, payload, peer);
        }
        // Non-SYN segments addressed to a bare listener (stray ACK/FIN/etc
        // with no matching established entry) are silently ignored; a
        // listener never itself steps on a per-segment basis.
        return;
    }

    if !header.flags.rst {
        send_unsolicited_reset(shared, &header, payload, local_port, peer);
    }
}

fn spawn_child_from_listener(
    shared: &Arc<Shared>,
    listener_conn: &Arc<Connection>,
    header: &TcpHeader,
    payload: &[u8],
    peer: Endpoint,
) {
    let (local, config) = {
        let tcb = listener_conn.tcb.lock().unwrap();
        (tcb.local, tcb.config.clone())
    };

    let lease = match shared.buffers.lease() {
        Ok(lease) => lease,
        Err(_) => return, // NO_BUFFER: silently can't accept this SYN, peer will retry
    };

    let timers = crate::tcb::Timers {
        retransmit: shared.timers.new_handle(),
        probe: shared.timers.new_handle(),
        misc: shared.timers.new_handle(),
    };
    let mut child = Tcb::new(local, config, timers);
    child.passive = true;
    child.state = State::Listen;
    child.recv_buf = Some(lease);

    let result = fsm::step(&mut child, Event::RcvdPkt { header, payload, src: peer });
    if child.peer != Some(peer) {
        // The listener rejected the SYN (e.g. it carried an ACK); nothing
        // to register.
        return;
    }

    let listener = listener_conn.listener.clone().expect("listener connections always carry one");
    let mut registry = shared.registry.lock().unwrap();
    let local_port = local.port;
    let conn = registry.insert_child(local_port, peer, child, listener);
    drop(registry);

    let mut tcb = conn.tcb.lock().unwrap();
    apply_effects(
        conn.id,
        &mut tcb,
        result.effects,
        &*shared.network,
        &shared.timers,
        &shared.housekeeping,
    );
}

fn send_unsolicited_reset(
    shared: &Arc<Shared>,
    header: &TcpHeader,
    payload: &[u8],
    local_port: u16,
    peer: Endpoint,
) {
    use crate::codec::{encode, Flags};
    let mut hdr = TcpHeader::new(local_port, header.src_port, 0, 0);
    if header.flags.ack {
        hdr.seq = header.ack;
        hdr.flags = Flags::rst_only();
    } else {
        hdr.ack = header
            .seq
            .wrapping_add(payload.len() as u32)
            .wrapping_add(header.flags.syn as u32)
            .wrapping_add(header.flags.fin as u32);
        hdr.flags = Flags {
            rst: true,
            ack: true,
            ..Default::default()
        };
    }
    let pseudo = PseudoHeader {
        src: shared.local_addr,
        dst: peer.addr,
    };
    let bytes = encode(&hdr, &[], &pseudo);
    let _ = shared.network.send(peer, &bytes);
}
