//! The blocking user API (spec.md §4.6): `TcpStack` (the supplementary
//! "stack handle" every caller constructs TCBs against, grounded on the
//! teacher's `NetStack`), and the `TcpStream`/`TcpListener` connected
//! handles with `Read`/`Write` impls matching the teacher's own.
//!
//! Every blocking call here follows the same seven-step pattern: acquire
//! the function lock, bind a mailbox, arm the connection-idle (or
//! user-specified) timeout, invoke the FSM, loop on the mailbox until a
//! result or error, unbind and cancel timers, release the lock.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::address::{Addr, Endpoint};
use crate::config::Config;
use crate::error::{Result, TcpError};
use crate::event_loop::{event_for, step_and_apply, Connection, Shared};
use crate::fsm::{Event, Outcome};
use crate::mailbox::{Mailbox, MailboxMsg, TimeoutKind};
use crate::net::NetworkEndpoint;
use crate::tcb::{State, Tcb};

/// Owns the connection registry, receive-buffer pool, timer service, and
/// the event-loop/housekeeping threads. One per embedded node; every
/// `connect`/`listen` call constructs its TCB against this handle.
pub struct TcpStack {
    shared: Arc<Shared>,
}

impl TcpStack {
    pub fn new(network: Arc<dyn NetworkEndpoint>, local_addr: Addr, config: Config) -> Arc<Self> {
        let shared = Shared::new(network, local_addr, config);
        shared.spawn();
        Arc::new(Self { shared })
    }

    /// Active open (spec.md §4.4 "CLOSED + CALL_OPEN (active)"). Blocks
    /// until ESTABLISHED or an error (`CONN_REFUSED`, `TIMED_OUT`, ...).
    pub fn connect(self: &Arc<Self>, local_port: u16, peer: Endpoint) -> Result<TcpStream> {
        if self.shared.registry.lock().unwrap().port_in_use(local_port) {
            return Err(TcpError::AddrInUse);
        }
        let lease = self.shared.buffers.lease()?;
        let timers = self.shared.new_timers();
        let local = Endpoint::new(self.shared.local_addr, local_port, 0);
        let mut tcb = Tcb::new(local, self.shared.config.clone(), timers);
        tcb.peer = Some(peer);
        tcb.recv_buf = Some(lease);

        let conn = self
            .shared
            .registry
            .lock()
            .unwrap()
            .insert_active(local_port, peer, tcb);
        let _call_guard = conn.call_lock.lock().unwrap();

        let mbox = Mailbox::new(self.shared.config.rounded_queue_size());
        bind_mailbox(&conn, mbox.sender());

        let result = match step_and_apply(&self.shared, &conn, Event::CallOpen { active: true }) {
            Outcome::Error(e) => Err(e),
            _ => self.wait_for_open(&conn, &mbox),
        };

        unbind_mailbox(&conn);
        if result.is_err() {
            self.shared.registry.lock().unwrap().retire(conn.id);
        }
        result.map(|()| TcpStream {
            stack: self.clone(),
            conn,
        })
    }

    fn wait_for_open(&self, conn: &Arc<Connection>, mbox: &Mailbox) -> Result<()> {
        loop {
            match mbox.get() {
                MailboxMsg::NotifyUser => {
                    let tcb = conn.tcb.lock().unwrap();
                    match tcb.state {
                        State::Established => return Ok(()),
                        State::Closed => return Err(tcb.last_error.unwrap_or(TcpError::ConnAborted)),
                        _ => continue,
                    }
                }
                MailboxMsg::Timeout(kind, _tag) => {
                    if let Outcome::Error(e) = step_and_apply(&self.shared, conn, event_for(kind)) {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Passive open (spec.md §4.4 "CLOSED + CALL_OPEN (passive)"). Never
    /// blocks: a listener just records the bind and waits for children via
    /// `TcpListener::accept`.
    pub fn listen(self: &Arc<Self>, local_port: u16) -> Result<TcpListener> {
        if self.shared.registry.lock().unwrap().port_in_use(local_port) {
            return Err(TcpError::AddrInUse);
        }
        let timers = self.shared.new_timers();
        let local = Endpoint::new(self.shared.local_addr, local_port, 0);
        let mut tcb = Tcb::new(local, self.shared.config.clone(), timers);
        let _ = crate::fsm::step(&mut tcb, Event::CallOpen { active: false });

        let conn = self
            .shared
            .registry
            .lock()
            .unwrap()
            .insert_listener(local_port, tcb);
        Ok(TcpListener {
            stack: self.clone(),
            conn,
        })
    }
}

fn bind_mailbox(conn: &Connection, sender: crate::mailbox::MailboxSender) {
    conn.tcb.lock().unwrap().mailbox = Some(sender);
}

fn unbind_mailbox(conn: &Connection) {
    let mut tcb = conn.tcb.lock().unwrap();
    tcb.mailbox = None;
}

fn cancel_call_timers(shared: &Shared, conn: &Connection) {
    let tcb = conn.tcb.lock().unwrap();
    shared.timers.cancel(tcb.timers.misc);
    shared.timers.cancel(tcb.timers.probe);
}

/// A bound connection: the FSM's ESTABLISHED (and beyond) lifetime, with
/// blocking `send`/`recv`/`close`/`abort` and `std::io::Read`/`Write` impls.
pub struct TcpStream {
    stack: Arc<TcpStack>,
    conn: Arc<Connection>,
}

impl TcpStream {
    /// Blocks until all of `buf` is handed to the FSM (looping through
    /// zero-window probing as needed), a full ACK clears the retransmit
    /// snapshot, or an error occurs (spec.md §4.6 "Send details": "The call
    /// returns only after the retransmit snapshot is cleared ... or an
    /// error occurs").
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        let shared = &self.stack.shared;
        let _call_guard = self.conn.call_lock.lock().unwrap();
        let mbox = Mailbox::new(shared.config.rounded_queue_size());
        bind_mailbox(&self.conn, mbox.sender());
        self.arm_connection_timeout(&mbox);

        let mut probe_interval = Duration::from_millis(shared.config.probe_lower_bound_ms);
        let accepted = loop {
            match step_and_apply(shared, &self.conn, Event::CallSend { buf }) {
                Outcome::Error(e) => break Err(e),
                Outcome::Accepted(0) => {
                    let window_open = self.conn.tcb.lock().unwrap().snd.wnd != 0;
                    if window_open {
                        continue;
                    }
                    self.arm_probe(&mbox, probe_interval);
                    match mbox.get() {
                        MailboxMsg::NotifyUser => continue,
                        MailboxMsg::Timeout(TimeoutKind::Probe, _) => {
                            step_and_apply(shared, &self.conn, Event::ProbeTimeout);
                            probe_interval = (probe_interval * 2)
                                .min(Duration::from_millis(shared.config.probe_upper_bound_ms));
                        }
                        MailboxMsg::Timeout(kind, _) => {
                            if let Outcome::Error(e) = step_and_apply(shared, &self.conn, event_for(kind)) {
                                break Err(e);
                            }
                        }
                    }
                }
                Outcome::Accepted(n) => break Ok(n),
                Outcome::None | Outcome::Delivered(_) => break Ok(0),
            }
        };

        // The FSM has queued and sent the segment; now wait for the ACK
        // that clears `tcb.retransmit` before handing control back, so a
        // second `send` can't overwrite a still-unacked snapshot out from
        // under a lost segment.
        let result = match accepted {
            Ok(n) if n > 0 => loop {
                if self.conn.tcb.lock().unwrap().retransmit.is_none() {
                    break Ok(n);
                }
                match mbox.get() {
                    MailboxMsg::NotifyUser => continue,
                    MailboxMsg::Timeout(kind, _) => {
                        if let Outcome::Error(e) = step_and_apply(shared, &self.conn, event_for(kind)) {
                            break Err(e);
                        }
                    }
                }
            },
            other => other,
        };

        cancel_call_timers(shared, &self.conn);
        unbind_mailbox(&self.conn);
        result
    }

    /// `timeout_ms` mirrors spec.md §4.6: `Some(0)` is non-blocking
    /// (`WOULD_BLOCK` if nothing buffered), `None` uses the ambient
    /// connection-idle timeout, `Some(ms)` overrides it for this call only.
    pub fn recv(&self, buf: &mut [u8], timeout_ms: Option<u64>) -> Result<usize> {
        let shared = &self.stack.shared;
        let _call_guard = self.conn.call_lock.lock().unwrap();

        if timeout_ms == Some(0) {
            return match step_and_apply(shared, &self.conn, Event::CallRecv { buf }) {
                Outcome::Error(e) => Err(e),
                Outcome::Delivered(0) if !self.is_eof() => Err(TcpError::WouldBlock),
                Outcome::Delivered(n) => Ok(n),
                _ => Ok(0),
            };
        }

        let mbox = Mailbox::new(shared.config.rounded_queue_size());
        bind_mailbox(&self.conn, mbox.sender());
        match timeout_ms {
            Some(ms) => self.arm_misc(&mbox, Duration::from_millis(ms), TimeoutKind::UserSpec),
            None => self.arm_connection_timeout(&mbox),
        }

        let result = loop {
            match step_and_apply(shared, &self.conn, Event::CallRecv { buf: &mut *buf }) {
                Outcome::Error(e) => break Err(e),
                Outcome::Delivered(0) => {
                    if self.is_eof() {
                        break Ok(0);
                    }
                    match mbox.get() {
                        MailboxMsg::NotifyUser => continue,
                        MailboxMsg::Timeout(kind, _) => {
                            match step_and_apply(shared, &self.conn, event_for(kind)) {
                                Outcome::Error(e) => break Err(e),
                                _ => continue,
                            }
                        }
                    }
                }
                Outcome::Delivered(n) => break Ok(n),
                Outcome::None | Outcome::Accepted(_) => break Ok(0),
            }
        };

        cancel_call_timers(shared, &self.conn);
        unbind_mailbox(&self.conn);
        result
    }

    fn is_eof(&self) -> bool {
        matches!(
            self.conn.tcb.lock().unwrap().state,
            State::CloseWait | State::Closing | State::LastAck | State::TimeWait | State::Closed
        )
    }

    /// Graceful close (spec.md §4.4 "Close"). Blocks through FIN_WAIT_2 /
    /// TIME_WAIT or CLOSE_WAIT / LAST_ACK until CLOSED.
    pub fn close(&self) -> Result<()> {
        let shared = &self.stack.shared;
        let _call_guard = self.conn.call_lock.lock().unwrap();
        let mbox = Mailbox::new(shared.config.rounded_queue_size());
        bind_mailbox(&self.conn, mbox.sender());
        self.arm_connection_timeout(&mbox);

        let result = match step_and_apply(shared, &self.conn, Event::CallClose) {
            Outcome::Error(e) => Err(e),
            _ => loop {
                if self.conn.tcb.lock().unwrap().state == State::Closed {
                    break Ok(());
                }
                match mbox.get() {
                    MailboxMsg::NotifyUser => continue,
                    MailboxMsg::Timeout(kind, _) => {
                        match step_and_apply(shared, &self.conn, event_for(kind)) {
                            Outcome::Error(e) => break Err(e),
                            _ => continue,
                        }
                    }
                }
            },
        };

        cancel_call_timers(shared, &self.conn);
        unbind_mailbox(&self.conn);
        if self.conn.tcb.lock().unwrap().state == State::Closed {
            shared.registry.lock().unwrap().retire(self.conn.id);
        }
        result
    }

    /// Abortive close (spec.md §4.4 "Any state + CALL_ABORT"). Synchronous:
    /// emits RST if the peer is known and transitions straight to CLOSED.
    pub fn abort(&self) {
        let shared = &self.stack.shared;
        let _call_guard = self.conn.call_lock.lock().unwrap();
        step_and_apply(shared, &self.conn, Event::CallAbort);
        shared.registry.lock().unwrap().retire(self.conn.id);
    }

    fn arm_connection_timeout(&self, mbox: &Mailbox) {
        let ms = self.stack.shared.config.connection_timeout_ms;
        self.arm_misc(mbox, Duration::from_millis(ms), TimeoutKind::Connection);
    }

    fn arm_misc(&self, mbox: &Mailbox, duration: Duration, kind: TimeoutKind) {
        let tcb = self.conn.tcb.lock().unwrap();
        self.stack
            .shared
            .timers
            .schedule(tcb.timers.misc, duration, kind, self.conn.id, mbox.sender());
    }

    fn arm_probe(&self, mbox: &Mailbox, duration: Duration) {
        let tcb = self.conn.tcb.lock().unwrap();
        self.stack.shared.timers.schedule(
            tcb.timers.probe,
            duration,
            TimeoutKind::Probe,
            self.conn.id,
            mbox.sender(),
        );
    }
}

impl io::Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf, None).map_err(to_io_error)
    }
}

impl io::Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf).map_err(to_io_error)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn to_io_error(e: TcpError) -> io::Error {
    let kind = match e {
        TcpError::WouldBlock => io::ErrorKind::WouldBlock,
        TcpError::TimedOut => io::ErrorKind::TimedOut,
        TcpError::ConnReset => io::ErrorKind::ConnectionReset,
        TcpError::ConnRefused => io::ErrorKind::ConnectionRefused,
        TcpError::ConnAborted => io::ErrorKind::ConnectionAborted,
        TcpError::NotConnected => io::ErrorKind::NotConnected,
        TcpError::AddrInUse => io::ErrorKind::AddrInUse,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, e)
}

/// A bound listening socket. Handshakes completed by the event loop land on
/// an internal accept queue, woken by a `Condvar`.
pub struct TcpListener {
    stack: Arc<TcpStack>,
    conn: Arc<Connection>,
}

impl TcpListener {
    pub fn accept(&self) -> Result<TcpStream> {
        let listener = self
            .conn
            .listener
            .clone()
            .expect("listener connections always carry a ListenerShared");

        let id = {
            let mut queue = listener.queue.lock().unwrap();
            loop {
                if let Some(id) = queue.pop_front() {
                    break id;
                }
                queue = listener.cvar.wait(queue).unwrap();
            }
        };

        let conn = self
            .stack
            .shared
            .registry
            .lock()
            .unwrap()
            .get(id)
            .ok_or(TcpError::ConnAborted)?;
        Ok(TcpStream {
            stack: self.stack.clone(),
            conn,
        })
    }
}
