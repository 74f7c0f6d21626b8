//! Bounded FIFO of typed messages (spec.md §4.2).
//!
//! The source couples mailbox and TCB through raw back-pointers; per the
//! Design Notes we instead hand out a cheap, cloneable [`MailboxSender`]
//! that the TCB borrows only for the lifetime of one user call, and keep
//! the receiving half private to the caller that owns the blocking loop.
//! Built on `std::sync::mpsc::sync_channel`, which already implements
//! exactly the "blocking get / non-blocking put that fails when full"
//! contract spec.md asks for.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;

/// A message delivered to a connection's private mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxMsg {
    /// The FSM made user-visible progress (state change, data arrival, ...).
    NotifyUser,
    /// A timer this TCB armed has fired. The `u64` is the connection id the
    /// timer was scheduled for — only meaningful to the stack's shared
    /// housekeeping mailbox, which multiplexes timers for every TCB with no
    /// user call currently blocked; a per-call mailbox ignores it.
    Timeout(TimeoutKind, u64),
}

/// Which armed timer produced a [`MailboxMsg::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Retransmit,
    TimeWait,
    Connection,
    Probe,
    UserSpec,
}

/// The receiving half of a mailbox, owned by the task performing the
/// blocking user call.
pub struct Mailbox {
    rx: Receiver<MailboxMsg>,
    tx: MailboxSender,
}

/// A cheap, cloneable handle used to post to a mailbox. This is the handle
/// bound into a TCB for the duration of one user call (invariant 2).
#[derive(Clone)]
pub struct MailboxSender {
    tx: SyncSender<MailboxMsg>,
}

impl Mailbox {
    /// Creates a mailbox with the given capacity (already rounded to a
    /// power of two by the caller, per [`crate::config::Config`]).
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        Self {
            rx,
            tx: MailboxSender { tx },
        }
    }

    /// A sender bound to this mailbox, handed to the FSM for the duration
    /// of the call.
    pub fn sender(&self) -> MailboxSender {
        self.tx.clone()
    }

    /// Blocks until a message is available.
    pub fn get(&self) -> MailboxMsg {
        // The sender side never fully disconnects while `self` is alive
        // (we always keep one clone in `self.tx`), so `recv` cannot fail.
        self.rx.recv().expect("mailbox sender half never drops")
    }

    /// Blocks until a message is available or `timeout` elapses.
    pub fn get_timeout(&self, timeout: Duration) -> Option<MailboxMsg> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => unreachable!("sender half never drops"),
        }
    }

    /// Drains any stale messages left over from a previous call.
    pub fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

impl MailboxSender {
    /// Non-blocking put. A full mailbox is a lost notification, per
    /// spec.md §4.2/§7: the FSM proceeds as if the post had succeeded and
    /// the user will re-poll on its next wakeup.
    pub fn put(&self, msg: MailboxMsg) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::debug!("mailbox full, dropping {msg:?}");
            }
            Err(TrySendError::Disconnected(_)) => {
                // The owning call has already returned and dropped its
                // receiver; nothing left to notify.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let mbox = Mailbox::new(4);
        mbox.sender().put(MailboxMsg::NotifyUser);
        assert_eq!(mbox.get(), MailboxMsg::NotifyUser);
    }

    #[test]
    fn full_mailbox_drops_silently() {
        let mbox = Mailbox::new(1);
        let sender = mbox.sender();
        sender.put(MailboxMsg::NotifyUser);
        // Second put should be silently dropped, not panic or block.
        sender.put(MailboxMsg::Timeout(TimeoutKind::Retransmit, 0));
        assert_eq!(mbox.get(), MailboxMsg::NotifyUser);
    }

    #[test]
    fn get_timeout_returns_none_when_empty() {
        let mbox = Mailbox::new(4);
        assert_eq!(mbox.get_timeout(Duration::from_millis(10)), None);
    }
}
