//! Single process-wide timer scheduler (spec.md §4.1).
//!
//! A min-heap of scheduled events ordered by absolute wakeup time, driven
//! by one background thread. Per the Design Notes, a [`TimerHandle`] is a
//! plain value (an opaque id) owned by the TCB — never a pointer back into
//! the TCB or the service — so rescheduling is just cancel + insert under
//! the same id, with no reallocation.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::mailbox::{MailboxSender, TimeoutKind};

/// A reusable, cancel-and-reschedule-able timer slot. Holds no reference to
/// the scheduler or the TCB; it is just an id plus whether it is currently
/// armed with the service that last scheduled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    id: u64,
}

struct Entry {
    wakeup: Instant,
    id: u64,
    generation: u64,
    kind: TimeoutKind,
    tag: u64,
    target: MailboxSender,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.wakeup == other.wakeup
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.wakeup.cmp(&other.wakeup)
    }
}

struct Inner {
    heap: BinaryHeap<Reverse<Entry>>,
    /// Current generation per live id. A heap entry is stale (already
    /// cancelled or superseded by a reschedule) if its generation doesn't
    /// match the map; it is then just dropped when popped.
    generations: HashMap<u64, u64>,
    next_id: u64,
    shutdown: bool,
}

/// The shared scheduler. Cheap to clone (wraps an `Arc`); intended to be
/// constructed once per [`crate::TcpStack`] and shared by every TCB.
#[derive(Clone)]
pub struct TimerService {
    inner: Arc<Mutex<Inner>>,
    condvar: Arc<Condvar>,
}

impl TimerService {
    pub fn new() -> Self {
        let service = Self {
            inner: Arc::new(Mutex::new(Inner {
                heap: BinaryHeap::new(),
                generations: HashMap::new(),
                next_id: 1,
                shutdown: false,
            })),
            condvar: Arc::new(Condvar::new()),
        };
        service.spawn_driver();
        service
    }

    /// Allocates a fresh, unarmed handle. The TCB stores this by value for
    /// the lifetime of the connection and reuses it across the
    /// connection-timeout and TIME_WAIT timers (§3 "Timer slot").
    pub fn new_handle(&self) -> TimerHandle {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.generations.insert(id, 0);
        TimerHandle { id }
    }

    /// Arms (or rearms) `handle` to fire after `offset` with `kind`, posting
    /// to `target` when it does. Equivalent to cancel + add without
    /// reallocating the handle.
    pub fn schedule(
        &self,
        handle: TimerHandle,
        offset: Duration,
        kind: TimeoutKind,
        tag: u64,
        target: MailboxSender,
    ) {
        let wakeup = Instant::now() + offset;
        let mut inner = self.inner.lock().unwrap();
        let generation = inner.generations.entry(handle.id).or_insert(0);
        *generation += 1;
        let generation = *generation;
        let is_new_head = inner
            .heap
            .peek()
            .map(|Reverse(e)| wakeup < e.wakeup)
            .unwrap_or(true);
        inner.heap.push(Reverse(Entry {
            wakeup,
            id: handle.id,
            generation,
            kind,
            tag,
            target,
        }));
        drop(inner);
        if is_new_head {
            self.condvar.notify_one();
        }
    }

    /// Cancels `handle` if scheduled. A no-op if it isn't.
    pub fn cancel(&self, handle: TimerHandle) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(generation) = inner.generations.get_mut(&handle.id) {
            *generation += 1;
        }
    }

    fn spawn_driver(&self) {
        let inner = self.inner.clone();
        let condvar = self.condvar.clone();
        thread::Builder::new()
            .name("tcpcore-timer".into())
            .spawn(move || Self::drive(inner, condvar))
            .expect("failed to spawn timer driver thread");
    }

    fn drive(inner: Arc<Mutex<Inner>>, condvar: Arc<Condvar>) {
        let mut guard = inner.lock().unwrap();
        loop {
            if guard.shutdown {
                return;
            }

            // Drop stale (cancelled/superseded) entries from the head.
            while let Some(Reverse(top)) = guard.heap.peek() {
                let current = guard.generations.get(&top.id).copied().unwrap_or(0);
                if top.generation != current {
                    guard.heap.pop();
                } else {
                    break;
                }
            }

            match guard.heap.peek() {
                None => {
                    guard = condvar.wait(guard).unwrap();
                }
                Some(Reverse(top)) => {
                    let now = Instant::now();
                    if top.wakeup <= now {
                        let Reverse(entry) = guard.heap.pop().unwrap();
                        let target = entry.target.clone();
                        let kind = entry.kind;
                        let tag = entry.tag;
                        drop(guard);
                        target.put(crate::mailbox::MailboxMsg::Timeout(kind, tag));
                        guard = inner.lock().unwrap();
                    } else {
                        let (g, _) = condvar
                            .wait_timeout(guard, top.wakeup - now)
                            .unwrap();
                        guard = g;
                    }
                }
            }
        }
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{Mailbox, MailboxMsg};

    #[test]
    fn fires_after_offset() {
        let service = TimerService::new();
        let mbox = Mailbox::new(4);
        let handle = service.new_handle();
        service.schedule(
            handle,
            Duration::from_millis(20),
            TimeoutKind::Retransmit,
            0,
            mbox.sender(),
        );
        let msg = mbox.get_timeout(Duration::from_secs(1));
        assert_eq!(msg, Some(MailboxMsg::Timeout(TimeoutKind::Retransmit, 0)));
    }

    #[test]
    fn cancel_prevents_firing() {
        let service = TimerService::new();
        let mbox = Mailbox::new(4);
        let handle = service.new_handle();
        service.schedule(
            handle,
            Duration::from_millis(20),
            TimeoutKind::Retransmit,
            0,
            mbox.sender(),
        );
        service.cancel(handle);
        assert_eq!(mbox.get_timeout(Duration::from_millis(100)), None);
    }

    #[test]
    fn cancel_on_unscheduled_handle_is_noop() {
        let service = TimerService::new();
        let handle = service.new_handle();
        service.cancel(handle); // must not panic
    }

    #[test]
    fn reschedule_reuses_handle_without_firing_old_deadline() {
        let service = TimerService::new();
        let mbox = Mailbox::new(4);
        let handle = service.new_handle();
        service.schedule(
            handle,
            Duration::from_millis(10),
            TimeoutKind::Probe,
            0,
            mbox.sender(),
        );
        // Reschedule further out before the first fires.
        service.schedule(
            handle,
            Duration::from_millis(100),
            TimeoutKind::Retransmit,
            0,
            mbox.sender(),
        );
        let msg = mbox.get_timeout(Duration::from_millis(200));
        assert_eq!(msg, Some(MailboxMsg::Timeout(TimeoutKind::Retransmit, 0)));
        assert_eq!(mbox.get_timeout(Duration::from_millis(50)), None);
    }
}
