//! Fixed-count ring of receive buffers, leased to TCBs on open and
//! returned on close (spec.md §2, §3 "Receive-buffer lease").

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::TcpError;

/// A single connection's receive buffer: a wrap-aware ring of bytes with a
/// fixed capacity. Built directly on `VecDeque`, which already is a ring
/// buffer, matching the teacher's choice for its `incoming` field.
#[derive(Debug)]
pub struct RecvRing {
    data: VecDeque<u8>,
    capacity: usize,
}

impl RecvRing {
    fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free bytes in the ring; this is RCV.WND per invariant 4.
    pub fn free(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends `bytes`, truncating silently at capacity (the FSM never
    /// offers more than the advertised window, so this is a safety clamp,
    /// not the common path).
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free());
        self.data.extend(bytes[..n].iter().copied());
        n
    }

    /// Copies up to `buf.len()` bytes out, removing them from the ring.
    pub fn pop_into(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.data.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.data.pop_front().unwrap();
        }
        n
    }

    fn clear(&mut self) {
        self.data.clear();
    }
}

struct PoolState {
    slots: Vec<Option<RecvRing>>,
}

/// A fixed-capacity pool of receive-buffer slots. `capacity` is set once at
/// construction (the spec's "compile-time" pool size, modeled here as a
/// constructor argument since dynamic TCB allocation is the only thing
/// ruled out, not a configurable pool size).
pub struct BufferPool {
    state: Mutex<PoolState>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Arc<Self> {
        let slots = (0..capacity)
            .map(|_| Some(RecvRing::new(buffer_size)))
            .collect();
        Arc::new(Self {
            state: Mutex::new(PoolState { slots }),
            buffer_size,
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Leases a free slot, or `NO_BUFFER` if the pool is exhausted.
    pub fn lease(self: &Arc<Self>) -> Result<BufferLease, TcpError> {
        let mut state = self.state.lock().unwrap();
        let index = state
            .slots
            .iter()
            .position(|slot| slot.is_some())
            .ok_or(TcpError::NoBuffer)?;
        let ring = state.slots[index].take().unwrap();
        Ok(BufferLease {
            pool: self.clone(),
            index,
            ring: Some(ring),
        })
    }
}

/// An owned lease on one pool slot. Releases the slot back to the pool when
/// dropped (invariant 6: CLOSED releases the lease).
pub struct BufferLease {
    pool: Arc<BufferPool>,
    index: usize,
    ring: Option<RecvRing>,
}

impl BufferLease {
    pub fn ring(&self) -> &RecvRing {
        self.ring.as_ref().expect("ring present while leased")
    }

    pub fn ring_mut(&mut self) -> &mut RecvRing {
        self.ring.as_mut().expect("ring present while leased")
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(mut ring) = self.ring.take() {
            ring.clear();
            let mut state = self.pool.state.lock().unwrap();
            state.slots[self.index] = Some(ring);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_and_release_recycles_slot() {
        let pool = BufferPool::new(1, 64);
        let lease = pool.lease().unwrap();
        assert!(pool.lease().is_err());
        drop(lease);
        assert!(pool.lease().is_ok());
    }

    #[test]
    fn free_tracks_occupancy() {
        let pool = BufferPool::new(1, 16);
        let mut lease = pool.lease().unwrap();
        assert_eq!(lease.ring().free(), 16);
        lease.ring_mut().push(b"hello");
        assert_eq!(lease.ring().free(), 11);
        let mut out = [0u8; 5];
        lease.ring_mut().pop_into(&mut out);
        assert_eq!(&out, b"hello");
        assert_eq!(lease.ring().free(), 16);
    }
}
