//! The transmission control block: the sole stateful entity of a connection
//! (spec.md §3). Pure data plus the sequence-arithmetic helpers the FSM
//! needs; state transitions themselves live in [`crate::fsm`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::address::Endpoint;
use crate::buffer_pool::BufferLease;
use crate::config::Config;
use crate::mailbox::MailboxSender;
use crate::timer::TimerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
}

impl State {
    pub fn is_synchronized(self) -> bool {
        matches!(
            self,
            State::Established
                | State::FinWait1
                | State::FinWait2
                | State::CloseWait
                | State::Closing
                | State::LastAck
                | State::TimeWait
        )
    }
}

/// RFC 9293 §3.3.1 fig. 3: the send sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendSeq {
    pub una: u32,
    pub nxt: u32,
    pub wnd: u16,
    pub iss: u32,
    pub wl1: u32,
    pub wl2: u32,
}

/// RFC 9293 §3.3.1 fig. 4: the receive sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecvSeq {
    pub nxt: u32,
    pub wnd: u16,
    pub irs: u32,
}

/// SRTT/RTTVAR/RTO per RFC 6298, uninitialized until the first measurement.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    srtt: Option<Duration>,
    rttvar: Option<Duration>,
    pub rto: Duration,
}

impl Timing {
    pub fn initial(config: &Config) -> Self {
        Self {
            srtt: None,
            rttvar: None,
            rto: Duration::from_millis(config.rto_initial_ms),
        }
    }

    /// RFC 6298 §2.3/2.4: fold a fresh RTT sample `r` into SRTT/RTTVAR and
    /// recompute RTO, clamped to `[RTO_MIN, RTO_MAX]`.
    pub fn on_measurement(&mut self, r: Duration, config: &Config) {
        match (self.srtt, self.rttvar) {
            (None, _) => {
                self.srtt = Some(r);
                self.rttvar = Some(r / 2);
            }
            (Some(srtt), Some(rttvar)) => {
                let diff = if srtt > r { srtt - r } else { r - srtt };
                self.rttvar = Some(rttvar.mul_f64(0.75) + diff.mul_f64(0.25));
                self.srtt = Some(srtt.mul_f64(0.875) + r.mul_f64(0.125));
            }
            (Some(_), None) => unreachable!("rttvar always set alongside srtt"),
        }
        let srtt = self.srtt.unwrap();
        let rttvar = self.rttvar.unwrap();
        let g = Duration::from_millis(1);
        self.rto = clamp(
            srtt + std::cmp::max(g, rttvar * 4),
            Duration::from_millis(config.rto_min_ms),
            Duration::from_millis(config.rto_max_ms),
        );
    }

    /// RFC 6298 §5.5: exponential backoff on retransmission.
    pub fn on_backoff(&mut self, config: &Config) {
        self.rto = clamp(
            self.rto * 2,
            Duration::from_millis(config.rto_min_ms),
            Duration::from_millis(config.rto_max_ms),
        );
    }
}

fn clamp(v: Duration, lo: Duration, hi: Duration) -> Duration {
    v.max(lo).min(hi)
}

/// At most one outstanding segment snapshot (invariant 3). `fin` records
/// whether the snapshot's final byte was a FIN rather than data, so the
/// retransmission carries the same flag.
#[derive(Debug, Clone)]
pub struct RetransmitSnapshot {
    pub seq: u32,
    pub syn: bool,
    pub data: Vec<u8>,
    pub fin: bool,
    pub sent_at: Instant,
    pub retries: u32,
}

impl RetransmitSnapshot {
    /// Sequence number one past the last byte (or SYN/FIN) this snapshot
    /// covers.
    pub fn end(&self) -> u32 {
        self.seq
            .wrapping_add(self.syn as u32)
            .wrapping_add(self.data.len() as u32)
            .wrapping_add(self.fin as u32)
    }
}

/// The three timer roles a TCB needs. `misc` is the spec's single reusable
/// "misc" slot, shared by the connection-timeout and TIME_WAIT roles since
/// they are never armed at once; retransmit and probe get their own slots
/// because either can be armed concurrently with `misc`.
#[derive(Debug, Clone, Copy)]
pub struct Timers {
    pub retransmit: TimerHandle,
    pub probe: TimerHandle,
    pub misc: TimerHandle,
}

/// The per-connection record. Owned by the caller (no dynamic TCB
/// allocation, per spec.md Non-goals); the event loop and user API share it
/// behind `Arc<Mutex<Tcb>>`, which doubles as the FSM lock of invariant 1.
pub struct Tcb {
    pub state: State,
    pub passive: bool,
    pub allow_any_addr: bool,

    pub local: Endpoint,
    pub peer: Option<Endpoint>,

    pub snd: SendSeq,
    pub rcv: RecvSeq,
    pub timing: Timing,

    pub recv_buf: Option<BufferLease>,
    pub retransmit: Option<RetransmitSnapshot>,

    pub mailbox: Option<MailboxSender>,
    pub timers: Timers,

    pub mss: u16,
    pub config: Arc<Config>,

    /// The error a terminal `step` produced, for a blocking call that only
    /// learns of the transition via `NOTIFY_USER` (the step itself may have
    /// run on the event-loop thread, not the caller's) to recover *why* the
    /// connection closed.
    pub last_error: Option<crate::error::TcpError>,
}

impl Tcb {
    pub fn new(local: Endpoint, config: Arc<Config>, timers: Timers) -> Self {
        let timing = Timing::initial(&config);
        let mss = config.mss_default;
        Self {
            state: State::Closed,
            passive: false,
            allow_any_addr: local.is_unspecified_addr(),
            local,
            peer: None,
            snd: SendSeq::default(),
            rcv: RecvSeq::default(),
            timing,
            recv_buf: None,
            retransmit: None,
            mailbox: None,
            timers,
            mss,
            config,
            last_error: None,
        }
    }

    /// RCV.WND must always equal free bytes in the receive buffer
    /// (invariant 4).
    pub fn recv_window(&self) -> u16 {
        self.recv_buf
            .as_ref()
            .map(|b| b.ring().free().min(u16::MAX as usize) as u16)
            .unwrap_or(0)
    }
}

/// RFC 1323's modular "less than": true iff `lhs` precedes `rhs` on the
/// sequence-number circle, using the standard 2^31 split.
pub fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    lhs.wrapping_sub(rhs) > (1 << 31)
}

/// True iff `x` lies strictly between `start` and `end` going forward on
/// the sequence circle (RFC 793's `is_between_wrapped`, as in the teacher).
pub fn is_between_wrapped(start: u32, x: u32, end: u32) -> bool {
    wrapping_lt(start, x) && wrapping_lt(x, end)
}

/// The four-case acceptability test of RFC 793 §3.3 / spec.md §4.4.
pub fn is_segment_acceptable(rcv_nxt: u32, rcv_wnd: u16, seg_seq: u32, seg_len: u32) -> bool {
    let wnd = rcv_wnd as u32;
    match (seg_len, wnd) {
        (0, 0) => seg_seq == rcv_nxt,
        (0, w) if w > 0 => is_between_wrapped(
            rcv_nxt.wrapping_sub(1),
            seg_seq,
            rcv_nxt.wrapping_add(w),
        ),
        (_, 0) => false,
        (len, w) => {
            is_between_wrapped(rcv_nxt.wrapping_sub(1), seg_seq, rcv_nxt.wrapping_add(w))
                || is_between_wrapped(
                    rcv_nxt.wrapping_sub(1),
                    seg_seq.wrapping_add(len).wrapping_sub(1),
                    rcv_nxt.wrapping_add(w),
                )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_lt_handles_wraparound() {
        assert!(wrapping_lt(u32::MAX, 0));
        assert!(!wrapping_lt(0, u32::MAX));
        assert!(wrapping_lt(10, 20));
        assert!(!wrapping_lt(20, 10));
    }

    #[test]
    fn sequence_comparison_is_correct_across_wraparound() {
        // Property 5: for random base b and offset d in [-2^31, 2^31),
        // is_between_wrapped(b, b+d, b+2^31) == (d in [0, 2^31)).
        let mut state: u64 = 0x2545F4914F6CDD1D;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };
        for _ in 0..10_000 {
            let b = (next() & 0xFFFF_FFFF) as u32;
            let d = (next() & 0xFFFF_FFFF) as i64 - (1i64 << 31);
            let x = b.wrapping_add(d as i32 as u32);
            let end = b.wrapping_add(1 << 31);
            let expected = d >= 0;
            assert_eq!(
                is_between_wrapped(b, x, end),
                expected,
                "b={b} d={d}"
            );
        }
    }

    #[test]
    fn acceptability_empty_segment_closed_window() {
        assert!(is_segment_acceptable(100, 0, 100, 0));
        assert!(!is_segment_acceptable(100, 0, 101, 0));
    }

    #[test]
    fn acceptability_empty_segment_open_window() {
        assert!(is_segment_acceptable(100, 50, 120, 0));
        assert!(!is_segment_acceptable(100, 50, 200, 0));
    }

    #[test]
    fn acceptability_data_segment_requires_open_window() {
        assert!(!is_segment_acceptable(100, 0, 100, 10));
        assert!(is_segment_acceptable(100, 50, 100, 10));
        assert!(!is_segment_acceptable(100, 50, 200, 10));
    }
}
