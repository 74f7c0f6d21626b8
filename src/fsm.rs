//! The pure state-transition function (spec.md §4.4): `step(tcb, event) ->
//! (outcome, effects)`. Mutates the TCB directly but never touches the
//! network, timer service, or mailbox itself — those side effects are
//! returned in [`Effects`] for the event loop / user API to carry out,
//! which keeps this module testable without any of the ambient services
//! wired up.

use std::time::Instant;

use rand::Rng;

use crate::address::Endpoint;
use crate::codec::{Flags, TcpHeader, TcpOption};
use crate::error::TcpError;
use crate::tcb::{is_segment_acceptable, is_between_wrapped, RetransmitSnapshot, SendSeq, State, Tcb};

/// Events the FSM can be stepped with (spec.md §4.4).
pub enum Event<'a> {
    CallOpen { active: bool },
    CallSend { buf: &'a [u8] },
    CallRecv { buf: &'a mut [u8] },
    CallClose,
    CallAbort,
    RcvdPkt {
        header: &'a TcpHeader,
        payload: &'a [u8],
        src: Endpoint,
    },
    TimeoutRetransmit,
    TimeoutTimeWait,
    TimeoutConnection,
    ProbeTimeout,
    UserSpecTimeout,
    SendProbe,
    ClearRetransmit,
}

/// A segment the caller must encode (with [`crate::codec::encode`]) and
/// hand to the network collaborator.
#[derive(Debug, Clone)]
pub struct OutSegment {
    pub dst: Endpoint,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub flags: Flags,
    pub options: Vec<TcpOption>,
    pub data: Vec<u8>,
}

/// What a `step` call produced, for the caller to carry out: at most one
/// outbound segment, timer arm/cancel requests, and whether to post
/// `NOTIFY_USER`.
#[derive(Debug, Default)]
pub struct Effects {
    pub segment: Option<OutSegment>,
    pub arm_retransmit: Option<std::time::Duration>,
    pub cancel_retransmit: bool,
    pub arm_probe: Option<std::time::Duration>,
    pub cancel_probe: bool,
    /// Arms the TCB's shared misc slot. Caller picks `Connection` vs.
    /// `TimeWait` as the timeout kind by inspecting `tcb.state` after the
    /// step returns.
    pub arm_misc: Option<std::time::Duration>,
    pub cancel_misc: bool,
    pub notify_user: bool,
}

/// The result of a `CALL_SEND` (bytes accepted) or `CALL_RECV` (bytes
/// delivered), or an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    None,
    Accepted(usize),
    Delivered(usize),
    Error(TcpError),
}

#[derive(Debug)]
pub struct StepResult {
    pub outcome: Outcome,
    pub effects: Effects,
}

impl StepResult {
    fn none() -> Self {
        Self {
            outcome: Outcome::None,
            effects: Effects::default(),
        }
    }

    fn err(e: TcpError, effects: Effects) -> Self {
        Self {
            outcome: Outcome::Error(e),
            effects,
        }
    }
}

fn pick_iss() -> u32 {
    rand::thread_rng().gen::<u32>() & 0x7FFF_FFFF
}

fn build_ack(tcb: &Tcb) -> OutSegment {
    OutSegment {
        dst: tcb.peer.expect("peer known before acking"),
        seq: tcb.snd.nxt,
        ack: tcb.rcv.nxt,
        window: tcb.recv_window(),
        flags: Flags::ack_only(),
        options: Vec::new(),
        data: Vec::new(),
    }
}

/// Entry point: acquires no locks itself (the caller holds the FSM lock
/// for the duration of this call, per invariant 1/spec.md §4.4).
pub fn step(tcb: &mut Tcb, event: Event) -> StepResult {
    let result = match event {
        Event::CallOpen { active } => step_open(tcb, active),
        Event::CallSend { buf } => step_send(tcb, buf),
        Event::CallRecv { buf } => step_recv(tcb, buf),
        Event::CallClose => step_close(tcb),
        Event::CallAbort => step_abort(tcb),
        Event::RcvdPkt { header, payload, src } => step_rcvd_pkt(tcb, header, payload, src),
        Event::TimeoutRetransmit => step_timeout_retransmit(tcb),
        Event::TimeoutTimeWait => step_timeout_time_wait(tcb),
        Event::TimeoutConnection => step_timeout_connection(tcb),
        Event::ProbeTimeout => step_probe_timeout(tcb),
        Event::UserSpecTimeout => step_user_spec_timeout(tcb),
        Event::SendProbe => step_probe_timeout(tcb),
        Event::ClearRetransmit => {
            tcb.retransmit = None;
            let mut effects = Effects::default();
            effects.cancel_retransmit = true;
            StepResult {
                outcome: Outcome::None,
                effects,
            }
        }
    };
    // A blocking call woken only by NOTIFY_USER (the step that produced it
    // may have run on the event-loop thread, not the caller's) recovers the
    // reason a connection closed from here.
    if let Outcome::Error(e) = result.outcome {
        tcb.last_error = Some(e);
    } else if tcb.state == State::Established {
        tcb.last_error = None;
    }
    result
}

fn step_open(tcb: &mut Tcb, active: bool) -> StepResult {
    if tcb.state != State::Closed {
        return StepResult::err(TcpError::AlreadyConnected, Effects::default());
    }

    let mut effects = Effects::default();
    if active {
        let iss = pick_iss();
        tcb.snd = SendSeq {
            una: iss,
            nxt: iss.wrapping_add(1),
            wnd: 0,
            iss,
            wl1: 0,
            wl2: 0,
        };
        tcb.state = State::SynSent;
        tcb.retransmit = Some(RetransmitSnapshot {
            seq: iss,
            syn: true,
            data: Vec::new(),
            fin: false,
            sent_at: Instant::now(),
            retries: 0,
        });
        effects.segment = Some(OutSegment {
            dst: tcb.peer.expect("peer set before active open"),
            seq: iss,
            ack: 0,
            window: tcb.recv_window(),
            flags: Flags::syn(),
            options: vec![TcpOption::Mss(tcb.mss)],
            data: Vec::new(),
        });
        effects.arm_retransmit = Some(tcb.timing.rto);
        effects.arm_misc = Some(std::time::Duration::from_millis(
            tcb.config.connection_timeout_ms,
        ));
    } else {
        tcb.passive = true;
        tcb.state = State::Listen;
    }
    StepResult {
        outcome: Outcome::None,
        effects,
    }
}

fn step_send(tcb: &mut Tcb, buf: &[u8]) -> StepResult {
    if !matches!(tcb.state, State::Established | State::CloseWait) {
        return StepResult::err(TcpError::NotConnected, Effects::default());
    }
    let mut effects = Effects::default();
    if tcb.snd.wnd == 0 {
        return StepResult {
            outcome: Outcome::Accepted(0),
            effects,
        };
    }
    let room = (tcb.snd.wnd as usize).min(tcb.mss as usize);
    let n = buf.len().min(room);
    if n == 0 {
        return StepResult {
            outcome: Outcome::Accepted(0),
            effects,
        };
    }
    let data = buf[..n].to_vec();
    effects.segment = Some(OutSegment {
        dst: tcb.peer.expect("peer known once established"),
        seq: tcb.snd.nxt,
        ack: tcb.rcv.nxt,
        window: tcb.recv_window(),
        flags: Flags::psh_ack(),
        options: Vec::new(),
        data: data.clone(),
    });
    tcb.retransmit = Some(RetransmitSnapshot {
        seq: tcb.snd.nxt,
        syn: false,
        data,
        fin: false,
        sent_at: Instant::now(),
        retries: 0,
    });
    tcb.snd.nxt = tcb.snd.nxt.wrapping_add(n as u32);
    effects.arm_retransmit = Some(tcb.timing.rto);
    StepResult {
        outcome: Outcome::Accepted(n),
        effects,
    }
}

fn step_recv(tcb: &mut Tcb, buf: &mut [u8]) -> StepResult {
    if !matches!(
        tcb.state,
        State::Established | State::FinWait1 | State::FinWait2 | State::CloseWait
    ) {
        return StepResult::err(TcpError::NotConnected, Effects::default());
    }
    let mut effects = Effects::default();
    let Some(lease) = tcb.recv_buf.as_mut() else {
        return StepResult::err(TcpError::NotConnected, effects);
    };
    let before_free = lease.ring().free();
    let n = lease.ring_mut().pop_into(buf);
    let after_free = lease.ring().free();
    tcb.rcv.wnd = tcb.recv_window();

    let widened = after_free.saturating_sub(before_free) as u64;
    if widened >= (tcb.mss as u64 / 2).max(1) {
        effects.segment = Some(build_ack(tcb));
    }
    StepResult {
        outcome: Outcome::Delivered(n),
        effects,
    }
}

fn step_close(tcb: &mut Tcb) -> StepResult {
    let mut effects = Effects::default();
    match tcb.state {
        State::Established | State::SynRcvd => {
            let seq = tcb.snd.nxt;
            tcb.retransmit = Some(RetransmitSnapshot {
                seq,
                syn: false,
                data: Vec::new(),
                fin: true,
                sent_at: Instant::now(),
                retries: 0,
            });
            effects.segment = Some(OutSegment {
                dst: tcb.peer.expect("peer known"),
                seq,
                ack: tcb.rcv.nxt,
                window: tcb.recv_window(),
                flags: Flags::fin_ack(),
                options: Vec::new(),
                data: Vec::new(),
            });
            tcb.snd.nxt = tcb.snd.nxt.wrapping_add(1);
            tcb.state = State::FinWait1;
            effects.arm_retransmit = Some(tcb.timing.rto);
            StepResult {
                outcome: Outcome::None,
                effects,
            }
        }
        State::CloseWait => {
            let seq = tcb.snd.nxt;
            tcb.retransmit = Some(RetransmitSnapshot {
                seq,
                syn: false,
                data: Vec::new(),
                fin: true,
                sent_at: Instant::now(),
                retries: 0,
            });
            effects.segment = Some(OutSegment {
                dst: tcb.peer.expect("peer known"),
                seq,
                ack: tcb.rcv.nxt,
                window: tcb.recv_window(),
                flags: Flags::fin_ack(),
                options: Vec::new(),
                data: Vec::new(),
            });
            tcb.snd.nxt = tcb.snd.nxt.wrapping_add(1);
            tcb.state = State::LastAck;
            effects.arm_retransmit = Some(tcb.timing.rto);
            StepResult {
                outcome: Outcome::None,
                effects,
            }
        }
        State::Listen | State::SynSent => {
            tcb.state = State::Closed;
            tcb.recv_buf = None;
            tcb.peer = None;
            effects.cancel_retransmit = true;
            effects.cancel_misc = true;
            StepResult {
                outcome: Outcome::None,
                effects,
            }
        }
        _ => StepResult::err(TcpError::NotConnected, effects),
    }
}

fn step_abort(tcb: &mut Tcb) -> StepResult {
    let mut effects = Effects::default();
    if tcb.state != State::Closed {
        if let Some(peer) = tcb.peer {
            effects.segment = Some(OutSegment {
                dst: peer,
                seq: tcb.snd.nxt,
                ack: 0,
                window: 0,
                flags: Flags::rst_only(),
                options: Vec::new(),
                data: Vec::new(),
            });
        }
        tcb.state = State::Closed;
        tcb.recv_buf = None;
        tcb.retransmit = None;
        effects.cancel_retransmit = true;
        effects.cancel_probe = true;
        effects.cancel_misc = true;
    }
    StepResult {
        outcome: Outcome::None,
        effects,
    }
}

fn step_timeout_retransmit(tcb: &mut Tcb) -> StepResult {
    let mut effects = Effects::default();
    if tcb.retransmit.is_none() {
        return StepResult::none();
    }
    let retries = tcb.retransmit.as_ref().unwrap().retries;
    if retries >= tcb.config.retries_max {
        tcb.state = State::Closed;
        tcb.recv_buf = None;
        tcb.retransmit = None;
        effects.cancel_retransmit = true;
        effects.cancel_probe = true;
        effects.cancel_misc = true;
        effects.notify_user = true;
        return StepResult::err(TcpError::TimedOut, effects);
    }

    let config = tcb.config.clone();
    let window = tcb.recv_window();
    let rcv_nxt = tcb.rcv.nxt;
    let peer = tcb.peer.expect("peer known while retransmitting");
    let syn_sent = tcb.state == State::SynSent;

    let snapshot = tcb.retransmit.as_mut().unwrap();
    snapshot.retries += 1;
    snapshot.sent_at = Instant::now();
    let (flags, options) = if snapshot.syn && syn_sent {
        (Flags::syn(), vec![TcpOption::Mss(tcb.mss)])
    } else if snapshot.syn {
        (Flags::syn_ack(), vec![TcpOption::Mss(tcb.mss)])
    } else if snapshot.fin {
        (Flags::fin_ack(), Vec::new())
    } else {
        (Flags::psh_ack(), Vec::new())
    };
    let seg = OutSegment {
        dst: peer,
        seq: snapshot.seq,
        ack: rcv_nxt,
        window,
        flags,
        options,
        data: snapshot.data.clone(),
    };

    tcb.timing.on_backoff(&config);
    effects.segment = Some(seg);
    effects.arm_retransmit = Some(tcb.timing.rto);
    StepResult {
        outcome: Outcome::None,
        effects,
    }
}

fn step_timeout_time_wait(tcb: &mut Tcb) -> StepResult {
    let mut effects = Effects::default();
    if tcb.state == State::TimeWait {
        tcb.state = State::Closed;
        tcb.recv_buf = None;
        effects.cancel_misc = true;
    }
    StepResult {
        outcome: Outcome::None,
        effects,
    }
}

fn step_timeout_connection(tcb: &mut Tcb) -> StepResult {
    if tcb.state == State::Closed {
        return StepResult::none();
    }
    let mut effects = Effects::default();
    tcb.state = State::Closed;
    tcb.recv_buf = None;
    tcb.retransmit = None;
    effects.cancel_retransmit = true;
    effects.cancel_probe = true;
    effects.cancel_misc = true;
    effects.notify_user = true;
    StepResult::err(TcpError::ConnAborted, effects)
}

fn step_probe_timeout(tcb: &mut Tcb) -> StepResult {
    let mut effects = Effects::default();
    if tcb.snd.wnd != 0 {
        return StepResult::none();
    }
    let Some(peer) = tcb.peer else {
        return StepResult::none();
    };
    effects.segment = Some(OutSegment {
        dst: peer,
        seq: tcb.snd.nxt.wrapping_sub(1),
        ack: tcb.rcv.nxt,
        window: tcb.recv_window(),
        flags: Flags::ack_only(),
        options: Vec::new(),
        data: Vec::new(),
    });
    StepResult {
        outcome: Outcome::None,
        effects,
    }
}

fn step_user_spec_timeout(tcb: &mut Tcb) -> StepResult {
    tcb.retransmit = None;
    let mut effects = Effects::default();
    effects.cancel_retransmit = true;
    effects.cancel_probe = true;
    StepResult::err(TcpError::TimedOut, effects)
}

fn step_rcvd_pkt(
    tcb: &mut Tcb,
    header: &TcpHeader,
    payload: &[u8],
    src: Endpoint,
) -> StepResult {
    if tcb.state == State::Listen {
        return step_rcvd_pkt_listen(tcb, header, src);
    }
    if tcb.state == State::SynSent {
        return step_rcvd_pkt_syn_sent(tcb, header, src);
    }

    let mut effects = Effects::default();
    let seg_len = payload.len() as u32 + header.flags.syn as u32 + header.flags.fin as u32;
    if !is_segment_acceptable(tcb.rcv.nxt, tcb.rcv.wnd, header.seq, seg_len) {
        if header.flags.rst {
            return StepResult::none();
        }
        effects.segment = Some(build_ack(tcb));
        return StepResult {
            outcome: Outcome::None,
            effects,
        };
    }

    if header.flags.rst {
        let was_passive_syn_rcvd = tcb.state == State::SynRcvd && tcb.passive;
        if was_passive_syn_rcvd {
            tcb.state = State::Listen;
            tcb.peer = None;
            tcb.retransmit = None;
            effects.cancel_retransmit = true;
            return StepResult {
                outcome: Outcome::None,
                effects,
            };
        }
        let err = if tcb.state == State::SynRcvd {
            TcpError::ConnRefused
        } else {
            TcpError::ConnReset
        };
        tcb.state = State::Closed;
        tcb.recv_buf = None;
        tcb.retransmit = None;
        effects.cancel_retransmit = true;
        effects.cancel_probe = true;
        effects.cancel_misc = true;
        effects.notify_user = true;
        return StepResult::err(err, effects);
    }

    if header.flags.syn {
        // Duplicate/old SYN in a synchronized state: RFC 793's original
        // (pre-RFC5961) behavior is to reset. Simultaneous-open corner
        // cases beyond this are out of scope (spec.md Non-goals).
        effects.segment = Some(OutSegment {
            dst: src,
            seq: header.ack,
            ack: 0,
            window: 0,
            flags: Flags::rst_only(),
            options: Vec::new(),
            data: Vec::new(),
        });
        tcb.state = State::Closed;
        tcb.recv_buf = None;
        tcb.retransmit = None;
        effects.cancel_retransmit = true;
        effects.cancel_probe = true;
        effects.cancel_misc = true;
        effects.notify_user = true;
        return StepResult::err(TcpError::ConnReset, effects);
    }

    if !header.flags.ack {
        return StepResult::none();
    }

    let mut cleared_fin = false;
    match tcb.state {
        State::SynRcvd => {
            let acceptable = is_between_wrapped(
                tcb.snd.una.wrapping_sub(1),
                header.ack,
                tcb.snd.nxt.wrapping_add(1),
            );
            if acceptable {
                tcb.state = State::Established;
                tcb.snd.una = header.ack;
                tcb.snd.wnd = header.window;
                tcb.snd.wl1 = header.seq;
                tcb.snd.wl2 = header.ack;
                tcb.retransmit = None;
                effects.cancel_retransmit = true;
                effects.notify_user = true;
            } else {
                effects.segment = Some(OutSegment {
                    dst: src,
                    seq: header.ack,
                    ack: 0,
                    window: 0,
                    flags: Flags::rst_only(),
                    options: Vec::new(),
                    data: Vec::new(),
                });
                return StepResult {
                    outcome: Outcome::None,
                    effects,
                };
            }
        }
        _ if tcb.state.is_synchronized() => {
            if is_between_wrapped(tcb.snd.una.wrapping_sub(1), header.ack, tcb.snd.nxt.wrapping_add(1))
            {
                tcb.snd.una = header.ack;
                // A full ACK is one that reaches or passes the end of the
                // single outstanding snapshot (invariant 3).
                if let Some(snapshot) = &tcb.retransmit {
                    if !is_before(header.ack, snapshot.end()) {
                        let fin = snapshot.fin;
                        if snapshot.retries == 0 {
                            let rtt = Instant::now().saturating_duration_since(snapshot.sent_at);
                            let config = tcb.config.clone();
                            tcb.timing.on_measurement(rtt, &config);
                        }
                        tcb.retransmit = None;
                        effects.cancel_retransmit = true;
                        effects.notify_user = true;
                        cleared_fin = fin;
                    }
                }
            } else if is_before(tcb.snd.nxt, header.ack) {
                effects.segment = Some(build_ack(tcb));
                return StepResult {
                    outcome: Outcome::None,
                    effects,
                };
            }

            if is_before(tcb.snd.wl1, header.seq)
                || (tcb.snd.wl1 == header.seq && !is_before(header.ack, tcb.snd.wl2))
            {
                tcb.snd.wnd = header.window;
                tcb.snd.wl1 = header.seq;
                tcb.snd.wl2 = header.ack;
            }
        }
        _ => {}
    }

    if cleared_fin {
        match tcb.state {
            State::FinWait1 => tcb.state = State::FinWait2,
            State::Closing => {
                tcb.state = State::TimeWait;
                effects.arm_misc = Some(std::time::Duration::from_millis(tcb.config.time_wait_ms()));
            }
            State::LastAck => {
                tcb.state = State::Closed;
                tcb.recv_buf = None;
                effects.cancel_misc = true;
            }
            _ => {}
        }
    }

    if matches!(tcb.state, State::Established | State::FinWait1 | State::FinWait2) {
        if !payload.is_empty() {
            let offset = tcb.rcv.nxt.wrapping_sub(header.seq) as usize;
            if offset <= payload.len() {
                let accepted = &payload[offset..];
                if let Some(lease) = tcb.recv_buf.as_mut() {
                    let n = lease.ring_mut().push(accepted);
                    tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(n as u32);
                    tcb.rcv.wnd = tcb.recv_window();
                    effects.notify_user = true;
                }
            }
        }

        if header.flags.fin {
            tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(1);
            tcb.rcv.wnd = tcb.recv_window();
            effects.notify_user = true;
            match tcb.state {
                State::Established => tcb.state = State::CloseWait,
                State::FinWait1 => tcb.state = State::Closing,
                State::FinWait2 => {
                    tcb.state = State::TimeWait;
                    effects.arm_misc =
                        Some(std::time::Duration::from_millis(tcb.config.time_wait_ms()));
                }
                _ => {}
            }
        }

        if !payload.is_empty() || header.flags.fin {
            effects.segment = Some(build_ack(tcb));
        }
    }

    StepResult {
        outcome: Outcome::None,
        effects,
    }
}

/// `lhs` strictly precedes `rhs` in sequence order (alias kept local for
/// readability at call sites above).
fn is_before(lhs: u32, rhs: u32) -> bool {
    crate::tcb::wrapping_lt(lhs, rhs)
}

fn step_rcvd_pkt_listen(tcb: &mut Tcb, header: &TcpHeader, src: Endpoint) -> StepResult {
    let mut effects = Effects::default();
    if header.flags.rst {
        return StepResult::none();
    }
    if header.flags.ack {
        effects.segment = Some(OutSegment {
            dst: src,
            seq: header.ack,
            ack: 0,
            window: 0,
            flags: Flags::rst_only(),
            options: Vec::new(),
            data: Vec::new(),
        });
        return StepResult {
            outcome: Outcome::None,
            effects,
        };
    }
    if header.flags.syn {
        // SYN with data in LISTEN: the data is dropped, the SYN is
        // processed normally (open question 1).
        let iss = pick_iss();
        tcb.peer = Some(src);
        tcb.rcv.irs = header.seq;
        tcb.rcv.nxt = header.seq.wrapping_add(1);
        if let Some(mss) = header.mss() {
            tcb.mss = mss;
        }
        tcb.snd = SendSeq {
            una: iss,
            nxt: iss.wrapping_add(1),
            wnd: header.window,
            iss,
            wl1: header.seq,
            wl2: iss,
        };
        tcb.state = State::SynRcvd;
        tcb.retransmit = Some(RetransmitSnapshot {
            seq: iss,
            syn: true,
            data: Vec::new(),
            fin: false,
            sent_at: Instant::now(),
            retries: 0,
        });
        effects.segment = Some(OutSegment {
            dst: src,
            seq: iss,
            ack: tcb.rcv.nxt,
            window: tcb.recv_window(),
            flags: Flags::syn_ack(),
            options: vec![TcpOption::Mss(tcb.mss)],
            data: Vec::new(),
        });
        effects.arm_retransmit = Some(tcb.timing.rto);
        return StepResult {
            outcome: Outcome::None,
            effects,
        };
    }
    StepResult::none()
}

fn step_rcvd_pkt_syn_sent(tcb: &mut Tcb, header: &TcpHeader, src: Endpoint) -> StepResult {
    let mut effects = Effects::default();

    let mut ack_acceptable = true;
    if header.flags.ack {
        ack_acceptable = is_between_wrapped(
            tcb.snd.una.wrapping_sub(1),
            header.ack,
            tcb.snd.nxt.wrapping_add(1),
        );
        if !ack_acceptable {
            if header.flags.rst {
                return StepResult::none();
            }
            effects.segment = Some(OutSegment {
                dst: src,
                seq: header.ack,
                ack: 0,
                window: 0,
                flags: Flags::rst_only(),
                options: Vec::new(),
                data: Vec::new(),
            });
            return StepResult {
                outcome: Outcome::None,
                effects,
            };
        }
    }

    if header.flags.rst {
        if header.flags.ack && ack_acceptable {
            tcb.state = State::Closed;
            tcb.recv_buf = None;
            tcb.retransmit = None;
            effects.cancel_retransmit = true;
            effects.cancel_misc = true;
            effects.notify_user = true;
            return StepResult::err(TcpError::ConnRefused, effects);
        }
        return StepResult::none();
    }

    if header.flags.syn {
        tcb.peer = Some(src);
        tcb.rcv.irs = header.seq;
        tcb.rcv.nxt = header.seq.wrapping_add(1);
        if let Some(mss) = header.mss() {
            tcb.mss = mss;
        }

        if header.flags.ack {
            tcb.snd.una = header.ack;
            tcb.snd.wnd = header.window;
            tcb.snd.wl1 = header.seq;
            tcb.snd.wl2 = header.ack;
            tcb.retransmit = None;
            tcb.state = State::Established;
            effects.cancel_retransmit = true;
            effects.notify_user = true;
            effects.segment = Some(build_ack(tcb));
        } else {
            // Simultaneous open (decision #2 in SPEC_FULL.md §9): follow
            // RFC 793's SYN_RCVD path rather than treating it as an error.
            tcb.snd.wnd = header.window;
            tcb.snd.wl1 = header.seq;
            tcb.snd.wl2 = tcb.snd.iss;
            tcb.state = State::SynRcvd;
            tcb.retransmit = Some(RetransmitSnapshot {
                seq: tcb.snd.iss,
                syn: true,
                data: Vec::new(),
                fin: false,
                sent_at: Instant::now(),
                retries: 0,
            });
            effects.segment = Some(OutSegment {
                dst: src,
                seq: tcb.snd.iss,
                ack: tcb.rcv.nxt,
                window: tcb.recv_window(),
                flags: Flags::syn_ack(),
                options: vec![TcpOption::Mss(tcb.mss)],
                data: Vec::new(),
            });
            effects.arm_retransmit = Some(tcb.timing.rto);
        }
        return StepResult {
            outcome: Outcome::None,
            effects,
        };
    }

    StepResult::none()
}
