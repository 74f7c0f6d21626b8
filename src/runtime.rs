//! Carries out the side effects a `fsm::step` call reports (spec.md §4.5,
//! §4.6): encodes and sends the outbound segment, arms/cancels the timers,
//! and posts `NOTIFY_USER`. Shared by the event-loop dispatch and the
//! blocking user API so both apply effects identically.

use crate::codec::{encode, PseudoHeader, TcpHeader};
use crate::fsm::Effects;
use crate::mailbox::{MailboxSender, TimeoutKind};
use crate::net::NetworkEndpoint;
use crate::tcb::{State, Tcb};
use crate::timer::TimerService;

/// Applies `effects` to `tcb`. `tag` is the connection id used to address
/// timer expirations back to the right TCB when no user call is blocked on
/// it (see [`crate::mailbox::MailboxMsg::Timeout`]); `fallback` is the
/// stack's shared housekeeping mailbox used in that case.
pub fn apply_effects(
    tag: u64,
    tcb: &mut Tcb,
    effects: Effects,
    network: &dyn NetworkEndpoint,
    timers: &TimerService,
    fallback: &MailboxSender,
) {
    if let Some(seg) = effects.segment {
        let pseudo = PseudoHeader {
            src: tcb.local.addr,
            dst: seg.dst.addr,
        };
        let mut hdr = TcpHeader::new(tcb.local.port, seg.dst.port, seg.seq, seg.window);
        hdr.ack = seg.ack;
        hdr.flags = seg.flags;
        hdr.options = seg.options;
        let bytes = encode(&hdr, &seg.data, &pseudo);
        if let Err(e) = network.send(seg.dst, &bytes) {
            log::warn!("segment send failed for connection {tag}: {e}");
        }
    }

    let target = || tcb.mailbox.clone().unwrap_or_else(|| fallback.clone());

    if effects.cancel_retransmit {
        timers.cancel(tcb.timers.retransmit);
    }
    if let Some(d) = effects.arm_retransmit {
        timers.schedule(tcb.timers.retransmit, d, TimeoutKind::Retransmit, tag, target());
    }

    if effects.cancel_probe {
        timers.cancel(tcb.timers.probe);
    }
    if let Some(d) = effects.arm_probe {
        timers.schedule(tcb.timers.probe, d, TimeoutKind::Probe, tag, target());
    }

    if effects.cancel_misc {
        timers.cancel(tcb.timers.misc);
    }
    if let Some(d) = effects.arm_misc {
        let kind = if tcb.state == State::TimeWait {
            TimeoutKind::TimeWait
        } else {
            TimeoutKind::Connection
        };
        timers.schedule(tcb.timers.misc, d, kind, tag, target());
    }

    if effects.notify_user {
        if let Some(mb) = &tcb.mailbox {
            mb.put(crate::mailbox::MailboxMsg::NotifyUser);
        }
    }
}
