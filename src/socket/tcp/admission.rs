//! Segment admission, RFC 793 page 69.
//!
//! Both checks run before any state is touched. A rejected segment is
//! answered with an ACK or a reset where appropriate and then dropped.

use super::machine::Machine;
use super::{Error, State};
use crate::wire::{TcpFlags, TcpRepr, TcpSeqNumber};

impl Machine<'_> {
    fn in_window(&self, seq: TcpSeqNumber) -> bool {
        let start = self.cb.recv_nxt;
        start.lower_or_equal(seq) && seq.lower_than(start + self.cb.recv_wnd)
    }

    pub(super) fn check_seq_num(&mut self, repr: &TcpRepr) -> Result<(), Error> {
        let rst = repr.flags.contains(TcpFlags::RST);
        match self.cb.state {
            State::Closed | State::Listen | State::SynSent => return Ok(()),
            State::SynReceived => {
                if !(self.cb.send_nxt.greater_than(self.cb.send_una) || rst) {
                    return Ok(());
                }
                if repr.flags.contains(TcpFlags::SYN) && repr.seq_number + 1 == self.cb.recv_nxt {
                    return Ok(());
                }
            }
            _ => (),
        }

        let seq = repr.seq_number;
        let seglen = repr.segment_len() as u32;
        let acceptable = match (seglen, self.cb.recv_wnd) {
            (0, 0) => seq == self.cb.recv_nxt,
            (0, _) => self.in_window(seq),
            (_, 0) => false,
            (_, _) => self.in_window(seq) || self.in_window(seq + seglen - 1),
        };
        if acceptable {
            return Ok(());
        }

        let fin_retransmit = matches!(
            self.cb.state,
            State::CloseWait | State::Closing | State::LastAck | State::TimeWait
        ) && repr.flags.contains(TcpFlags::FIN)
            && seq + seglen == self.cb.recv_nxt;

        net_debug!(
            "{}: unacceptable seq {}+{}, expecting {}+{}",
            self.id,
            seq,
            seglen,
            self.cb.recv_nxt,
            self.cb.recv_wnd
        );
        if !rst && (self.cb.dup_ack_seq.is_idle(self.now) || fin_retransmit) {
            self.send_duplicate_ack();
            self.cb
                .dup_ack_seq
                .arm(self.now, self.config.dup_ack_timeout);
        }
        if fin_retransmit && self.cb.state == State::TimeWait {
            tcp_trace!("{}: FIN retransmitted, restarting TIME-WAIT", self.id);
            self.cb.timer.set_for_bound(self.now, self.config.msl * 2);
        }
        Err(Error::Drop)
    }

    pub(super) fn check_ack_num(&mut self, repr: &TcpRepr, ack: TcpSeqNumber) -> Result<(), Error> {
        let rst = repr.flags.contains(TcpFlags::RST);
        match self.cb.state {
            State::Closed | State::Listen => Ok(()),
            State::SynSent | State::SynReceived => {
                if ack.lower_or_equal(self.cb.send_una) || ack.greater_than(self.cb.send_nxt) {
                    net_debug!(
                        "{}: unacceptable ack {}, expecting ({}, {}]",
                        self.id,
                        ack,
                        self.cb.send_una,
                        self.cb.send_nxt
                    );
                    if !rst {
                        self.send_reset(ack, false);
                    }
                    return Err(Error::Drop);
                }
                Ok(())
            }
            _ => {
                if ack.greater_than(self.cb.send_nxt) {
                    net_debug!(
                        "{}: ack {} beyond send_nxt {}",
                        self.id,
                        ack,
                        self.cb.send_nxt
                    );
                    if self.cb.dup_ack_ack.is_idle(self.now) {
                        self.send_duplicate_ack();
                        self.cb
                            .dup_ack_ack
                            .arm(self.now, self.config.dup_ack_timeout);
                    }
                    return Err(Error::Drop);
                }
                Ok(())
            }
        }
    }
}
