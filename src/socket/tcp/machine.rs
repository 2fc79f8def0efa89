use core::mem;

use heapless::Vec;

use super::{
    AckTimer, Config, ConsumeError, ControlBlock, CtrlFlags, DEFAULT_MSS, Error, Events,
    HEADER_LEN, State, Suppression, Timer, Tuple,
};
use crate::config::{TCP_EFFECT_COUNT, TCP_SCRATCH_LEN, TCP_SEGMENT_BURST};
use crate::socket::{LifecycleEvent, SocketId};
use crate::time::Instant;
use crate::wire::{IpEndpoint, IpListenEndpoint, TcpFlags, TcpRepr, TcpSeqNumber};

pub(crate) type Effects = Vec<Effect, TCP_EFFECT_COUNT>;

/// A byte range, either of the send queue or of an inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DataRange {
    pub offset: usize,
    pub len: usize,
}

/// What to do when an outgoing segment cannot be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recovery {
    Ignore,
    /// Replay the segment as a retransmission on the next tick.
    Retry,
    /// Retry the ACK on the next tick; `attempts` counts the failures so far.
    AckRetry { attempts: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Outgoing {
    pub tuple: Tuple,
    pub flags: TcpFlags,
    pub seq: TcpSeqNumber,
    pub ack: Option<TcpSeqNumber>,
    pub window: u16,
    pub mss: Option<u16>,
    /// Payload taken from the send queue of the owner.
    pub data: Option<DataRange>,
    pub recovery: Recovery,
}

impl Outgoing {
    pub(crate) fn control(
        tuple: Tuple,
        flags: TcpFlags,
        seq: TcpSeqNumber,
        ack: Option<TcpSeqNumber>,
    ) -> Outgoing {
        Outgoing {
            tuple,
            flags,
            seq,
            ack,
            window: 0,
            mss: None,
            data: None,
            recovery: Recovery::Ignore,
        }
    }
}

/// A side effect of a transition, applied once the exclusive area is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    Transmit(Outgoing),
    Connected,
    Accepted {
        listener: SocketId,
        remote: IpEndpoint,
    },
    RxData {
        remote: IpEndpoint,
        range: DataRange,
    },
    /// Out-of-order payload starting `offset` bytes past `recv_nxt`.
    Reassemble {
        offset: usize,
        range: DataRange,
    },
    TxConfirmed(usize),
    Lifecycle(LifecycleEvent),
    /// The control block entered CLOSED and goes back to the pool.
    Closed {
        event: LifecycleEvent,
        release: usize,
        active: bool,
        was_listener: bool,
    },
}

/// A control block in the middle of a transition.
///
/// Everything here runs inside the exclusive area. Transitions mutate the
/// control block directly and record what has to happen outside of it.
pub(crate) struct Machine<'a> {
    pub(super) id: SocketId,
    pub(super) cb: &'a mut ControlBlock,
    pub(super) config: &'a Config,
    pub(super) now: Instant,
    effects: &'a mut Effects,
}

impl<'a> Machine<'a> {
    pub(crate) fn new(
        id: SocketId,
        cb: &'a mut ControlBlock,
        config: &'a Config,
        now: Instant,
        effects: &'a mut Effects,
    ) -> Machine<'a> {
        Machine {
            id,
            cb,
            config,
            now,
            effects,
        }
    }

    pub(super) fn push(&mut self, effect: Effect) {
        if let Err(effect) = self.effects.push(effect) {
            match effect {
                // The close must never be lost, it returns the block to the pool.
                Effect::Closed { .. } => {
                    self.effects.pop();
                    let _ = self.effects.push(effect);
                }
                _ => net_debug!("{}: effect list full, dropping {:?}", self.id, effect),
            }
        }
    }

    /// Whether this transition hands the connection to the session layer.
    fn accept_pending(&self) -> bool {
        self.effects
            .iter()
            .any(|effect| matches!(effect, Effect::Accepted { .. }))
    }

    pub(super) fn set_state(&mut self, state: State) {
        if self.cb.state != state {
            tcp_trace!("{}: state={}=>{}", self.id, self.cb.state, state);
        }
        self.cb.state = state;
    }

    fn window(&self) -> u16 {
        self.cb.recv_wnd.min(u16::MAX as u32) as u16
    }

    /// A segment without payload carrying the current acknowledgement.
    pub(super) fn control(&self, flags: TcpFlags, seq: TcpSeqNumber) -> Option<Outgoing> {
        let tuple = self.cb.tuple()?;
        let ack = match self.cb.state {
            State::SynSent => None,
            _ => Some(self.cb.recv_nxt),
        };
        let mut flags = flags;
        flags.set(TcpFlags::ACK, ack.is_some());
        let mut outgoing = Outgoing::control(tuple, flags, seq, ack);
        outgoing.window = self.window();
        Some(outgoing)
    }

    pub(super) fn transmit(&mut self, outgoing: Option<Outgoing>) {
        match outgoing {
            Some(outgoing) => self.push(Effect::Transmit(outgoing)),
            None => net_debug!("{}: no endpoints to send from", self.id),
        }
    }

    pub(super) fn send_ack(&mut self) {
        self.send_ack_attempt(1)
    }

    fn send_ack_attempt(&mut self, attempts: u8) {
        let mut outgoing = self.control(TcpFlags::ACK, self.cb.send_nxt);
        if let Some(outgoing) = outgoing.as_mut() {
            outgoing.recovery = Recovery::AckRetry { attempts };
        }
        self.transmit(outgoing);
        self.cb.num_unack = 0;
        self.cb.ack_timer = AckTimer::Idle;
    }

    /// An ACK answering an unacceptable segment. It is never retried.
    pub(super) fn send_duplicate_ack(&mut self) {
        let outgoing = self.control(TcpFlags::ACK, self.cb.send_nxt);
        self.transmit(outgoing);
    }

    pub(super) fn send_reset(&mut self, seq: TcpSeqNumber, with_ack: bool) {
        let outgoing = self.cb.tuple().map(|tuple| {
            if with_ack {
                Outgoing::control(
                    tuple,
                    TcpFlags::RST | TcpFlags::ACK,
                    seq,
                    Some(self.cb.recv_nxt),
                )
            } else {
                Outgoing::control(tuple, TcpFlags::RST, seq, None)
            }
        });
        self.transmit(outgoing);
    }

    fn initialize(&mut self, tuple: Tuple, iss: TcpSeqNumber, max_payload: u16) {
        let cb = &mut *self.cb;
        cb.local = IpListenEndpoint::from(tuple.local);
        cb.remote = Some(tuple.remote);
        cb.recv_mss = max_payload.saturating_sub(HEADER_LEN);
        cb.send_una = iss;
        cb.send_nxt = iss;
        cb.send_wl2 = iss;
        cb.num_rtx = 0;
        cb.used_buff = 0;
        cb.sent_buff = 0;
    }

    fn tunables(&self) -> CtrlFlags {
        let mut flags = CtrlFlags::empty();
        flags.set(CtrlFlags::KEEP_ALIVE, self.config.keep_alive);
        flags.set(CtrlFlags::NAGLE, self.config.nagle);
        flags
    }

    pub(crate) fn connect(&mut self, tuple: Tuple, iss: TcpSeqNumber, max_payload: u16) -> Result<(), Error> {
        if self.cb.state != State::Closed {
            return Err(Error::NotPermitted);
        }
        self.initialize(tuple, iss, max_payload);

        let flags = self.tunables() | CtrlFlags::ACTIVE;
        let wnd = self.config.max_rx_window as u32;
        let cb = &mut *self.cb;
        cb.send_mss = DEFAULT_MSS.min(cb.recv_mss);
        cb.recv_wnd = wnd;
        cb.recv_wndmax = wnd;
        cb.flags = flags;
        cb.ctrl = TcpFlags::SYN;
        net_debug!("{}: connecting {} with iss {}", self.id, tuple, iss);
        self.set_state(State::SynSent);
        self.output(false);
        Ok(())
    }

    pub(crate) fn listen(&mut self, local: IpListenEndpoint, backlog: usize) -> Result<(), Error> {
        if self.cb.state != State::Closed {
            return Err(Error::NotPermitted);
        }
        let flags = self.tunables() | CtrlFlags::ACTIVE;
        let cb = &mut *self.cb;
        cb.local = local;
        cb.remote = None;
        cb.backlog = backlog;
        cb.last_overflow = None;
        cb.flags = flags;
        cb.recv_wndmax = self.config.max_rx_window as u32;
        self.set_state(State::Listen);
        Ok(())
    }

    /// Turn a freshly cloned listener copy into a passively opened connection.
    fn adopt(&mut self, listener: SocketId, tuple: Tuple, iss: TcpSeqNumber, max_payload: u16) {
        let inherited = self.cb.flags & (CtrlFlags::KEEP_ALIVE | CtrlFlags::NAGLE);
        let wndmax = self.cb.recv_wndmax;
        *self.cb = ControlBlock::new();
        self.initialize(tuple, iss, max_payload);
        let cb = &mut *self.cb;
        cb.listener = Some(listener);
        cb.flags = inherited;
        cb.recv_wnd = wndmax;
        cb.recv_wndmax = wndmax;
    }

    /// LISTEN --rcvSyn--> SYN-RECEIVED on the child.
    ///
    /// The SYN occupies one sequence slot. Any payload it carries is ignored.
    pub(crate) fn open_passive(
        &mut self,
        listener: SocketId,
        tuple: Tuple,
        repr: &TcpRepr,
        iss: TcpSeqNumber,
        max_payload: u16,
    ) -> Result<(), Error> {
        self.adopt(listener, tuple, iss, max_payload);
        let cb = &mut *self.cb;
        cb.send_mss = repr.max_seg_size.unwrap_or(DEFAULT_MSS).min(cb.recv_mss);
        cb.recv_nxt = repr.seq_number + 1;
        cb.send_wl1 = repr.seq_number;
        cb.send_wnd = repr.window_len as u32;
        cb.ctrl = TcpFlags::SYN;
        cb.syn_received_until = Some(self.now + self.config.syn_received_timeout);
        self.set_state(State::SynReceived);
        self.output(false);
        Ok(())
    }

    /// LISTEN --rcvAck (cookie path)--> ESTABLISHED on the child.
    pub(crate) fn open_from_cookie(
        &mut self,
        listener: SocketId,
        tuple: Tuple,
        repr: &TcpRepr,
        ack: TcpSeqNumber,
        mss: u16,
        max_payload: u16,
    ) -> Result<(), Error> {
        self.adopt(listener, tuple, ack, max_payload);
        let cb = &mut *self.cb;
        cb.send_mss = mss.min(cb.recv_mss);
        cb.recv_nxt = repr.seq_number;
        cb.send_wl1 = repr.seq_number;
        cb.send_wnd = repr.window_len as u32;
        self.set_state(State::Established);
        self.push(Effect::Accepted {
            listener,
            remote: tuple.remote,
        });
        self.restart_keep_alive();
        Ok(())
    }

    /// Run an admitted segment through the transitions selected by `events`.
    pub(crate) fn process(&mut self, repr: &TcpRepr, events: Events) -> Result<(), Error> {
        self.check_seq_num(repr)?;
        if let Some(ack) = repr.ack_number {
            self.check_ack_num(repr, ack)?;
        }

        if repr.flags.contains(TcpFlags::RST) {
            if !events.contains(Events::RST) {
                return Err(Error::Drop);
            }
            return self.rcv_rst(repr);
        }

        if self.cb.state == State::SynSent {
            if !(events.contains(Events::SYN) && repr.flags.contains(TcpFlags::SYN)) {
                return Err(Error::Drop);
            }
            return match repr.ack_number {
                Some(ack) => self.rcv_syn_ack(repr, ack),
                None => self.simultaneous_open(repr),
            };
        }

        if events.contains(Events::SYN) && repr.flags.contains(TcpFlags::SYN) {
            self.rcv_syn(repr)?;
        }

        let Some(ack) = repr.ack_number else {
            return Err(Error::Drop);
        };
        if events.contains(Events::ACK) {
            self.ack_update(ack, repr.window_len);
            self.rcv_ack(ack)?;
            self.update_send_window(repr, ack);
        }
        if events.contains(Events::DATA) && !repr.payload.is_empty() {
            self.rcv_data(repr)?;
        }
        if events.contains(Events::FIN) && repr.flags.contains(TcpFlags::FIN) {
            self.rcv_fin(repr.seq_number + repr.payload.len() as u32);
        }

        if self.cb.used_buff > self.cb.sent_buff {
            self.output(false);
        }
        Ok(())
    }

    fn rcv_syn_ack(&mut self, repr: &TcpRepr, ack: TcpSeqNumber) -> Result<(), Error> {
        let cb = &mut *self.cb;
        cb.send_mss = repr.max_seg_size.unwrap_or(DEFAULT_MSS).min(cb.recv_mss);
        cb.recv_nxt = repr.seq_number + 1;
        cb.send_wl1 = repr.seq_number;
        cb.send_wl2 = ack;
        cb.send_wnd = repr.window_len as u32;
        self.ack_update(ack, repr.window_len);
        self.set_state(State::Established);
        self.push(Effect::Connected);
        self.send_ack();
        self.restart_keep_alive();
        Ok(())
    }

    /// SYN-SENT --rcvSyn--> SYN-RECEIVED, both ends opened actively.
    fn simultaneous_open(&mut self, repr: &TcpRepr) -> Result<(), Error> {
        let cb = &mut *self.cb;
        cb.send_mss = repr.max_seg_size.unwrap_or(DEFAULT_MSS).min(cb.recv_mss);
        cb.recv_nxt = repr.seq_number + 1;
        cb.send_wl1 = repr.seq_number;
        cb.send_wnd = repr.window_len as u32;
        cb.ctrl = TcpFlags::SYN;
        cb.syn_received_until = Some(self.now + self.config.syn_received_timeout);
        net_debug!("{}: simultaneous open", self.id);
        self.set_state(State::SynReceived);
        self.output(true);
        Ok(())
    }

    fn rcv_syn(&mut self, repr: &TcpRepr) -> Result<(), Error> {
        if self.cb.state == State::SynReceived && repr.seq_number + 1 == self.cb.recv_nxt {
            tcp_trace!("{}: duplicate SYN", self.id);
            return Ok(());
        }
        net_debug!("{}: unexpected SYN in {}", self.id, self.cb.state);
        self.send_reset(self.cb.send_nxt, true);
        Err(Error::Fatal(LifecycleEvent::Reset))
    }

    fn rcv_rst(&mut self, repr: &TcpRepr) -> Result<(), Error> {
        match self.cb.state {
            State::SynSent if repr.ack_number.is_none() => Err(Error::Drop),
            State::TimeWait if self.config.time_wait_ignores_rst => {
                tcp_trace!("{}: ignoring RST in TIME-WAIT", self.id);
                Err(Error::Drop)
            }
            _ => {
                net_debug!("{}: connection reset in {}", self.id, self.cb.state);
                Err(Error::Fatal(LifecycleEvent::Reset))
            }
        }
    }

    /// Acknowledgement bookkeeping shared by every synchronized state.
    fn ack_update(&mut self, ack: TcpSeqNumber, window: u16) {
        let now = self.now;
        let rtx_timeout = self.config.rtx_timeout;
        let cb = &mut *self.cb;

        if ack == cb.send_una {
            if window == 0 && cb.timer.is_retransmit() {
                cb.timer.set_for_retransmit(now, rtx_timeout);
                cb.num_rtx = 0;
            }
            return;
        }
        if ack.lower_than(cb.send_una) {
            return;
        }

        let freed = (ack.distance(cb.send_una) as usize).min(cb.used_buff);
        cb.used_buff -= freed;
        cb.sent_buff = cb.sent_buff.saturating_sub(freed);
        cb.send_una = ack;
        cb.num_rtx = 0;

        if cb.used_buff == 0 && ack == cb.send_nxt {
            if cb.timer.is_retransmit() {
                cb.timer.set_for_idle();
            }
            cb.ctrl = TcpFlags::empty();
            cb.flags.remove(CtrlFlags::RETRY);
        } else {
            cb.timer.set_for_retransmit(now, rtx_timeout);
        }

        if freed > 0 {
            self.push(Effect::TxConfirmed(freed));
        }
    }

    fn rcv_ack(&mut self, ack: TcpSeqNumber) -> Result<(), Error> {
        let all_acked = self.cb.used_buff == 0 && ack == self.cb.send_nxt;
        match self.cb.state {
            State::SynReceived => {
                self.cb.syn_received_until = None;
                self.set_state(State::Established);
                let effect = match (self.cb.listener, self.cb.remote) {
                    (Some(listener), Some(remote)) if !self.cb.flags.contains(CtrlFlags::ACTIVE) => {
                        Effect::Accepted { listener, remote }
                    }
                    _ => Effect::Connected,
                };
                self.push(effect);
                self.restart_keep_alive();
            }
            State::Established => self.restart_keep_alive(),
            State::FinWait1 if all_acked => {
                self.set_state(State::FinWait2);
                self.cb
                    .timer
                    .set_for_bound(self.now, self.config.fin_wait_2_timeout);
            }
            State::Closing if all_acked => {
                self.set_state(State::TimeWait);
                self.cb.timer.set_for_bound(self.now, self.config.msl * 2);
            }
            State::LastAck if all_acked => return Err(Error::Fatal(LifecycleEvent::Closed)),
            _ => (),
        }
        Ok(())
    }

    /// See RFC 793 page 72.
    fn update_send_window(&mut self, repr: &TcpRepr, ack: TcpSeqNumber) {
        let cb = &mut *self.cb;
        let seq = repr.seq_number;
        if cb.send_wl1.lower_than(seq) || (cb.send_wl1 == seq && cb.send_wl2.lower_or_equal(ack)) {
            cb.send_wnd = repr.window_len as u32;
            cb.send_wl1 = seq;
            cb.send_wl2 = ack;
        }
    }

    fn rcv_data(&mut self, repr: &TcpRepr) -> Result<(), Error> {
        match self.cb.state {
            State::Established | State::FinWait1 | State::FinWait2 => (),
            _ => return Ok(()),
        }
        let Some(remote) = self.cb.remote else {
            return Err(Error::Drop);
        };
        let seq = repr.seq_number;
        let len = repr.payload.len();

        if seq.greater_than(self.cb.recv_nxt) {
            let offset = seq.distance(self.cb.recv_nxt) as usize;
            net_debug!("{}: out of order data at +{}, {} octets", self.id, offset, len);
            self.push(Effect::Reassemble {
                offset,
                range: DataRange { offset: 0, len },
            });
            self.send_ack();
            return Err(Error::Drop);
        }

        let skip = self.cb.recv_nxt.distance(seq) as usize;
        if skip >= len {
            return Ok(());
        }
        let take = (len - skip).min(self.cb.recv_wnd as usize);
        if take == 0 {
            return Err(Error::Drop);
        }

        let cb = &mut *self.cb;
        cb.recv_nxt += take as u32;
        cb.recv_wnd -= take as u32;
        cb.num_unack += take as u32;
        self.push(Effect::RxData {
            remote,
            range: DataRange { offset: skip, len: take },
        });

        // ACK every second full-sized segment.
        if self.cb.recv_mss as u32 <= self.cb.num_unack >> 1 {
            self.send_ack();
        } else {
            self.cb
                .ack_timer
                .arm(self.now, self.config.delayed_ack_timeout);
        }

        if skip + take < len {
            tcp_trace!("{}: window exhausted, {} octets dropped", self.id, len - skip - take);
            return Err(Error::Drop);
        }
        Ok(())
    }

    fn rcv_fin(&mut self, fin_seq: TcpSeqNumber) {
        if fin_seq != self.cb.recv_nxt {
            return;
        }
        match self.cb.state {
            State::Established => {
                self.stop_keep_alive();
                self.set_state(State::CloseWait);
                // A rejected accept drops the effects queued after it.
                if self.cb.flags.contains(CtrlFlags::ACTIVE) || self.accept_pending() {
                    self.push(Effect::Lifecycle(LifecycleEvent::FinReceived));
                }
            }
            State::FinWait1 => self.set_state(State::Closing),
            State::FinWait2 => {
                self.set_state(State::TimeWait);
                self.cb.timer.set_for_bound(self.now, self.config.msl * 2);
            }
            _ => return,
        }
        self.cb.recv_nxt += 1;
        self.send_ack();
    }

    fn restart_keep_alive(&mut self) {
        let cb = &mut *self.cb;
        if cb.flags.contains(CtrlFlags::KEEP_ALIVE)
            && cb.state == State::Established
            && cb.send_una == cb.send_nxt
            && !cb.timer.is_retransmit()
        {
            cb.timer
                .set_for_keep_alive(self.now, self.config.keep_alive_time);
            cb.num_rtx = 0;
        }
    }

    fn stop_keep_alive(&mut self) {
        if self.cb.timer.is_keep_alive() {
            self.cb.timer.set_for_idle();
            self.cb.num_rtx = 0;
        }
    }

    /// Send whatever the window allows, starting from `send_una` when
    /// retransmitting and from `send_nxt` otherwise.
    ///
    /// `send_nxt` never moves back. Segments are accounted as sent as soon as
    /// they are queued; a failed transmission is replayed by the retry logic.
    pub(super) fn output(&mut self, retransmit: bool) {
        let Some(tuple) = self.cb.tuple() else {
            return;
        };
        let ack = match self.cb.state {
            State::SynSent => None,
            _ => Some(self.cb.recv_nxt),
        };
        let window = self.window();
        let mut cursor = if retransmit {
            self.cb.send_una
        } else {
            self.cb.send_nxt
        };
        let mut sent = false;

        if self.cb.ctrl.contains(TcpFlags::SYN) {
            if cursor == self.cb.send_una {
                let mut outgoing = Outgoing::control(tuple, TcpFlags::SYN, cursor, ack);
                outgoing.flags.set(TcpFlags::ACK, ack.is_some());
                outgoing.window = window;
                outgoing.mss = Some(self.cb.recv_mss);
                outgoing.recovery = Recovery::Retry;
                self.push(Effect::Transmit(outgoing));
                cursor += 1;
                sent = true;
            }
        } else {
            let fin = self.cb.ctrl.contains(TcpFlags::FIN);
            let nagle = self.cb.flags.contains(CtrlFlags::NAGLE) && !retransmit && !fin;
            let mss = self.cb.send_mss as usize;
            let mut fin_sent = false;

            for _ in 0..TCP_SEGMENT_BURST {
                let offset = cursor.distance(self.cb.send_una) as usize;
                if offset >= self.cb.used_buff {
                    break;
                }
                let unsent = self.cb.used_buff - offset;
                // A closed window is probed with one octet, paced by the
                // retransmit timer.
                let probe = self.cb.send_wnd == 0 && offset == 0;
                let room = self.cb.send_wnd.saturating_sub(offset as u32) as usize;
                let len = if probe {
                    1
                } else {
                    unsent.min(mss).min(room).min(TCP_SCRATCH_LEN)
                };
                if len == 0 {
                    break;
                }
                // Hold back a small segment while anything is unacknowledged.
                if nagle && len < mss && cursor != self.cb.send_una {
                    break;
                }
                if probe {
                    tcp_trace!("{}: probing zero window at {}", self.id, cursor);
                }

                let last = len == unsent;
                let mut flags = TcpFlags::ACK;
                if last {
                    flags |= TcpFlags::PSH;
                    if fin && !probe {
                        flags |= TcpFlags::FIN;
                    }
                }
                self.push(Effect::Transmit(Outgoing {
                    tuple,
                    flags,
                    seq: cursor,
                    ack,
                    window,
                    mss: None,
                    data: Some(DataRange { offset, len }),
                    recovery: Recovery::Retry,
                }));
                cursor += len as u32;
                sent = true;
                if probe {
                    break;
                }
                if last && fin {
                    cursor += 1;
                    fin_sent = true;
                    break;
                }
            }

            if fin && !fin_sent && cursor == self.cb.send_una + self.cb.used_buff as u32 {
                let mut outgoing =
                    Outgoing::control(tuple, TcpFlags::FIN | TcpFlags::ACK, cursor, ack);
                outgoing.window = window;
                outgoing.recovery = Recovery::Retry;
                self.push(Effect::Transmit(outgoing));
                cursor += 1;
                sent = true;
            }
        }

        let cb = &mut *self.cb;
        if cursor.greater_than(cb.send_nxt) {
            cb.send_nxt = cursor;
        }
        cb.sent_buff = (cb.send_nxt.distance(cb.send_una) as usize).min(cb.used_buff);
        if cb.sent_buff >= cb.used_buff {
            cb.flags.remove(CtrlFlags::TRANSMIT_PENDING);
        }
        if sent {
            if ack.is_some() {
                cb.num_unack = 0;
                if let AckTimer::Delayed(_) = cb.ack_timer {
                    cb.ack_timer = AckTimer::Idle;
                }
            }
            if !cb.timer.is_retransmit() {
                cb.timer.set_for_retransmit(self.now, self.config.rtx_timeout);
            }
        }
    }

    pub(crate) fn tick(&mut self) -> Result<(), Error> {
        let now = self.now;

        if self.cb.ack_timer.is_due(now) {
            match self.cb.ack_timer {
                AckTimer::Retry { attempts } if attempts >= self.config.max_transient_retries => {
                    net_debug!("{}: giving up on ACK after {} attempts", self.id, attempts);
                    return Err(Error::Fatal(LifecycleEvent::Reset));
                }
                AckTimer::Retry { attempts } => self.send_ack_attempt(attempts + 1),
                _ => self.send_ack(),
            }
        }

        self.cb.dup_ack_seq.expire(now);
        self.cb.dup_ack_ack.expire(now);

        if self.cb.state == State::SynReceived
            && self.cb.syn_received_until.is_some_and(|until| now >= until)
        {
            net_debug!("{}: handshake not completed in time", self.id);
            return Err(Error::Fatal(LifecycleEvent::Reset));
        }

        if self.cb.flags.contains(CtrlFlags::RETRY) {
            self.cb.flags.remove(CtrlFlags::RETRY);
            self.retransmit()?;
        } else if self.cb.timer.should_retransmit(now) {
            self.retransmit()?;
        }
        if self.cb.timer.should_expire(now) {
            self.state_timeout()?;
        }
        if self.cb.timer.should_keep_alive(now) {
            self.keep_alive()?;
        }

        if self.cb.flags.contains(CtrlFlags::CLOSE_REQUESTED) {
            self.regular_close()?;
        }
        if self.cb.flags.contains(CtrlFlags::TRANSMIT_PENDING) {
            self.output(false);
        }
        Ok(())
    }

    fn retransmit(&mut self) -> Result<(), Error> {
        let cb = &mut *self.cb;
        match cb.state {
            State::Closed | State::Listen | State::FinWait2 | State::TimeWait => return Ok(()),
            _ => (),
        }
        let outstanding =
            cb.send_nxt.greater_than(cb.send_una) || cb.used_buff > 0 || !cb.ctrl.is_empty();
        if !outstanding {
            if cb.timer.is_retransmit() {
                cb.timer.set_for_idle();
            }
            return Ok(());
        }

        let limit = if cb.state.is_handshake() {
            self.config.max_syn_retx
        } else {
            self.config.max_retx
        };
        if cb.num_rtx >= limit {
            net_debug!("{}: retransmission limit of {} reached in {}", self.id, limit, cb.state);
            return Err(Error::Fatal(LifecycleEvent::Reset));
        }
        cb.num_rtx += 1;
        cb.timer.set_for_retransmit(self.now, self.config.rtx_timeout);
        net_debug!(
            "{}: retransmitting from {}, attempt {}",
            self.id,
            cb.send_una,
            cb.num_rtx
        );
        self.output(true);
        Ok(())
    }

    fn state_timeout(&mut self) -> Result<(), Error> {
        match self.cb.state {
            State::TimeWait => Err(Error::Fatal(LifecycleEvent::Closed)),
            State::FinWait2 => {
                net_debug!("{}: no FIN from the peer", self.id);
                Err(Error::Fatal(LifecycleEvent::Reset))
            }
            _ => {
                self.cb.timer.set_for_idle();
                Ok(())
            }
        }
    }

    fn keep_alive(&mut self) -> Result<(), Error> {
        if self.cb.num_rtx >= self.config.keep_alive_probes {
            net_debug!("{}: peer stopped answering keep-alives", self.id);
            return Err(Error::Fatal(LifecycleEvent::Reset));
        }
        self.cb.num_rtx += 1;
        self.cb
            .timer
            .set_for_keep_alive(self.now, self.config.keep_alive_interval);
        let outgoing = self.control(TcpFlags::ACK, self.cb.send_una - 1);
        tcp_trace!("{}: keep-alive probe {}", self.id, self.cb.num_rtx);
        self.transmit(outgoing);
        Ok(())
    }

    /// Graceful close. The FIN is sent by [`Machine::regular_close`] on the
    /// next tick.
    pub(crate) fn request_close(&mut self) -> Result<(), Error> {
        match self.cb.state {
            State::SynSent | State::SynReceived | State::Established | State::CloseWait => {
                self.cb.flags.insert(CtrlFlags::CLOSE_REQUESTED);
                self.cb
                    .flags
                    .remove(CtrlFlags::TRANSMIT_PENDING | CtrlFlags::RETRY);
                Ok(())
            }
            State::FinWait1 | State::FinWait2 => Ok(()),
            State::Listen | State::Closed => Err(Error::Fatal(LifecycleEvent::Closed)),
            State::LastAck | State::Closing | State::TimeWait => Err(Error::NotPermitted),
        }
    }

    fn regular_close(&mut self) -> Result<(), Error> {
        let next = match self.cb.state {
            State::SynSent => return Err(Error::Fatal(LifecycleEvent::Closed)),
            State::SynReceived => return Ok(()),
            State::Established => State::FinWait1,
            State::CloseWait => State::LastAck,
            _ => {
                self.cb.flags.remove(CtrlFlags::CLOSE_REQUESTED);
                return Ok(());
            }
        };
        self.cb.flags.remove(CtrlFlags::CLOSE_REQUESTED);
        self.stop_keep_alive();
        self.cb.ctrl.insert(TcpFlags::FIN);
        self.set_state(next);
        self.output(false);
        Ok(())
    }

    pub(crate) fn abort(&mut self) -> Result<(), Error> {
        if self.cb.state.peer_may_be_live() {
            self.send_reset(self.cb.send_nxt, true);
        }
        Err(Error::Fatal(LifecycleEvent::Closed))
    }

    pub(crate) fn notify_consumed(&mut self, len: usize) -> Result<(), ConsumeError> {
        match self.cb.state {
            State::Established | State::FinWait1 | State::FinWait2 => (),
            _ => return Err(ConsumeError::InvalidState),
        }
        let grown = u32::try_from(len)
            .ok()
            .and_then(|len| self.cb.recv_wnd.checked_add(len))
            .filter(|&wnd| wnd <= self.cb.recv_wndmax)
            .ok_or(ConsumeError::WindowOverflow)?;

        let mss = self.cb.send_mss as u32;
        let reopened = self.cb.recv_wnd < mss && grown >= mss;
        self.cb.recv_wnd = grown;
        if reopened {
            tcp_trace!("{}: window update to {}", self.id, grown);
            self.send_ack();
        }
        Ok(())
    }

    /// The CLOSED entry action. Reached exactly once per connection.
    pub(crate) fn enter_closed(&mut self, event: LifecycleEvent) {
        let cb = &mut *self.cb;
        let release = mem::take(&mut cb.avail_buff);
        let active = cb.flags.contains(CtrlFlags::ACTIVE);
        let was_listener = cb.state == State::Listen;
        cb.timer = Timer::Idle;
        cb.ack_timer = AckTimer::Idle;
        cb.dup_ack_seq = Suppression::default();
        cb.dup_ack_ack = Suppression::default();
        cb.syn_received_until = None;
        cb.flags = CtrlFlags::empty();
        cb.ctrl = TcpFlags::empty();
        cb.used_buff = 0;
        cb.sent_buff = 0;
        self.set_state(State::Closed);
        self.push(Effect::Closed {
            event,
            release,
            active,
            was_listener,
        });
    }
}
