//! The listen/clone coordinator.
//!
//! A SYN on a listening socket is turned into a cloned control block while the
//! backlog has room. Once it is exhausted by half-open children the listener
//! switches to cookie mode: SYNs are answered statelessly, and the control block
//! is only created when the final ACK of the handshake returns a valid cookie.

use super::cookie;
use super::machine::Outgoing;
use super::{DEFAULT_MSS, Error, Events, HEADER_LEN, MacError, Segment, State, Tcp, Tuple};
use crate::iface::{Context, TransmissionParams};
use crate::socket::{CloneError, SocketId};
use crate::wire::{TcpFlags, TcpSeqNumber};

impl Tcp {
    pub(super) fn process_listen(
        &mut self,
        cx: &mut Context,
        listener: SocketId,
        segment: &Segment,
        events: Events,
    ) -> Result<(), Error> {
        let repr = &segment.repr;
        if repr.flags.contains(TcpFlags::RST) {
            return Err(Error::Drop);
        }

        if let Some(ack) = repr.ack_number {
            let cookie_mode = cx
                .sockets
                .get(listener)
                .is_some_and(|cb| cb.last_overflow().is_some());
            let pure = !repr.flags.intersects(TcpFlags::SYN | TcpFlags::FIN);
            if cookie_mode && pure && events.contains(Events::ACK) {
                return self.cookie_ack(cx, listener, segment, ack);
            }
            net_debug!("{}: stale ACK from {}", listener, segment.remote);
            self.reply_reset(cx, segment);
            return Err(Error::Drop);
        }

        if repr.flags.contains(TcpFlags::SYN) && events.contains(Events::SYN) {
            return self.listen_syn(cx, listener, segment);
        }
        Err(Error::Drop)
    }

    fn resolve(&self, cx: &mut Context, segment: &Segment) -> Result<TransmissionParams, Error> {
        match cx
            .ip
            .resolve_transmission_params(Some(segment.local.addr), &segment.remote)
        {
            Ok(params) if params.max_payload > HEADER_LEN => Ok(params),
            Ok(params) => {
                net_debug!("unusable payload size {} towards {}", params.max_payload, segment.remote);
                Err(Error::Drop)
            }
            Err(err) => {
                net_debug!("cannot answer {}: {}", segment.remote, err);
                Err(Error::Drop)
            }
        }
    }

    fn listen_syn(&mut self, cx: &mut Context, listener: SocketId, segment: &Segment) -> Result<(), Error> {
        let repr = &segment.repr;
        let params = self.resolve(cx, segment)?;
        let recv_mss = params.max_payload - HEADER_LEN;
        let send_mss = repr.max_seg_size.unwrap_or(DEFAULT_MSS).min(recv_mss);
        let tuple = Tuple {
            local: segment.local,
            remote: segment.remote,
        };

        match cx.sockets.clone_listener(listener) {
            Ok(child) => {
                let iss = if self.config.syn_cookies {
                    match self.make_cookie(cx, &tuple, repr.seq_number, send_mss) {
                        Ok((cookie, _)) => cookie,
                        Err(err) => {
                            net_debug!("{}: cookie unavailable: {}", listener, err);
                            self.initial_seq_number(cx, &tuple.local, &tuple.remote)
                        }
                    }
                } else {
                    self.initial_seq_number(cx, &tuple.local, &tuple.remote)
                };
                self.with_cb(cx, listener, |cb| cb.last_overflow = None);
                tcp_trace!("{}: cloned {} for {}", listener, child, tuple.remote);
                self.run(cx, child, &[], |m| {
                    m.open_passive(listener, tuple, repr, iss, params.max_payload)
                })
            }
            Err(CloneError::Busy) if self.config.syn_cookies => {
                let seconds = cx.clock.current_time().seconds;
                self.with_cb(cx, listener, |cb| {
                    cb.last_overflow.get_or_insert(seconds);
                });
                let (cookie, mss) = self
                    .make_cookie(cx, &tuple, repr.seq_number, send_mss)
                    .map_err(|err| {
                        net_debug!("{}: cookie unavailable: {}", listener, err);
                        Error::Drop
                    })?;
                net_debug!(
                    "{}: backlog full, answering {} with a cookie",
                    listener,
                    tuple.remote
                );
                let mut outgoing = Outgoing::control(
                    tuple,
                    TcpFlags::SYN | TcpFlags::ACK,
                    cookie,
                    Some(repr.seq_number + 1),
                );
                outgoing.window = self.config.max_rx_window;
                outgoing.mss = Some(mss);
                let _ = self.transmit(cx, None, &outgoing);
                Ok(())
            }
            Err(CloneError::Busy) => {
                net_debug!("{}: backlog full, dropping SYN from {}", listener, tuple.remote);
                Err(Error::Drop)
            }
            Err(CloneError::Exhausted) => {
                net_debug!("{}: no socket left for {}", listener, tuple.remote);
                self.with_cb(cx, listener, |cb| cb.last_overflow = None);
                self.reply_reset(cx, segment);
                Err(Error::Drop)
            }
        }
    }

    /// The final ACK of a cookie handshake.
    fn cookie_ack(
        &mut self,
        cx: &mut Context,
        listener: SocketId,
        segment: &Segment,
        ack: TcpSeqNumber,
    ) -> Result<(), Error> {
        let repr = &segment.repr;
        let time = cx.clock.current_time();
        let grace = self.config.cookie_accept_grace;
        let in_grace = cx
            .sockets
            .get(listener)
            .and_then(|cb| cb.last_overflow())
            .is_some_and(|since| time.seconds.wrapping_sub(since) <= grace);
        let tuple = Tuple {
            local: segment.local,
            remote: segment.remote,
        };

        let mss = if in_grace {
            self.arm_cookie_rekey(cx);
            cookie::check(
                &mut *cx.mac,
                cookie::counter(time),
                &tuple.local,
                &tuple.remote,
                ack - 1,
                repr.seq_number - 1,
            )
            .unwrap_or_else(|err| {
                net_debug!("{}: cookie unverifiable: {}", listener, err);
                None
            })
        } else {
            None
        };
        let Some(mss) = mss else {
            net_debug!("{}: invalid cookie from {}", listener, tuple.remote);
            self.reply_reset(cx, segment);
            return Err(Error::Drop);
        };

        let params = self.resolve(cx, segment)?;
        let child = match cx.sockets.clone_listener(listener) {
            Err(CloneError::Busy) => match cx.sockets.oldest_half_open(listener) {
                Some(victim) => {
                    net_debug!("{}: recycling half-open {}", listener, victim);
                    let _ = self.run(cx, victim, &[], |m| m.abort());
                    cx.sockets.clone_listener(listener)
                }
                None => Err(CloneError::Busy),
            },
            result => result,
        };
        let child = match child {
            Ok(child) => child,
            Err(err) => {
                net_debug!("{}: cannot accept cookie from {}: {}", listener, tuple.remote, err);
                self.with_cb(cx, listener, |cb| cb.last_overflow = None);
                self.reply_reset(cx, segment);
                return Err(Error::Drop);
            }
        };

        net_debug!("{}: cookie accepted from {}, mss {}", listener, tuple.remote, mss);
        self.run(cx, child, &[], |m| {
            m.open_from_cookie(listener, tuple, repr, ack, mss, params.max_payload)
        })?;

        let survived = cx
            .sockets
            .get(child)
            .is_some_and(|cb| cb.state() == State::Established && cb.listener() == Some(listener));
        if survived && !repr.payload.is_empty() {
            self.process(cx, child, segment, Events::all());
        }
        Ok(())
    }

    fn arm_cookie_rekey(&mut self, cx: &Context) {
        if self.cookie_rekey_at.is_none() {
            self.cookie_rekey_at = Some(cx.now + self.config.cookie_key_lifetime);
        }
    }

    fn make_cookie(
        &mut self,
        cx: &mut Context,
        tuple: &Tuple,
        isn: TcpSeqNumber,
        mss: u16,
    ) -> Result<(TcpSeqNumber, u16), MacError> {
        self.arm_cookie_rekey(cx);
        let counter = cookie::counter(cx.clock.current_time());
        cookie::encode(&mut *cx.mac, counter, &tuple.local, &tuple.remote, isn, mss)
    }
}
