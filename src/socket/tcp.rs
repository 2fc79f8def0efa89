// Heads up! Before working on this file you should read, at least, RFC 793 and
// the parts of RFC 1122 that discuss TCP. SYN cookies follow RFC 4987, unpredictable
// initial sequence numbers follow RFC 6528.

use core::fmt;
use core::fmt::Display;

use bitflags::bitflags;

use crate::config::TCP_SCRATCH_LEN;
use crate::iface::{Context, Guard};
use crate::socket::{Acceptance, LifecycleEvent, SocketId};
use crate::time::{Duration, Instant};
use crate::wire::{IpEndpoint, IpListenEndpoint, TcpFlags, TcpRepr, TcpSeqNumber};

macro_rules! tcp_trace {
    ($($arg:expr),*) => (net_log!(trace, $($arg),*));
}

mod admission;
mod cookie;
mod listen;
mod machine;
mod siphash;
mod timer;


pub use self::cookie::{Mac, MacError, MacJob};
pub use self::siphash::SipMac;
pub use self::timer::{AckTimer, Suppression, Timer};

use self::cookie::IsnGenerator;
use self::machine::{Effect, Effects, Machine, Outgoing, Recovery};

/// Error returned by [`Tcp::listen`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]

pub enum ListenError {
    NoSuchSocket,
    InvalidState,
    AddressInUse,
    Unaddressable,
}

impl Display for ListenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ListenError::NoSuchSocket => write!(f, "no such socket"),
            ListenError::InvalidState => write!(f, "invalid state"),
            ListenError::AddressInUse => write!(f, "address in use"),
            ListenError::Unaddressable => write!(f, "unaddressable destination"),
        }
    }
}

impl core::error::Error for ListenError {}

/// Error returned by [`Tcp::connect`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]

pub enum ConnectError {
    NoSuchSocket,
    InvalidState,
    Unaddressable,
    NoRoute,
}

impl Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConnectError::NoSuchSocket => write!(f, "no such socket"),
            ConnectError::InvalidState => write!(f, "invalid state"),
            ConnectError::Unaddressable => write!(f, "unaddressable destination"),
            ConnectError::NoRoute => write!(f, "no route to destination"),
        }
    }
}

impl core::error::Error for ConnectError {}

/// Error returned by [`Tcp::send`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]

pub enum SendError {
    NoSuchSocket,
    InvalidState,
    BufferExhausted,
}

impl Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SendError::NoSuchSocket => write!(f, "no such socket"),
            SendError::InvalidState => write!(f, "invalid state"),
            SendError::BufferExhausted => write!(f, "buffer exhausted"),
        }
    }
}

impl core::error::Error for SendError {}

/// Error returned by [`Tcp::close`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]

pub enum CloseError {
    NoSuchSocket,
    InvalidState,
}

impl Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CloseError::NoSuchSocket => write!(f, "no such socket"),
            CloseError::InvalidState => write!(f, "invalid state"),
        }
    }
}

impl core::error::Error for CloseError {}

/// Error returned by [`Tcp::notify_consumed`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]

pub enum ConsumeError {
    NoSuchSocket,
    InvalidState,
    WindowOverflow,
}

impl Display for ConsumeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConsumeError::NoSuchSocket => write!(f, "no such socket"),
            ConsumeError::InvalidState => write!(f, "invalid state"),
            ConsumeError::WindowOverflow => write!(f, "receive window overflow"),
        }
    }
}

impl core::error::Error for ConsumeError {}

/// Outcome of a transition that did not simply proceed.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum Error {
    /// The segment is discarded, the connection is unaffected.
    Drop,
    /// No datagram buffer was available for an outgoing segment.
    SendFailed,
    /// The operation is not valid in the current state.
    NotPermitted,
    /// The connection is over and enters CLOSED.
    Fatal(LifecycleEvent),
}

/// The state of a TCP socket, according to [RFC 793].
///
/// [RFC 793]: https://tools.ietf.org/html/rfc793
#[derive(Debug, PartialEq, Eq, Clone, Copy)]

pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            State::Closed => write!(f, "CLOSED"),
            State::Listen => write!(f, "LISTEN"),
            State::SynSent => write!(f, "SYN-SENT"),
            State::SynReceived => write!(f, "SYN-RECEIVED"),
            State::Established => write!(f, "ESTABLISHED"),
            State::FinWait1 => write!(f, "FIN-WAIT-1"),
            State::FinWait2 => write!(f, "FIN-WAIT-2"),
            State::CloseWait => write!(f, "CLOSE-WAIT"),
            State::Closing => write!(f, "CLOSING"),
            State::LastAck => write!(f, "LAST-ACK"),
            State::TimeWait => write!(f, "TIME-WAIT"),
        }
    }
}

impl State {
    /// States whose retransmissions are bounded by the SYN retry budget.
    pub(crate) fn is_handshake(&self) -> bool {
        matches!(*self, State::SynSent | State::SynReceived)
    }

    /// States in which the peer may still consider the connection open, so an
    /// abort has to tell it with a reset.
    pub(crate) fn peer_may_be_live(&self) -> bool {
        matches!(
            *self,
            State::SynReceived
                | State::Established
                | State::FinWait1
                | State::FinWait2
                | State::CloseWait
        )
    }
}

/// Default MSS assumed when the peer offers none.
pub(crate) const DEFAULT_MSS: u16 = 536;

/// Length of a TCP header without options.
pub(crate) const HEADER_LEN: u16 = crate::wire::TCP_HEADER_LEN as u16;

/// Runtime tunables of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Maximum segment lifetime. TIME-WAIT lasts twice as long.
    pub msl: Duration,
    /// Bound on FIN-WAIT-2 without a FIN from the peer.
    pub fin_wait_2_timeout: Duration,
    /// Bound on SYN-RECEIVED, independent of the SYN+ACK retransmissions.
    pub syn_received_timeout: Duration,
    /// Retransmission timeout.
    pub rtx_timeout: Duration,
    /// Retransmissions of SYN and SYN+ACK before the connection is reset.
    pub max_syn_retx: u8,
    /// Retransmissions of data and FIN before the connection is reset.
    pub max_retx: u8,
    /// Attempts at an ACK that could not be sent before the connection is reset.
    pub max_transient_retries: u8,
    pub delayed_ack_timeout: Duration,
    /// Minimum spacing of ACKs answering unacceptable segments.
    pub dup_ack_timeout: Duration,
    /// Receive window advertised by new connections.
    pub max_rx_window: u16,
    pub keep_alive: bool,
    /// Idle time before the first keep-alive probe.
    pub keep_alive_time: Duration,
    pub keep_alive_interval: Duration,
    /// Unanswered probes before the connection is reset.
    pub keep_alive_probes: u8,
    pub nagle: bool,
    /// Answer SYNs with cookies once a listen backlog is exhausted.
    pub syn_cookies: bool,
    pub unpredictable_isn: bool,
    /// Advance of the ISN counter on every tick.
    pub isn_tick_increment: u32,
    /// Seconds after the last backlog overflow during which cookie ACKs are accepted.
    pub cookie_accept_grace: u32,
    pub cookie_key_lifetime: Duration,
    pub isn_key_lifetime: Duration,
    /// Ignore resets in TIME-WAIT, see RFC 1337.
    pub time_wait_ignores_rst: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            msl: Duration::from_secs(30),
            fin_wait_2_timeout: Duration::from_secs(60),
            syn_received_timeout: Duration::from_secs(10),
            rtx_timeout: Duration::from_secs(1),
            max_syn_retx: 3,
            max_retx: 5,
            max_transient_retries: 4,
            delayed_ack_timeout: Duration::from_millis(200),
            dup_ack_timeout: Duration::from_millis(500),
            max_rx_window: 8192,
            keep_alive: false,
            keep_alive_time: Duration::from_secs(7200),
            keep_alive_interval: Duration::from_secs(75),
            keep_alive_probes: 9,
            nagle: true,
            syn_cookies: true,
            unpredictable_isn: false,
            isn_tick_increment: 1,
            cookie_accept_grace: 128,
            cookie_key_lifetime: Duration::from_secs(256),
            isn_key_lifetime: Duration::from_secs(3600),
            time_wait_ignores_rst: false,
        }
    }
}

bitflags! {
    /// Status bits of a control block.
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    pub struct CtrlFlags: u8 {
        /// The session layer knows this connection and gets lifecycle upcalls.
        const ACTIVE = 0x01;
        /// A graceful close runs on the next tick.
        const CLOSE_REQUESTED = 0x02;
        /// Queued data goes out on the next tick.
        const TRANSMIT_PENDING = 0x04;
        const KEEP_ALIVE = 0x08;
        const NAGLE = 0x10;
        /// A segment could not be sent and is replayed on the next tick.
        const RETRY = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]

pub struct Tuple {
    pub local: IpEndpoint,
    pub remote: IpEndpoint,
}

impl Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

/// The per-connection state record.
#[derive(Debug, Clone)]
pub struct ControlBlock {
    pub(crate) state: State,
    pub(crate) flags: CtrlFlags,
    /// Control bits still waiting for their acknowledgement.
    pub(crate) ctrl: TcpFlags,

    pub(crate) send_una: TcpSeqNumber,
    pub(crate) send_nxt: TcpSeqNumber,
    pub(crate) send_wl1: TcpSeqNumber,
    pub(crate) send_wl2: TcpSeqNumber,
    pub(crate) recv_nxt: TcpSeqNumber,

    pub(crate) send_wnd: u32,
    pub(crate) recv_wnd: u32,
    pub(crate) recv_wndmax: u32,
    pub(crate) send_mss: u16,
    pub(crate) recv_mss: u16,
    /// Received bytes not yet acknowledged.
    pub(crate) num_unack: u32,

    pub(crate) timer: Timer,
    pub(crate) ack_timer: AckTimer,
    pub(crate) dup_ack_seq: Suppression,
    pub(crate) dup_ack_ack: Suppression,
    pub(crate) num_rtx: u8,
    /// Deadline of the handshake while in SYN-RECEIVED.
    pub(crate) syn_received_until: Option<Instant>,

    pub(crate) used_buff: usize,
    pub(crate) sent_buff: usize,
    pub(crate) avail_buff: usize,

    /// Seconds of the first unanswered backlog overflow.
    pub(crate) last_overflow: Option<u32>,
    pub(crate) backlog: usize,
    pub(crate) listener: Option<SocketId>,

    pub(crate) local: IpListenEndpoint,
    pub(crate) remote: Option<IpEndpoint>,
}

impl Default for ControlBlock {
    fn default() -> ControlBlock {
        ControlBlock::new()
    }
}

impl ControlBlock {
    pub fn new() -> ControlBlock {
        ControlBlock {
            state: State::Closed,
            flags: CtrlFlags::empty(),
            ctrl: TcpFlags::empty(),
            send_una: TcpSeqNumber::default(),
            send_nxt: TcpSeqNumber::default(),
            send_wl1: TcpSeqNumber::default(),
            send_wl2: TcpSeqNumber::default(),
            recv_nxt: TcpSeqNumber::default(),
            send_wnd: 0,
            recv_wnd: 0,
            recv_wndmax: 0,
            send_mss: DEFAULT_MSS,
            recv_mss: DEFAULT_MSS,
            num_unack: 0,
            timer: Timer::Idle,
            ack_timer: AckTimer::Idle,
            dup_ack_seq: Suppression::default(),
            dup_ack_ack: Suppression::default(),
            num_rtx: 0,
            syn_received_until: None,
            used_buff: 0,
            sent_buff: 0,
            avail_buff: 0,
            last_overflow: None,
            backlog: 0,
            listener: None,
            local: IpListenEndpoint::default(),
            remote: None,
        }
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn flags(&self) -> CtrlFlags {
        self.flags
    }

    #[inline]
    pub fn local_endpoint(&self) -> IpListenEndpoint {
        self.local
    }

    #[inline]
    pub fn remote_endpoint(&self) -> Option<IpEndpoint> {
        self.remote
    }

    /// The listener a passively opened connection was cloned from.
    #[inline]
    pub fn listener(&self) -> Option<SocketId> {
        self.listener
    }

    #[inline]
    pub fn backlog(&self) -> usize {
        self.backlog
    }

    pub fn send_una(&self) -> TcpSeqNumber {
        self.send_una
    }

    pub fn send_nxt(&self) -> TcpSeqNumber {
        self.send_nxt
    }

    pub fn recv_nxt(&self) -> TcpSeqNumber {
        self.recv_nxt
    }

    pub fn recv_wnd(&self) -> u32 {
        self.recv_wnd
    }

    pub fn send_wnd(&self) -> u32 {
        self.send_wnd
    }

    pub fn send_mss(&self) -> u16 {
        self.send_mss
    }

    pub fn recv_mss(&self) -> u16 {
        self.recv_mss
    }

    pub fn timer(&self) -> Timer {
        self.timer
    }

    pub fn ack_timer(&self) -> AckTimer {
        self.ack_timer
    }

    pub fn num_rtx(&self) -> u8 {
        self.num_rtx
    }

    pub fn syn_received_until(&self) -> Option<Instant> {
        self.syn_received_until
    }

    /// Bytes queued and not yet acknowledged.
    pub fn used_buff(&self) -> usize {
        self.used_buff
    }

    /// Bytes reserved from the buffer pool.
    pub fn avail_buff(&self) -> usize {
        self.avail_buff
    }

    pub fn last_overflow(&self) -> Option<u32> {
        self.last_overflow
    }

    pub(crate) fn tuple(&self) -> Option<Tuple> {
        Some(Tuple {
            local: IpEndpoint::new(self.local.addr?, self.local.port),
            remote: self.remote?,
        })
    }

    fn may_send(&self) -> bool {
        matches!(self.state, State::Established | State::CloseWait)
            && !self.flags.contains(CtrlFlags::CLOSE_REQUESTED)
    }
}

/// An inbound segment together with the endpoints it travelled between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub local: IpEndpoint,
    pub remote: IpEndpoint,
    pub repr: TcpRepr<'a>,
}

bitflags! {
    /// Parts of a segment an entry point processes.
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    pub(crate) struct Events: u8 {
        const SYN = 0x01;
        const ACK = 0x02;
        const DATA = 0x04;
        const FIN = 0x08;
        const RST = 0x10;
    }
}

/// The TCP engine.
///
/// Holds what is shared between connections: the configuration, the ISN counter
/// and the key schedule of the MAC. Everything per connection lives in the
/// [`ControlBlock`]s of the socket pool in [`Context`].
#[derive(Debug)]
pub struct Tcp {
    config: Config,
    isn: IsnGenerator,
    cookie_rekey_at: Option<Instant>,
    isn_rekey_at: Option<Instant>,
}

impl Tcp {
    pub fn new(config: Config) -> Tcp {
        Tcp::with_isn_seed(config, 0)
    }

    /// Create an engine whose ISN counter starts at `seed`.
    pub fn with_isn_seed(config: Config, seed: u32) -> Tcp {
        Tcp {
            config,
            isn: IsnGenerator::new(seed),
            cookie_rekey_at: None,
            isn_rekey_at: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connect to a given endpoint.
    ///
    /// The local port must be provided, or zero to pick an ephemeral one. The
    /// local address may be left unspecified, in which case the IP layer picks it.
    ///
    /// The SYN goes out immediately. A SYN that cannot be sent is retried
    /// like a retransmission.
    pub fn connect<T, U>(
        &mut self,
        cx: &mut Context,
        id: SocketId,
        remote: T,
        local: U,
    ) -> Result<(), ConnectError>
    where
        T: Into<IpEndpoint>,
        U: Into<IpListenEndpoint>,
    {
        let remote = remote.into();
        let mut local = local.into();

        if remote.port == 0 || remote.addr.is_unspecified() {
            return Err(ConnectError::Unaddressable);
        }
        match cx.sockets.get(id) {
            None => return Err(ConnectError::NoSuchSocket),
            Some(cb) if cb.state() != State::Closed => return Err(ConnectError::InvalidState),
            Some(_) => (),
        }
        if local.port == 0 {
            local.port = cx
                .sockets
                .ephemeral_port()
                .ok_or(ConnectError::Unaddressable)?;
        }

        let params = cx
            .ip
            .resolve_transmission_params(local.addr, &remote)
            .map_err(|err| {
                net_debug!("{}: cannot reach {}: {}", id, remote, err);
                ConnectError::NoRoute
            })?;
        if params.max_payload <= HEADER_LEN {
            return Err(ConnectError::NoRoute);
        }

        let local = IpEndpoint::new(params.local_addr, local.port);
        let iss = self.initial_seq_number(cx, &local, &remote);
        let tuple = Tuple { local, remote };
        self.run(cx, id, &[], |m| m.connect(tuple, iss, params.max_payload))
            .map_err(|_| ConnectError::InvalidState)
    }

    /// Start listening on the given endpoint.
    ///
    /// A `backlog` of zero admits as many children as the socket pool holds.
    pub fn listen<T>(
        &mut self,
        cx: &mut Context,
        id: SocketId,
        local: T,
        backlog: usize,
    ) -> Result<(), ListenError>
    where
        T: Into<IpListenEndpoint>,
    {
        let local = local.into();
        if local.port == 0 {
            return Err(ListenError::Unaddressable);
        }
        match cx.sockets.get(id) {
            None => return Err(ListenError::NoSuchSocket),
            Some(cb) if cb.state() != State::Closed => return Err(ListenError::InvalidState),
            Some(_) => (),
        }
        if cx.sockets.listener_on(&local).is_some() {
            return Err(ListenError::AddressInUse);
        }

        self.run(cx, id, &[], |m| m.listen(local, backlog))
            .map_err(|_| ListenError::InvalidState)
    }

    /// Close the connection.
    ///
    /// A graceful close sends a FIN once queued data is out, on the next tick.
    /// An abort resets a connection the peer may still consider open and
    /// releases the control block at once.
    pub fn close(&mut self, cx: &mut Context, id: SocketId, graceful: bool) -> Result<(), CloseError> {
        if cx.sockets.get(id).is_none() {
            return Err(CloseError::NoSuchSocket);
        }
        let result = if graceful {
            self.run(cx, id, &[], |m| m.request_close())
        } else {
            self.run(cx, id, &[], |m| m.abort())
        };
        match result {
            Ok(()) | Err(Error::Fatal(_)) => Ok(()),
            Err(_) => Err(CloseError::InvalidState),
        }
    }

    /// Queue `data` for transmission, returning how much of it was accepted.
    ///
    /// The amount is limited by what the buffer pool grants. Queued data goes
    /// out on the next tick, or with the next inbound ACK.
    pub fn send(&mut self, cx: &mut Context, id: SocketId, data: &[u8]) -> Result<usize, SendError> {
        let _guard = Guard::new(cx.area);
        let cb = cx.sockets.get_mut(id).ok_or(SendError::NoSuchSocket)?;
        if !cb.may_send() {
            return Err(SendError::InvalidState);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let free = cb.avail_buff - cb.used_buff;
        if free < data.len() {
            let granted = cx.buffers.reserve(id, data.len() - free);
            cb.avail_buff += granted;
        }
        let len = data.len().min(cb.avail_buff - cb.used_buff);
        if len == 0 {
            return Err(SendError::BufferExhausted);
        }

        cx.buffers.write(id, &data[..len]);
        cb.used_buff += len;
        cb.flags.insert(CtrlFlags::TRANSMIT_PENDING);
        tcp_trace!("{}: queued {} octets", id, len);
        Ok(len)
    }

    /// Give `len` octets of receive window back after the session layer
    /// consumed delivered data.
    pub fn notify_consumed(
        &mut self,
        cx: &mut Context,
        id: SocketId,
        len: usize,
    ) -> Result<(), ConsumeError> {
        if cx.sockets.get(id).is_none() {
            return Err(ConsumeError::NoSuchSocket);
        }
        let mut outcome = Ok(());
        let _ = self.run(cx, id, &[], |m| {
            outcome = m.notify_consumed(len);
            Ok(())
        });
        outcome
    }

    /// Process an inbound segment.
    ///
    /// Segments matching no control block are answered with a reset.
    pub fn on_segment(&mut self, cx: &mut Context, segment: &Segment) {
        self.dispatch(cx, segment, Events::all())
    }

    /// Process the SYN of an inbound segment.
    pub fn on_syn(&mut self, cx: &mut Context, segment: &Segment) {
        self.dispatch(cx, segment, Events::SYN)
    }

    /// Process the acknowledgement of an inbound segment.
    pub fn on_ack(&mut self, cx: &mut Context, segment: &Segment) {
        self.dispatch(cx, segment, Events::ACK)
    }

    /// Process the acknowledgement and payload of an inbound segment.
    pub fn on_data(&mut self, cx: &mut Context, segment: &Segment) {
        self.dispatch(cx, segment, Events::ACK | Events::DATA)
    }

    /// Process the acknowledgement and FIN of an inbound segment.
    pub fn on_fin(&mut self, cx: &mut Context, segment: &Segment) {
        self.dispatch(cx, segment, Events::ACK | Events::FIN)
    }

    /// Process the RST of an inbound segment.
    pub fn on_rst(&mut self, cx: &mut Context, segment: &Segment) {
        self.dispatch(cx, segment, Events::RST)
    }

    /// Expire timers and flush pending work of every connection.
    pub fn tick(&mut self, cx: &mut Context) {
        self.isn.tick(self.config.isn_tick_increment);
        self.rekey(cx);

        for index in 0..cx.sockets.capacity() {
            let id = SocketId(index);
            match cx.sockets.get(id).map(|cb| cb.state()) {
                None | Some(State::Closed) | Some(State::Listen) => continue,
                Some(_) => (),
            }
            if let Err(err) = self.run(cx, id, &[], |m| m.tick()) {
                tcp_trace!("{}: tick ended with {:?}", id, err);
            }
        }
    }

    fn dispatch(&mut self, cx: &mut Context, segment: &Segment, events: Events) {
        let Some(id) = cx.sockets.lookup(&segment.local, &segment.remote) else {
            net_debug!(
                "no socket for {} from {}, {}",
                segment.local,
                segment.remote,
                segment.repr
            );
            self.reply_reset(cx, segment);
            return;
        };
        tcp_trace!("{}: received {}", id, segment.repr);
        self.process(cx, id, segment, events);
    }

    fn process(&mut self, cx: &mut Context, id: SocketId, segment: &Segment, events: Events) {
        let result = match cx.sockets.get(id).map(|cb| cb.state()) {
            None | Some(State::Closed) => Err(Error::Drop),
            Some(State::Listen) => self.process_listen(cx, id, segment, events),
            Some(_) => self.run(cx, id, segment.repr.payload, |m| {
                m.process(&segment.repr, events)
            }),
        };
        match result {
            Err(Error::Drop) => net_debug!("{}: dropped {}", id, segment.repr),
            Err(Error::Fatal(event)) => tcp_trace!("{}: closed with {}", id, event),
            _ => (),
        }
    }

    /// Run a transition on the control block `id` inside the exclusive area,
    /// then apply its effects outside of it.
    ///
    /// `payload` is the payload of the segment being processed, if any.
    fn run<F>(&mut self, cx: &mut Context, id: SocketId, payload: &[u8], f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Machine<'_>) -> Result<(), Error>,
    {
        let mut effects = Effects::new();
        let result = {
            let _guard = Guard::new(cx.area);
            let Some(cb) = cx.sockets.get_mut(id) else {
                return Err(Error::Drop);
            };
            let mut m = Machine::new(id, cb, &self.config, cx.now, &mut effects);
            let result = f(&mut m);
            if let Err(Error::Fatal(event)) = result {
                m.enter_closed(event);
            }
            result
        };
        self.apply(cx, id, payload, effects);
        result
    }

    /// Modify the control block `id` inside the exclusive area.
    fn with_cb<R, F>(&self, cx: &mut Context, id: SocketId, f: F) -> Option<R>
    where
        F: FnOnce(&mut ControlBlock) -> R,
    {
        let _guard = Guard::new(cx.area);
        cx.sockets.get_mut(id).map(f)
    }

    fn apply(&mut self, cx: &mut Context, id: SocketId, payload: &[u8], effects: Effects) {
        for effect in effects {
            match effect {
                Effect::Transmit(outgoing) => {
                    if let Err(Error::SendFailed) = self.transmit(cx, Some(id), &outgoing) {
                        self.recover(cx, id, outgoing.recovery);
                    }
                }
                Effect::Connected => cx.upper.on_connected(id),
                Effect::Accepted { listener, remote } => {
                    if !self.accept(cx, listener, id, &remote) {
                        return;
                    }
                }
                Effect::RxData { remote, range } => {
                    if let Some(data) = payload.get(range.offset..range.offset + range.len) {
                        cx.upper.on_rx_data(id, &remote, data)
                    }
                }
                Effect::Reassemble { offset, range } => {
                    if let Some(data) = payload.get(range.offset..range.offset + range.len) {
                        cx.reassembly.insert(id, offset, data)
                    }
                }
                Effect::TxConfirmed(len) => {
                    cx.buffers.discard(id, len);
                    cx.upper.on_tx_confirmed(id, len);
                }
                Effect::Lifecycle(event) => cx.upper.on_lifecycle_event(id, event),
                Effect::Closed {
                    event,
                    release,
                    active,
                    was_listener,
                } => {
                    if release > 0 {
                        cx.buffers.release(id, release);
                    }
                    cx.reassembly.reset(id);
                    if active {
                        cx.upper.on_lifecycle_event(id, event);
                    }
                    cx.sockets.close_socket(id);
                    if was_listener {
                        self.orphan_children(cx, id);
                    }
                    return;
                }
            }
        }
    }

    fn transmit(&self, cx: &mut Context, owner: Option<SocketId>, outgoing: &Outgoing) -> Result<(), Error> {
        let mut scratch = [0u8; TCP_SCRATCH_LEN];
        let payload = match (owner, outgoing.data) {
            (Some(id), Some(range)) => {
                let len = range.len.min(TCP_SCRATCH_LEN);
                let read = cx.buffers.read(id, range.offset, &mut scratch[..len]);
                &scratch[..read]
            }
            _ => &[][..],
        };
        let repr = TcpRepr {
            src_port: outgoing.tuple.local.port,
            dst_port: outgoing.tuple.remote.port,
            flags: outgoing.flags,
            seq_number: outgoing.seq,
            ack_number: outgoing.ack,
            window_len: outgoing.window,
            max_seg_size: outgoing.mss,
            payload,
        };
        tcp_trace!("{}: sending {}", outgoing.tuple, repr);
        cx.ip
            .transmit(&outgoing.tuple.local, &outgoing.tuple.remote, &repr)
            .map_err(|err| {
                net_debug!("{}: cannot send {}: {}", outgoing.tuple, repr, err);
                Error::SendFailed
            })
    }

    fn recover(&mut self, cx: &mut Context, id: SocketId, recovery: Recovery) {
        self.with_cb(cx, id, |cb| match recovery {
            Recovery::Ignore => (),
            Recovery::Retry => cb.flags.insert(CtrlFlags::RETRY),
            Recovery::AckRetry { attempts } => cb.ack_timer = AckTimer::Retry { attempts },
        });
    }

    /// Let the session layer decide on a passively opened connection.
    ///
    /// Returns whether the connection survived.
    fn accept(&mut self, cx: &mut Context, listener: SocketId, id: SocketId, remote: &IpEndpoint) -> bool {
        let listening = cx
            .sockets
            .get(listener)
            .is_some_and(|cb| cb.state() == State::Listen);
        let answer = if listening {
            cx.upper.on_accepted(listener, id, remote)
        } else {
            net_debug!("{}: listener {} is gone", id, listener);
            Acceptance::Reject
        };

        match answer {
            Acceptance::Accept => {
                self.with_cb(cx, id, |cb| cb.flags.insert(CtrlFlags::ACTIVE));
                true
            }
            Acceptance::Reject => {
                tcp_trace!("{}: rejected by the session layer", id);
                let _ = self.run(cx, id, &[], |m| m.abort());
                false
            }
        }
    }

    /// Abort the children of a closed listener that are still opening, and
    /// detach the others.
    fn orphan_children(&mut self, cx: &mut Context, listener: SocketId) {
        for index in 0..cx.sockets.capacity() {
            let child = SocketId(index);
            let half_open = self
                .with_cb(cx, child, |cb| {
                    if cb.listener != Some(listener) {
                        return false;
                    }
                    if cb.state == State::SynReceived {
                        return true;
                    }
                    cb.listener = None;
                    false
                })
                .unwrap_or(false);
            if half_open {
                let _ = self.run(cx, child, &[], |m| m.abort());
            }
        }
    }

    /// Answer a segment with a reset, see RFC 793 p. 36.
    fn reply_reset(&mut self, cx: &mut Context, segment: &Segment) {
        let repr = &segment.repr;
        if repr.flags.contains(TcpFlags::RST) {
            return;
        }
        let tuple = Tuple {
            local: segment.local,
            remote: segment.remote,
        };
        let outgoing = match repr.ack_number {
            Some(ack) => Outgoing::control(tuple, TcpFlags::RST, ack, None),
            None => Outgoing::control(
                tuple,
                TcpFlags::RST | TcpFlags::ACK,
                TcpSeqNumber(0),
                Some(repr.seq_number + repr.segment_len() as u32),
            ),
        };
        let _ = self.transmit(cx, None, &outgoing);
    }

    fn initial_seq_number(&mut self, cx: &mut Context, local: &IpEndpoint, remote: &IpEndpoint) -> TcpSeqNumber {
        if !self.config.unpredictable_isn {
            return self.isn.next();
        }
        if self.isn_rekey_at.is_none() {
            self.isn_rekey_at = Some(cx.now + self.config.isn_key_lifetime);
        }
        match self.isn.next_unpredictable(cx.mac, local, remote) {
            Ok(iss) => iss,
            Err(err) => {
                net_debug!("unpredictable isn unavailable: {}", err);
                self.isn.next()
            }
        }
    }

    fn rekey(&mut self, cx: &mut Context) {
        if self.cookie_rekey_at.is_some_and(|at| cx.now >= at) {
            self.cookie_rekey_at = None;
            for job in [MacJob::CookieKey1, MacJob::CookieKey2] {
                if let Err(err) = cx.mac.regenerate_key(job) {
                    net_debug!("cannot regenerate {:?}: {}", job, err);
                }
            }
            tcp_trace!("syn cookie keys regenerated");
        }
        if self.isn_rekey_at.is_some_and(|at| cx.now >= at) {
            self.isn_rekey_at = None;
            if let Err(err) = cx.mac.regenerate_key(MacJob::IsnKey) {
                net_debug!("cannot regenerate {:?}: {}", MacJob::IsnKey, err);
            }
        }
    }
}
