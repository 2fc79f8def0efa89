/*! Connection endpoints.

The `socket` module deals with *connection endpoints*. It contains the TCP engine,
the per-connection control blocks it drives, and the traits through which the engine
reaches the arena storing those blocks, the byte buffers backing them, and the
session layer above.

The programming interface differs from the Berkeley socket interface. Buffering
is explicit: the engine never owns payload memory and instead reserves capacity in
a [`BufferPool`] on behalf of each connection.
*/

use core::fmt;

use crate::wire::{IpEndpoint, IpListenEndpoint};

pub mod tcp;

/// An opaque handle addressing one control block in a [`SocketPool`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketId(pub(crate) usize);

impl SocketId {
    pub const fn new(index: usize) -> SocketId {
        SocketId(index)
    }

    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]

pub enum LifecycleEvent {
    /// The connection finished closing.
    Closed,
    /// The connection was reset by the peer or abandoned after its retry budget.
    Reset,
    /// The peer has finished sending.
    FinReceived,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            LifecycleEvent::Closed => write!(f, "CLOSED"),
            LifecycleEvent::Reset => write!(f, "RESET"),
            LifecycleEvent::FinReceived => write!(f, "FIN-RECEIVED"),
        }
    }
}

/// Answer of the session layer to an incoming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]

pub enum Acceptance {
    Accept,
    Reject,
}

/// The session layer above the TCP core.
///
/// Upcalls are made outside the exclusive area. Every method defaults to doing
/// nothing, and `on_accepted` defaults to accepting.
#[allow(unused_variables)]
pub trait SessionLayer {
    /// An actively opened connection reached ESTABLISHED.
    fn on_connected(&mut self, socket: SocketId) {}

    /// A passively opened connection reached ESTABLISHED.
    fn on_accepted(
        &mut self,
        listener: SocketId,
        socket: SocketId,
        remote: &IpEndpoint,
    ) -> Acceptance {
        Acceptance::Accept
    }

    /// In-order payload arrived.
    fn on_rx_data(&mut self, socket: SocketId, remote: &IpEndpoint, data: &[u8]) {}

    fn on_lifecycle_event(&mut self, socket: SocketId, event: LifecycleEvent) {}

    /// The peer acknowledged `len` queued bytes, which have been dropped
    /// from the send queue.
    fn on_tx_confirmed(&mut self, socket: SocketId, len: usize) {}
}

/// The shared byte pool backing every send queue.
///
/// Capacity is reserved per owner and counted in bytes. Queued bytes live in
/// the pool until acknowledged.
pub trait BufferPool {
    /// Reserve up to `len` more bytes for `owner`, returning the amount granted.
    fn reserve(&mut self, owner: SocketId, len: usize) -> usize;

    /// Return `len` reserved bytes of `owner` to the pool.
    fn release(&mut self, owner: SocketId, len: usize);

    /// Append `data` to the queue of `owner`. It always fits the reservation.
    fn write(&mut self, owner: SocketId, data: &[u8]);

    /// Copy queued bytes of `owner` starting `offset` bytes past the queue head.
    ///
    /// Returns the number of bytes copied.
    fn read(&self, owner: SocketId, offset: usize, buf: &mut [u8]) -> usize;

    /// Drop `len` bytes from the head of the queue of `owner`.
    fn discard(&mut self, owner: SocketId, len: usize);
}

/// Storage for segments received ahead of the next expected sequence number.
#[allow(unused_variables)]
pub trait Reassembly {
    /// Keep `data`, which starts `offset` bytes past the next expected byte.
    fn insert(&mut self, owner: SocketId, offset: usize, data: &[u8]) {}

    /// Forget everything held for `owner`.
    fn reset(&mut self, owner: SocketId) {}
}

/// A [`Reassembly`] that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReassembly;

impl Reassembly for NoReassembly {}

/// Error returned by [`SocketPool::clone_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]

pub enum CloneError {
    /// The backlog is full of connections that are still opening.
    Busy,
    /// No storage is left and every child of the listener is established.
    Exhausted,
}

impl fmt::Display for CloneError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CloneError::Busy => write!(f, "backlog busy"),
            CloneError::Exhausted => write!(f, "socket pool exhausted"),
        }
    }
}

impl core::error::Error for CloneError {}

/// The arena of control blocks.
///
/// Slots are addressed by [`SocketId`] and indexed from zero up to `capacity()`.
pub trait SocketPool {
    fn capacity(&self) -> usize;

    fn get(&self, id: SocketId) -> Option<&tcp::ControlBlock>;

    fn get_mut(&mut self, id: SocketId) -> Option<&mut tcp::ControlBlock>;

    /// Create a control block in CLOSED.
    fn allocate(&mut self) -> Option<SocketId>;

    /// Copy the listener at `listener` into a fresh slot, honouring its backlog.
    ///
    /// The child records the listener it was cloned from.
    fn clone_listener(&mut self, listener: SocketId) -> Result<SocketId, CloneError>;

    /// The child of `listener` that has been half-open the longest.
    fn oldest_half_open(&self, listener: SocketId) -> Option<SocketId>;

    /// Return the slot at `id` to the arena.
    fn close_socket(&mut self, id: SocketId);

    /// A local port no other control block is bound to.
    fn ephemeral_port(&mut self) -> Option<u16>;

    /// Number of control blocks cloned from `listener` that are still open.
    fn children(&self, listener: SocketId) -> usize {
        (0..self.capacity())
            .filter_map(|index| self.get(SocketId(index)))
            .filter(|cb| cb.listener() == Some(listener))
            .count()
    }

    /// Find the control block a segment between `local` and `remote` belongs to.
    ///
    /// Synchronized connections take precedence over listeners.
    fn lookup(&self, local: &IpEndpoint, remote: &IpEndpoint) -> Option<SocketId> {
        let mut listener = None;
        for index in 0..self.capacity() {
            let id = SocketId(index);
            let Some(cb) = self.get(id) else { continue };
            if !cb.local_endpoint().accepts(local) {
                continue;
            }
            match cb.state() {
                tcp::State::Closed => (),
                tcp::State::Listen => {
                    if listener.is_none() {
                        listener = Some(id)
                    }
                }
                _ if cb.remote_endpoint() == Some(*remote) => return Some(id),
                _ => (),
            }
        }
        listener
    }

    /// Find a listener bound to exactly `local`.
    fn listener_on(&self, local: &IpListenEndpoint) -> Option<SocketId> {
        (0..self.capacity()).map(SocketId).find(|&id| {
            self.get(id).is_some_and(|cb| {
                cb.state() == tcp::State::Listen && cb.local_endpoint() == *local
            })
        })
    }
}
