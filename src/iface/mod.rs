/*! Collaborator interfaces.

The `iface` module describes everything the TCP core is driven against: the IP layer
underneath it, the exclusive area guarding control blocks, the socket arena, and the
[`Context`] bundling them for a single call into the engine.
*/

mod exclusive;
mod ip;
mod socket_set;

pub use self::exclusive::{ExclusiveArea, Guard, Unguarded};
pub use self::ip::{IpLayer, ResolveError, TransmissionParams, TransmitError};
pub use self::socket_set::{SocketSet, SocketStorage};

use crate::socket::tcp::Mac;
use crate::socket::{BufferPool, Reassembly, SessionLayer, SocketPool};
use crate::time::{Instant, TimeBase};

/// The collaborators one engine call runs against.
///
/// The fields are borrowed independently so that a control block taken out of
/// `sockets` can be mutated while the other collaborators are in use.
pub struct Context<'a> {
    pub now: Instant,
    pub ip: &'a mut dyn IpLayer,
    pub sockets: &'a mut dyn SocketPool,
    pub buffers: &'a mut dyn BufferPool,
    pub reassembly: &'a mut dyn Reassembly,
    pub mac: &'a mut dyn Mac,
    pub upper: &'a mut dyn SessionLayer,
    pub clock: &'a dyn TimeBase,
    pub area: &'a dyn ExclusiveArea,
}

impl<'a> Context<'a> {
    /// Replace the exclusive area, which defaults to [`Unguarded`].
    pub fn with_exclusive_area(mut self, area: &'a dyn ExclusiveArea) -> Context<'a> {
        self.area = area;
        self
    }

    /// The default exclusive area.
    pub fn unguarded() -> &'static dyn ExclusiveArea {
        &exclusive::UNGUARDED
    }
}
