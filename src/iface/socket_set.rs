use core::fmt;

use managed::ManagedSlice;

use crate::socket::tcp::{ControlBlock, State};
use crate::socket::{CloneError, SocketId, SocketPool};

const EPHEMERAL_PORTS: core::ops::RangeInclusive<u16> = 49152..=65535;

/// An item of a socket set.
///
/// The only reason this struct is public is to allow the socket set storage
/// to be allocated externally.
#[derive(Debug, Default)]
pub struct SocketStorage {
    inner: Option<Item>,
}

impl SocketStorage {
    pub const EMPTY: Self = Self { inner: None };
}

/// A control block and the order it was allocated in.
#[derive(Debug)]
struct Item {
    cb: ControlBlock,
    stamp: u64,
}

/// An extensible set of control blocks.
///
/// The lifetime `'a` is the borrow of the slot storage. A borrowed slice is a
/// fixed pool that refuses allocations once every slot is taken. An owned
/// `Vec` grows instead; use `SocketSet<'static>` for it.
pub struct SocketSet<'a> {
    sockets: ManagedSlice<'a, SocketStorage>,
    stamp: u64,
    next_port: u16,
}

impl<'a> SocketSet<'a> {
    /// Create a socket set using the provided storage.
    pub fn new<SocketsT>(sockets: SocketsT) -> SocketSet<'a>
    where
        SocketsT: Into<ManagedSlice<'a, SocketStorage>>,
    {
        let sockets = sockets.into();
        SocketSet {
            sockets,
            stamp: 0,
            next_port: *EPHEMERAL_PORTS.start(),
        }
    }

    /// Start handing out ephemeral ports from `port`.
    pub fn set_ephemeral_port(&mut self, port: u16) {
        self.next_port = port.max(*EPHEMERAL_PORTS.start());
    }

    /// Iterate every live control block.
    pub fn iter(&self) -> impl Iterator<Item = (SocketId, &ControlBlock)> {
        self.sockets
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.inner.as_ref().map(|item| (SocketId(index), &item.cb)))
    }

    fn insert(&mut self, cb: ControlBlock) -> Option<SocketId> {
        self.stamp += 1;
        let item = Item {
            cb,
            stamp: self.stamp,
        };
        for (index, slot) in self.sockets.iter_mut().enumerate() {
            if slot.inner.is_none() {
                slot.inner = Some(item);
                return Some(SocketId(index));
            }
        }

        match &mut self.sockets {
            ManagedSlice::Borrowed(_) => None,
            ManagedSlice::Owned(sockets) => {
                sockets.push(SocketStorage { inner: Some(item) });
                Some(SocketId(sockets.len() - 1))
            }
        }
    }

    fn half_open(&self, listener: SocketId) -> usize {
        self.iter()
            .filter(|(_, cb)| cb.listener() == Some(listener) && cb.state() == State::SynReceived)
            .count()
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.iter().any(|(_, cb)| cb.local_endpoint().port == port)
    }
}

impl SocketPool for SocketSet<'_> {
    fn capacity(&self) -> usize {
        self.sockets.len()
    }

    fn get(&self, id: SocketId) -> Option<&ControlBlock> {
        self.sockets.get(id.0)?.inner.as_ref().map(|item| &item.cb)
    }

    fn get_mut(&mut self, id: SocketId) -> Option<&mut ControlBlock> {
        self.sockets
            .get_mut(id.0)?
            .inner
            .as_mut()
            .map(|item| &mut item.cb)
    }

    fn allocate(&mut self) -> Option<SocketId> {
        let id = self.insert(ControlBlock::new());
        if id.is_none() {
            net_debug!("socket set full");
        }
        id
    }

    fn clone_listener(&mut self, listener: SocketId) -> Result<SocketId, CloneError> {
        let parent = match self.get(listener) {
            Some(cb) if cb.state() == State::Listen => cb,
            _ => return Err(CloneError::Exhausted),
        };
        let backlog = parent.backlog();
        let mut child = parent.clone();
        child.listener = Some(listener);

        if backlog != 0 && self.half_open(listener) >= backlog {
            net_trace!("{}: backlog of {} full", listener, backlog);
            return Err(CloneError::Busy);
        }

        match self.insert(child) {
            Some(id) => Ok(id),
            None if self.oldest_half_open(listener).is_some() => Err(CloneError::Busy),
            None => Err(CloneError::Exhausted),
        }
    }

    fn oldest_half_open(&self, listener: SocketId) -> Option<SocketId> {
        self.sockets
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.inner.as_ref().map(|item| (index, item)))
            .filter(|(_, item)| {
                item.cb.listener() == Some(listener) && item.cb.state() == State::SynReceived
            })
            .min_by_key(|(_, item)| item.stamp)
            .map(|(index, _)| SocketId(index))
    }

    fn close_socket(&mut self, id: SocketId) {
        match self.sockets.get_mut(id.0) {
            Some(slot) if slot.inner.is_some() => slot.inner = None,
            _ => net_debug!("{}: closing a free slot", id),
        }
    }

    fn ephemeral_port(&mut self) -> Option<u16> {
        let span = EPHEMERAL_PORTS.len();
        for _ in 0..span {
            let port = self.next_port;
            self.next_port = if port == *EPHEMERAL_PORTS.end() {
                *EPHEMERAL_PORTS.start()
            } else {
                port + 1
            };
            if !self.port_in_use(port) {
                return Some(port);
            }
        }
        None
    }
}

impl fmt::Debug for SocketSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::IpListenEndpoint;

    fn listener(set: &mut SocketSet, port: u16, backlog: usize) -> SocketId {
        let id = set.allocate().unwrap();
        let cb = set.get_mut(id).unwrap();
        cb.state = State::Listen;
        cb.local = IpListenEndpoint::from(port);
        cb.backlog = backlog;
        id
    }

    #[test]
    fn test_allocate_borrowed_full() {
        let mut storage = [SocketStorage::EMPTY, SocketStorage::EMPTY];
        let mut set = SocketSet::new(&mut storage[..]);
        assert_eq!(set.allocate(), Some(SocketId(0)));
        assert_eq!(set.allocate(), Some(SocketId(1)));
        assert_eq!(set.allocate(), None);
        set.close_socket(SocketId(0));
        assert_eq!(set.allocate(), Some(SocketId(0)));
    }

    #[test]
    fn test_allocate_owned_grows() {
        let mut set = SocketSet::new(vec![]);
        for index in 0..5 {
            assert_eq!(set.allocate(), Some(SocketId(index)));
        }
        assert_eq!(set.capacity(), 5);
    }

    #[test]
    fn test_clone_backlog_busy() {
        let mut set = SocketSet::new(vec![]);
        let listen = listener(&mut set, 80, 2);
        let first = set.clone_listener(listen).unwrap();
        set.get_mut(first).unwrap().state = State::SynReceived;
        let second = set.clone_listener(listen).unwrap();
        set.get_mut(second).unwrap().state = State::SynReceived;
        assert_eq!(set.get(second).unwrap().listener(), Some(listen));
        assert_eq!(set.children(listen), 2);
        assert_eq!(set.clone_listener(listen), Err(CloneError::Busy));
        assert_eq!(set.oldest_half_open(listen), Some(first));

        set.close_socket(first);
        assert!(set.clone_listener(listen).is_ok());
    }

    #[test]
    fn test_clone_exhausted_when_all_established() {
        let mut storage = [SocketStorage::EMPTY, SocketStorage::EMPTY];
        let mut set = SocketSet::new(&mut storage[..]);
        let listen = listener(&mut set, 80, 0);
        let child = set.clone_listener(listen).unwrap();
        set.get_mut(child).unwrap().state = State::Established;
        assert_eq!(set.clone_listener(listen), Err(CloneError::Exhausted));

        set.get_mut(child).unwrap().state = State::SynReceived;
        assert_eq!(set.clone_listener(listen), Err(CloneError::Busy));
    }

    #[test]
    fn test_clone_requires_listener() {
        let mut set = SocketSet::new(vec![]);
        let id = set.allocate().unwrap();
        assert_eq!(set.clone_listener(id), Err(CloneError::Exhausted));
    }

    #[test]
    fn test_ephemeral_port_skips_bound() {
        let mut set = SocketSet::new(vec![]);
        listener(&mut set, 49152, 0);
        assert_eq!(set.ephemeral_port(), Some(49153));
        set.set_ephemeral_port(65535);
        assert_eq!(set.ephemeral_port(), Some(65535));
        assert_eq!(set.ephemeral_port(), Some(49153));
    }
}
