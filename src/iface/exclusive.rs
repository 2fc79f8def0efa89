/// A critical section around control block mutation.
///
/// Segment dispatch and [`Tcp::tick`](crate::socket::tcp::Tcp::tick) may run in
/// different execution contexts. Each holds the area while it reads and writes
/// connection state, and releases it before calling into any collaborator that
/// transmits or upcalls.
pub trait ExclusiveArea {
    fn enter(&self);
    fn exit(&self);
}

/// An exclusive area for single context deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unguarded;

impl ExclusiveArea for Unguarded {
    fn enter(&self) {}
    fn exit(&self) {}
}

pub(crate) static UNGUARDED: Unguarded = Unguarded;

/// Holds an [`ExclusiveArea`] until dropped.
#[must_use = "the area is exited as soon as the guard is dropped"]
pub struct Guard<'a> {
    area: &'a dyn ExclusiveArea,
}

impl<'a> Guard<'a> {
    pub fn new(area: &'a dyn ExclusiveArea) -> Guard<'a> {
        area.enter();
        Guard { area }
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.area.exit();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::cell::Cell;

    #[derive(Default)]
    struct Counting {
        depth: Cell<i32>,
        entries: Cell<u32>,
    }

    impl ExclusiveArea for Counting {
        fn enter(&self) {
            self.depth.set(self.depth.get() + 1);
            self.entries.set(self.entries.get() + 1);
        }

        fn exit(&self) {
            self.depth.set(self.depth.get() - 1);
        }
    }

    #[test]
    fn test_guard_exits_on_drop() {
        let area = Counting::default();
        {
            let _guard = Guard::new(&area);
            assert_eq!(area.depth.get(), 1);
        }
        assert_eq!(area.depth.get(), 0);
        assert_eq!(area.entries.get(), 1);
    }
}
