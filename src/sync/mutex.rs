//! Mutex sync primitive (spec.md §4.4 `Mutex(max, queue_max)`).
//!
//! Grounded on the C++ reference's `futoin::ri::BaseMutex`
//! (`include/futoin/ri/mutex.hpp`): three lists -- holders, waiters, and
//! (there, for allocator reuse) a free list we don't need since Rust's
//! allocator already recycles `VecDeque` storage -- keyed by `sync_root_id`
//! so that re-entering `sync()` from the *same* engine while it already
//! holds the lock just bumps a refcount instead of deadlocking on itself.
//!
//! The reference's internal `OSMutex` exists because `lock`/`unlock` may be
//! invoked from engines on different reactor threads sharing one `Mutex`
//! instance. This port keeps the state in a plain `RefCell` -- the same
//! choice `core::reactor::Reactor` and `core::mempool::MemPool` make -- and
//! does not implement the cross-reactor-sharing configuration; see
//! DESIGN.md.

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use crate::engine::error::codes;
use crate::engine::protector::Protector;
use crate::sync::SyncPrimitive;

struct Holder {
    root_id: u64,
    count: u32,
}

struct Waiter {
    root_id: u64,
    protector: Protector,
    grant: Box<dyn FnOnce(Protector)>,
}

struct Inner {
    max: u32,
    queue_max: u32,
    locked: RefCell<VecDeque<Holder>>,
    queue: RefCell<VecDeque<Waiter>>,
}

/// Cheaply cloneable handle to one mutex's shared state; every clone gates
/// the same holders/waiters.
#[derive(Clone)]
pub struct Mutex {
    inner: Rc<Inner>,
}

impl Mutex {
    pub fn new(max: u32, queue_max: u32) -> Self {
        Mutex {
            inner: Rc::new(Inner {
                max,
                queue_max,
                locked: RefCell::new(VecDeque::new()),
                queue: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// Holders right now, for tests exercising P7 (`holders <= max`).
    pub fn holder_count(&self) -> usize {
        self.inner.locked.borrow().len()
    }

    /// Waiters right now, for tests exercising P7 (`queue <= queue_max`).
    pub fn queue_len(&self) -> usize {
        self.inner.queue.borrow().len()
    }
}

impl SyncPrimitive for Mutex {
    fn lock(&self, protector: Protector, on_locked: Box<dyn FnOnce(Protector)>) {
        let root_id = protector.sync_root_id();

        if let Some(holder) = self
            .inner
            .locked
            .borrow_mut()
            .iter_mut()
            .find(|h| h.root_id == root_id)
        {
            holder.count += 1;
            trace!(root_id, count = holder.count, "mutex recursive acquire");
            on_locked(protector);
            return;
        }

        if (self.inner.locked.borrow().len() as u32) < self.inner.max {
            self.inner.locked.borrow_mut().push_back(Holder { root_id, count: 1 });
            trace!(root_id, "mutex acquired");
            on_locked(protector);
            return;
        }

        if (self.inner.queue.borrow().len() as u32) < self.inner.queue_max {
            debug!(root_id, "mutex full, queueing waiter");
            self.inner.queue.borrow_mut().push_back(Waiter {
                root_id,
                protector: protector.clone(),
                grant: on_locked,
            });
            protector.wait_external();
            return;
        }

        debug!(root_id, "mutex queue full, rejecting");
        protector.error(codes::DEFENSE_REJECTED, None);
    }

    fn unlock(&self, protector: &Protector) {
        let root_id = protector.sync_root_id();

        // Cancelled while still queued: just drop the waiter, no grant ever
        // happened (a no-op lock() was never reached).
        if let Some(pos) = self
            .inner
            .queue
            .borrow()
            .iter()
            .position(|w| w.root_id == root_id)
        {
            self.inner.queue.borrow_mut().remove(pos);
            return;
        }

        let pos = match self.inner.locked.borrow().iter().position(|h| h.root_id == root_id) {
            Some(p) => p,
            None => return, // unlock() on a step that never acquired: no-op.
        };

        {
            let mut locked = self.inner.locked.borrow_mut();
            if locked[pos].count > 1 {
                locked[pos].count -= 1;
                return;
            }
            locked.remove(pos);
        }

        trace!(root_id, "mutex released");
        // FIFO hand-off: the releasing unlock grants the next waiter on the
        // same reactor tick it unlocked (spec.md §4.4 Mutex policy).
        let next = self.inner.queue.borrow_mut().pop_front();
        if let Some(next) = next {
            trace!(root_id = next.root_id, "mutex handed off to waiter");
            self.inner.locked.borrow_mut().push_back(Holder {
                root_id: next.root_id,
                count: 1,
            });
            (next.grant)(next.protector);
        }
    }
}
