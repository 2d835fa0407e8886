//! Throttle sync primitive (spec.md §4.4 `Throttle(rate, period, burst)`):
//! a token bucket. Up to `rate` acquisitions drain the bucket per `period`;
//! `burst` caps how much unused budget carries over. Queued callers are
//! granted FIFO as the refill timer tops the bucket back up.
//!
//! The reference's own `throttle.hpp` ships only a no-op stub in the slice
//! available to this port (`examples/original_source`); the token-bucket
//! behavior below is built directly from spec.md §4.4 and §8 scenario 4's
//! sibling rate-limiting expectations rather than ported line-for-line.

use std::{cell::Cell, collections::VecDeque, rc::Rc, time::Duration};

use crate::core::reactor::Reactor;
use crate::engine::protector::Protector;
use crate::sync::SyncPrimitive;

type Grant = Box<dyn FnOnce(Protector)>;

struct Inner {
    rate: u32,
    burst: u32,
    period: Duration,
    budget: Cell<u32>,
    queue: RefCellQueue,
    refill_armed: Cell<bool>,
}

type RefCellQueue = std::cell::RefCell<VecDeque<(Protector, Grant)>>;

/// Cheaply cloneable handle to one throttle's shared bucket.
#[derive(Clone)]
pub struct Throttle {
    inner: Rc<Inner>,
}

impl Throttle {
    pub fn new(rate: u32, period: Duration, burst: u32) -> Self {
        Throttle {
            inner: Rc::new(Inner {
                rate,
                burst,
                period,
                budget: Cell::new(burst),
                queue: RefCellQueue::new(VecDeque::new()),
                refill_armed: Cell::new(false),
            }),
        }
    }

    pub fn available(&self) -> u32 {
        self.inner.budget.get()
    }

    fn arm_refill(&self, reactor: Rc<Reactor>) {
        if self.inner.refill_armed.replace(true) {
            return;
        }
        Self::schedule_refill(self.inner.clone(), reactor);
    }

    fn schedule_refill(inner: Rc<Inner>, reactor: Rc<Reactor>) {
        let inner_cb = inner.clone();
        let reactor_cb = reactor.clone();
        reactor.deferred(inner.period, move || {
            let topped_up = (inner_cb.budget.get() + inner_cb.rate).min(inner_cb.burst.max(inner_cb.rate));
            inner_cb.budget.set(topped_up);

            while inner_cb.budget.get() > 0 {
                let next = inner_cb.queue.borrow_mut().pop_front();
                match next {
                    Some((protector, grant)) => {
                        inner_cb.budget.set(inner_cb.budget.get() - 1);
                        grant(protector);
                    }
                    None => break,
                }
            }

            Throttle::schedule_refill(inner_cb, reactor_cb);
        });
    }
}

impl SyncPrimitive for Throttle {
    fn lock(&self, protector: Protector, on_locked: Grant) {
        self.arm_refill(protector.reactor());

        if self.inner.budget.get() > 0 {
            self.inner.budget.set(self.inner.budget.get() - 1);
            on_locked(protector);
        } else {
            self.inner.queue.borrow_mut().push_back((protector.clone(), on_locked));
            protector.wait_external();
        }
    }

    /// Throttle only gates how fast callers *enter*; there is nothing held
    /// to release once granted (spec.md: it budgets acquisitions, not
    /// concurrency). The only case this must handle is a cancel arriving
    /// while still queued, so the stale waiter is never granted later.
    fn unlock(&self, protector: &Protector) {
        let root_id = protector.sync_root_id();
        self.inner
            .queue
            .borrow_mut()
            .retain(|(p, _)| p.sync_root_id() != root_id);
    }
}
