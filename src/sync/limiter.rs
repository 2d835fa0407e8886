//! Limiter sync primitive (spec.md §4.4): `Mutex(concurrent, queue) ∘
//! Throttle(rate, period, burst)`. `lock` acquires the mutex then the
//! throttle; `unlock` releases in reverse. Grounded on the reference's
//! `BaseLimiter` (`include/futoin/ri/limiter.hpp`), which composes the same
//! two primitives the same way rather than reimplementing either.

use std::time::Duration;

use crate::engine::protector::Protector;
use crate::sync::{mutex::Mutex, throttle::Throttle, SyncPrimitive};

#[derive(Clone)]
pub struct Limiter {
    mutex: Mutex,
    throttle: Throttle,
}

impl Limiter {
    pub fn new(concurrent: u32, queue_max: u32, rate: u32, period: Duration, burst: u32) -> Self {
        Limiter {
            mutex: Mutex::new(concurrent, queue_max),
            throttle: Throttle::new(rate, period, burst),
        }
    }
}

impl SyncPrimitive for Limiter {
    fn lock(&self, protector: Protector, on_locked: Box<dyn FnOnce(Protector)>) {
        let throttle = self.throttle.clone();
        self.mutex.lock(
            protector,
            Box::new(move |granted: Protector| {
                throttle.lock(granted, on_locked);
            }),
        );
    }

    fn unlock(&self, protector: &Protector) {
        self.throttle.unlock(protector);
        self.mutex.unlock(protector);
    }
}
