//! `await(poll)` (spec.md §4.2 "Await semantics"): a loop whose body
//! re-invokes `poll` every tick until it returns `true`, then breaks.

use std::{cell::RefCell, time::Instant};

use crate::engine::protector::Protector;

impl Protector {
    /// Repeatedly calls `poll(step, elapsed_since_first_call, first_call)`
    /// until it returns `true`, then breaks the implicit loop. `poll` may
    /// itself call `success()`/`error()` on `step`, in which case it must
    /// not also return `true` (the loop step is already gone).
    pub fn await_<F>(&self, poll: F) -> &Self
    where
        F: FnMut(&Protector, std::time::Duration, bool) -> bool + 'static,
    {
        let poll = RefCell::new(poll);
        let started: RefCell<Option<Instant>> = RefCell::new(None);
        self.loop_(
            move |p, iter| {
                let first = iter == 0;
                let start = *started.borrow_mut().get_or_insert_with(Instant::now);
                let elapsed = start.elapsed();
                let done = (poll.borrow_mut())(p, elapsed, first);
                if done {
                    p.break_loop(None);
                }
            },
            None,
        )
    }
}
