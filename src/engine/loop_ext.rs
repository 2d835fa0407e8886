//! `loop`/`repeat` and the `LoopBreak`/`LoopCont` error conduits (spec.md
//! §4.2 "Loop semantics"). A loop is an ordinary step with `RepeatStep` set
//! and an [`ExtState::Loop`] recording its label and iteration counter; the
//! dispatcher in `engine::engine` already knows how to keep re-invoking a
//! `RepeatStep` step, so this module only needs to supply that step's body
//! wrapper and the `break_loop`/`continue_loop` entry points.

use std::{any::Any, cell::Cell, rc::Rc};

use crate::engine::engine::LoopSignal;
use crate::engine::error::codes;
use crate::engine::protector::Protector;
use crate::engine::queue::{ExtState, LoopState, StepFn};

fn current_iteration(p: &Protector) -> u64 {
    match &p.node.borrow().ext {
        Some(ExtState::Loop(ls)) => ls.iteration.get(),
        _ => unreachable!("loop body invoked on a non-loop step"),
    }
}

fn advance_iteration(p: &Protector, iter: u64) {
    if let Some(ExtState::Loop(ls)) = &p.node.borrow().ext {
        ls.iteration.set(iter + 1);
    }
}

/// Wraps a loop/repeat body so the dispatcher can treat it like any other
/// step func: read the current iteration out of `ext`, hand it to the user
/// body, then bump the counter for next time. `limit` turns this into
/// `repeat(n, ...)`: once `iter >= limit` the step succeeds instead of
/// invoking the body again.
fn make_loop_fn<F>(mut body: F, limit: Option<u64>) -> StepFn
where
    F: FnMut(&Protector, u64) + 'static,
{
    Box::new(move |p: &Protector, _args: &[Rc<dyn Any>]| {
        let iter = current_iteration(p);
        if let Some(limit) = limit {
            if iter >= limit {
                p.success();
                return;
            }
        }
        body(p, iter);
        advance_iteration(p, iter);
    })
}

impl Protector {
    /// Append a repeating step whose body runs until `break_loop(label)` (or
    /// any propagating error) exits it (spec.md §4.2 `loop`).
    pub fn loop_<F>(&self, body: F, label: Option<&str>) -> &Self
    where
        F: FnMut(&Protector, u64) + 'static,
    {
        let label: Option<Rc<str>> = label.map(Rc::from);
        let child = self
            .inner
            .append_child(&self.node, Some(make_loop_fn(body, None)), None);
        if let Some(cap) = &self.inner.capacity {
            cap.alloc_extended();
        }
        {
            let mut n = child.borrow_mut();
            n.flags.repeat_step = true;
            n.flags.have_extended = true;
            n.ext = Some(ExtState::Loop(LoopState {
                label,
                iteration: Cell::new(0),
                limit: None,
            }));
        }
        self
    }

    /// `repeat(n, body, label)`: a loop that runs exactly `n` times, passing
    /// the 0-based index to `body` each time, then succeeds.
    pub fn repeat<F>(&self, n: u64, body: F, label: Option<&str>) -> &Self
    where
        F: FnMut(&Protector, u64) + 'static,
    {
        let label: Option<Rc<str>> = label.map(Rc::from);
        let child = self
            .inner
            .append_child(&self.node, Some(make_loop_fn(body, Some(n))), None);
        if let Some(cap) = &self.inner.capacity {
            cap.alloc_extended();
        }
        {
            let mut c = child.borrow_mut();
            c.flags.repeat_step = true;
            c.flags.have_extended = true;
            c.ext = Some(ExtState::Loop(LoopState {
                label,
                iteration: Cell::new(0),
                limit: Some(n),
            }));
        }
        self
    }

    /// Break the nearest enclosing loop matching `label` (or the nearest
    /// unlabelled loop if `label` is `None`): clears `RepeatStep` and
    /// succeeds that loop step.
    pub fn break_loop(&self, label: Option<&str>) {
        *self.inner.loop_signal.borrow_mut() = Some(LoopSignal {
            label: label.map(Rc::from),
        });
        self.error(codes::LOOP_BREAK, None);
    }

    /// Re-run the nearest enclosing loop's body without advancing past it
    /// (spec.md: "`LoopCont` resets the iteration").
    pub fn continue_loop(&self, label: Option<&str>) {
        *self.inner.loop_signal.borrow_mut() = Some(LoopSignal {
            label: label.map(Rc::from),
        });
        self.error(codes::LOOP_CONT, None);
    }
}
