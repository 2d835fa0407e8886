//! `Protector`: the per-step facade handed to step bodies, error handlers
//! and timeout/cancel callbacks (spec.md §4.2). It borrows nothing from the
//! engine beyond an `Rc` clone and a clone of the node it speaks for, so it
//! can be captured by `'static` closures (timeout/cancel callbacks posted
//! onto the reactor) without lifetime gymnastics.

use std::{any::Any, rc::Rc, time::Duration};

use crate::engine::engine::EngineInner;
use crate::engine::error::{codes, ErrorCode, StepOutcome};
use crate::engine::queue::{CancelFn, ErrorFn, NodeRef, StepFn};

pub struct Protector {
    pub(crate) inner: Rc<EngineInner>,
    pub(crate) node: NodeRef,
}

impl Clone for Protector {
    fn clone(&self) -> Self {
        Protector {
            inner: self.inner.clone(),
            node: self.node.clone(),
        }
    }
}

impl Protector {
    pub(crate) fn new(inner: Rc<EngineInner>, node: NodeRef) -> Self {
        Protector { inner, node }
    }

    /// Append a child step to whichever step this `Protector` speaks for
    /// (I2: nested calls append to the *current* step's sub-queue).
    pub fn add<F>(&self, body: F, on_error: Option<ErrorFn>) -> &Self
    where
        F: FnMut(&Protector, &[Rc<dyn Any>]) + 'static,
    {
        self.inner.append_child(&self.node, Some(Box::new(body) as StepFn), on_error);
        self
    }

    /// Arm a deferred timeout delivering `Timeout` on fire. Fatal if this
    /// step already has one (I4).
    pub fn set_timeout(&self, delay: Duration) {
        let mut node = self.node.borrow_mut();
        assert!(
            !node.flags.have_timeout,
            "set_timeout() called twice on the same step"
        );
        if let Some(cap) = &self.inner.capacity {
            cap.alloc_timeout();
        }
        node.flags.have_timeout = true;
        drop(node);

        let weak_engine = Rc::downgrade(&self.inner);
        let target = self.node.clone();
        let handle = self.inner.reactor.deferred(delay, move || {
            if let Some(engine) = weak_engine.upgrade() {
                trace!(?delay, "step timeout fired");
                let protector = Protector::new(engine, target);
                protector.error(codes::TIMEOUT, None);
            }
        });
        self.node.borrow().timeout_handle.set(handle);
    }

    /// Register a cancel hook; fatal if one is already registered (I5).
    pub fn set_cancel<F>(&self, f: F)
    where
        F: FnOnce() + 'static,
    {
        let mut node = self.node.borrow_mut();
        assert!(
            !node.flags.have_cancel,
            "set_cancel() called twice on the same step"
        );
        if let Some(cap) = &self.inner.capacity {
            cap.alloc_cancel();
        }
        node.flags.have_cancel = true;
        node.cancel_fn = Some(Box::new(f) as CancelFn);
    }

    /// Disable auto-success without arming a timeout or cancel hook.
    pub fn wait_external(&self) {
        self.node.borrow_mut().flags.have_wait = true;
    }

    pub fn success(&self) {
        self.success_with(Vec::new());
    }

    pub fn success_with(&self, args: Vec<Rc<dyn Any>>) {
        self.inner.resolve(&self.node, StepOutcome::Success(args));
    }

    pub fn error(&self, code: impl Into<ErrorCode>, info: Option<Rc<dyn Any>>) {
        self.inner
            .resolve(&self.node, StepOutcome::Error(code.into(), info));
    }

    /// Per-engine key/value map; parallel children return their parent's.
    pub fn state(&self) -> Rc<std::cell::RefCell<std::collections::HashMap<String, Rc<dyn Any>>>> {
        self.inner.state_map.clone()
    }

    /// Step-scoped scratch allocation, dropped (running `dtor`'s logic via
    /// `T`'s own `Drop`) when this step is freed.
    pub fn stack<T: 'static>(&self, val: T) -> Rc<std::cell::RefCell<T>> {
        if let Some(cap) = &self.inner.capacity {
            cap.alloc_stack();
        }
        let cell = Rc::new(std::cell::RefCell::new(val));
        self.node.borrow_mut().stack_allocs.push(Box::new(cell.clone()));
        cell
    }

    /// Stable identifier for recursive-lock bookkeeping (spec.md glossary:
    /// "sync root id"); shared by every step of one engine, including the
    /// branches spawned by `parallel()` only if they choose to inherit it —
    /// here each branch is a distinct engine, so each gets its own id.
    pub fn sync_root_id(&self) -> u64 {
        self.inner.root_id
    }

    /// The reactor driving this step's engine; used by sync primitives that
    /// need to arm their own deferred callbacks (e.g. `Throttle`'s refill
    /// timer).
    pub(crate) fn reactor(&self) -> Rc<crate::core::reactor::Reactor> {
        self.inner.reactor.clone()
    }

    pub fn cancel(&self) {
        self.inner.cancel_onthread();
    }
}
