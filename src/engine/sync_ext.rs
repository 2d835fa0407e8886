//! `sync(primitive, body, on_error)` (spec.md §4.2 "Sync step semantics"):
//! expands to `lock(primitive) -> body -> unlock(primitive)` plus a cancel
//! hook that unlocks on any exit path, guaranteeing P2 (`unlock` count ==
//! `lock` count on every path).
//!
//! The expansion is one child step (the "gate"): its body arms the cancel
//! hook, then calls [`SyncPrimitive::lock`]. If the primitive grants the
//! lock synchronously, the `on_locked` callback appends the body step and
//! the unlock step as children of the gate *before the gate's own body
//! returns*, so the dispatcher's "has pending children" check keeps the
//! gate current; if the primitive queues the caller instead, `on_locked`
//! fires later (from the primitive's own reactor callback) and does the
//! same thing, with `wait_external()` on the gate preventing a premature
//! auto-success in the meantime.

use std::{any::Any, cell::RefCell, rc::Rc};

use crate::engine::protector::Protector;
use crate::engine::queue::ErrorFn;
use crate::sync::SyncPrimitive;

impl Protector {
    /// Gate `body` behind `primitive.lock()`/`unlock()`.
    pub fn sync<F>(&self, primitive: Rc<dyn SyncPrimitive>, body: F, on_error: Option<ErrorFn>) -> &Self
    where
        F: FnMut(&Protector, &[Rc<dyn Any>]) + 'static,
    {
        let body = Rc::new(RefCell::new(body));
        self.add(
            move |p, _args| {
                let unlock_on_cancel = primitive.clone();
                let cancel_protector = p.clone();
                p.set_cancel(move || unlock_on_cancel.unlock(&cancel_protector));

                let body_for_grant = body.clone();
                let primitive_for_unlock = primitive.clone();
                primitive.lock(
                    p.clone(),
                    Box::new(move |granted: Protector| {
                        let body_inner = body_for_grant.clone();
                        granted.add(
                            move |p, args| (body_inner.borrow_mut())(p, args),
                            None,
                        );
                        let primitive_unlock = primitive_for_unlock.clone();
                        granted.add(
                            move |p, _args| {
                                primitive_unlock.unlock(p);
                                p.success();
                            },
                            None,
                        );
                        // A synchronous grant (lock free) rides invoke_body's
                        // own post-call scheduling; a grant handed off later
                        // from another step's unlock() happens outside that
                        // call frame and must kick this engine's dispatch
                        // itself or these two children would never run.
                        granted.inner.schedule_continue();
                    }),
                );
                p.wait_external();
            },
            on_error,
        )
    }
}
