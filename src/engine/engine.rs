//! The step-queue dispatcher: one step resolved per reactor tick, yielding
//! back via a freshly scheduled `Immediate` exactly as spec.md §2 describes
//! ("executing one step, then yielding control back to the reactor").
//!
//! `EngineInner` is the shared, `Rc`-owned heart of one engine; [`AsyncSteps`]
//! is the root handle a program builds its step tree on. Off-thread
//! cancellation (P9) cannot hold an `Rc<EngineInner>` directly — nothing
//! `Rc`-rooted is `Send` — so it goes through [`AsyncStepsRemote`], a
//! `ReactorRemote`-shaped sibling that marshals through a thread-local
//! registry the same way `core::reactor::ReactorRemote` marshals `cancel()`
//! back onto the owning thread.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::{Rc, Weak},
    thread_local,
};

use crate::core::reactor::Reactor;
use crate::engine::error::{codes, ErrorCode, StepOutcome};
use crate::engine::protector::Protector;
use crate::engine::queue::{ExtState, NodeRef, StepNode};

pub(crate) enum LoopSignalKind {
    Break,
    Cont,
}

pub(crate) struct LoopSignal {
    pub label: Option<Rc<str>>,
}

thread_local! {
    static NEXT_ROOT_ID: Cell<u64> = Cell::new(1);
    static ENGINE_REGISTRY: RefCell<HashMap<u64, Weak<EngineInner>>> = RefCell::new(HashMap::new());
}

fn next_root_id() -> u64 {
    NEXT_ROOT_ID.with(|c| {
        let id = c.get();
        c.set(id + 1);
        id
    })
}

type StateMap = Rc<RefCell<HashMap<String, Rc<dyn Any>>>>;

pub(crate) struct EngineInner {
    pub(crate) reactor: Rc<Reactor>,
    pub(crate) root: NodeRef,
    pub(crate) stack: RefCell<Vec<NodeRef>>,
    pub(crate) state_map: StateMap,
    pub(crate) root_id: u64,
    pub(crate) pending_args: RefCell<Option<Vec<Rc<dyn Any>>>>,
    pub(crate) loop_signal: RefCell<Option<LoopSignal>>,
    pub(crate) unhandled_error: RefCell<Option<Box<dyn FnMut(ErrorCode)>>>,
    pub(crate) executed: Cell<bool>,
    pub(crate) cancelled: Cell<bool>,
    /// Set only for `parallel()` branch engines: routes completion back to
    /// the `ParallelState` that spawned this engine instead of treating the
    /// engine's own root completion as "the whole program is done".
    pub(crate) completion_sink: RefCell<Option<Box<dyn FnOnce(StepOutcome)>>>,
    /// Present only for engines built via `engine::fixed`; enforces the
    /// static capacities of spec.md §4.3 by panicking (fatal, matching
    /// "exceeding static capacity in the fixed-storage variant") instead of
    /// growing.
    pub(crate) capacity: Option<crate::engine::fixed::Capacity>,
}

impl EngineInner {
    pub(crate) fn new(reactor: Rc<Reactor>) -> Rc<Self> {
        let inner = Rc::new(EngineInner {
            reactor,
            root: StepNode::new_root(),
            stack: RefCell::new(Vec::new()),
            state_map: Rc::new(RefCell::new(HashMap::new())),
            root_id: next_root_id(),
            pending_args: RefCell::new(None),
            loop_signal: RefCell::new(None),
            unhandled_error: RefCell::new(None),
            executed: Cell::new(false),
            cancelled: Cell::new(false),
            completion_sink: RefCell::new(None),
            capacity: None,
        });
        ENGINE_REGISTRY.with(|r| r.borrow_mut().insert(inner.root_id, Rc::downgrade(&inner)));
        inner
    }

    /// As [`EngineInner::new`], but with the static capacities of
    /// `engine::fixed` enforced on every allocation.
    pub(crate) fn new_with_capacity(
        reactor: Rc<Reactor>,
        capacity: crate::engine::fixed::Capacity,
    ) -> Rc<Self> {
        let inner = Rc::new(EngineInner {
            reactor,
            root: StepNode::new_root(),
            stack: RefCell::new(Vec::new()),
            state_map: Rc::new(RefCell::new(HashMap::new())),
            root_id: next_root_id(),
            pending_args: RefCell::new(None),
            loop_signal: RefCell::new(None),
            unhandled_error: RefCell::new(None),
            executed: Cell::new(false),
            cancelled: Cell::new(false),
            completion_sink: RefCell::new(None),
            capacity: Some(capacity),
        });
        ENGINE_REGISTRY.with(|r| r.borrow_mut().insert(inner.root_id, Rc::downgrade(&inner)));
        inner
    }

    /// Build a branch engine for one `parallel()` arm: shares the parent's
    /// `state()` map and reactor, but is otherwise a fresh engine with its
    /// own step tree and its own `sync_root_id` (spec.md: "each parallel
    /// child is a child engine").
    pub(crate) fn new_branch(
        reactor: Rc<Reactor>,
        state_map: StateMap,
        completion_sink: Box<dyn FnOnce(StepOutcome)>,
    ) -> Rc<Self> {
        let inner = Rc::new(EngineInner {
            reactor,
            root: StepNode::new_root(),
            stack: RefCell::new(Vec::new()),
            state_map,
            root_id: next_root_id(),
            pending_args: RefCell::new(None),
            loop_signal: RefCell::new(None),
            unhandled_error: RefCell::new(None),
            executed: Cell::new(false),
            cancelled: Cell::new(false),
            completion_sink: RefCell::new(Some(completion_sink)),
            capacity: None,
        });
        ENGINE_REGISTRY.with(|r| r.borrow_mut().insert(inner.root_id, Rc::downgrade(&inner)));
        inner
    }

    pub(crate) fn append_child(
        self: &Rc<Self>,
        parent: &NodeRef,
        func: Option<crate::engine::queue::StepFn>,
        on_error: Option<crate::engine::queue::ErrorFn>,
    ) -> NodeRef {
        if let Some(cap) = &self.capacity {
            cap.alloc_step();
        }
        let child = StepNode::new_child(parent, func, on_error);
        parent.borrow_mut().children.push_back(child.clone());
        child
    }

    pub(crate) fn start(self: &Rc<Self>) {
        assert!(!self.executed.replace(true), "execute() called twice");
        self.stack.borrow_mut().push(self.root.clone());
        self.schedule_continue();
    }

    pub(crate) fn schedule_continue(self: &Rc<Self>) {
        if self.cancelled.get() {
            return;
        }
        let weak = Rc::downgrade(self);
        self.reactor.immediate(move || {
            if let Some(inner) = weak.upgrade() {
                inner.pump();
            }
        });
    }

    fn is_current(&self, node: &NodeRef) -> bool {
        self.stack
            .borrow()
            .last()
            .map(|n| Rc::ptr_eq(n, node))
            .unwrap_or(false)
    }

    /// Free a step that completed via plain success: its cancel hook (if
    /// any) is simply discarded, never invoked — success is not an
    /// abnormal termination (I5 only requires invocation "on abnormal
    /// termination").
    fn cleanup_terminal(&self, node: &NodeRef) {
        let mut n = node.borrow_mut();
        let h = n.timeout_handle.get();
        if !h.is_null() {
            self.reactor.cancel(h);
        }
        if let Some(cap) = &self.capacity {
            cap.free_step(&n);
        }
        n.cancel_fn = None;
        n.ext = None;
        n.stack_allocs.clear();
    }

    /// Free a step being unwound through due to an error or loop-signal
    /// (I5: "invoked before the step's error handler runs and before the
    /// step is freed on abnormal termination"). Must run the registered
    /// cancel hook, unlike plain success.
    fn cleanup_terminal_abnormal(&self, node: &NodeRef) {
        let cancel_fn = node.borrow_mut().cancel_fn.take();
        if let Some(cancel_fn) = cancel_fn {
            cancel_fn();
        }
        self.cleanup_terminal(node);
    }

    /// One unit of dispatch work: descend into a pending child, invoke a
    /// not-yet-run body, re-arm a finished `RepeatStep`, or auto-succeed a
    /// step whose children just drained. Always does at most one of these
    /// before returning, scheduling a continuation if there is more to do.
    pub(crate) fn pump(self: &Rc<Self>) {
        if self.cancelled.get() {
            return;
        }
        let top = match self.stack.borrow().last().cloned() {
            Some(n) => n,
            None => return,
        };

        let pending_child = top.borrow().children.front().cloned();
        if let Some(child) = pending_child {
            self.stack.borrow_mut().push(child);
            self.schedule_continue();
            return;
        }

        let already_invoked = top.borrow().body_invoked;
        if !already_invoked {
            self.invoke_body(&top);
            return;
        }

        if top.borrow().flags.repeat_step {
            top.borrow_mut().body_invoked = false;
            self.schedule_continue();
            return;
        }

        self.handle_success(&top, Vec::new());
    }

    fn invoke_body(self: &Rc<Self>, node: &NodeRef) {
        node.borrow_mut().body_invoked = true;

        if matches!(node.borrow().ext, Some(ExtState::Parallel(_))) {
            crate::engine::parallel::start_parallel(self, node);
            return;
        }

        let func = node.borrow_mut().func.take();
        if let Some(mut f) = func {
            let args = self.pending_args.borrow_mut().take().unwrap_or_default();
            let protector = Protector::new(self.clone(), node.clone());
            f(&protector, &args);
            node.borrow_mut().func = Some(f);
        }

        if !self.is_current(node) {
            // The body already called success()/error() synchronously;
            // that call has already resolved and advanced this node.
            return;
        }

        if !node.borrow().body_invoked {
            // `continue_loop()` ran synchronously inside the body and its
            // `unwind_to_loop` handling already reset `body_invoked` and
            // scheduled the next iteration itself; running the generic
            // tail logic below too would schedule a second, spurious
            // continuation and skip/duplicate an iteration.
            return;
        }

        let (has_children, suspended, repeat_step) = {
            let n = node.borrow();
            (!n.children.is_empty(), n.flags.suspended(), n.flags.repeat_step)
        };
        if has_children {
            self.schedule_continue();
        } else if suspended {
            // Awaiting: an external success()/error() resumes this step.
        } else if repeat_step {
            // I3: a RepeatStep is not popped when its body returns; it is
            // re-invoked on the next tick instead (loop()/repeat() bodies
            // that do their work synchronously rather than via add()).
            node.borrow_mut().body_invoked = false;
            self.schedule_continue();
        } else {
            self.handle_success(node, Vec::new());
        }
    }

    pub(crate) fn resolve(self: &Rc<Self>, node: &NodeRef, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Success(args) => self.handle_success(node, args),
            StepOutcome::Error(code, info) => self.handle_error(node, code, info),
        }
    }

    fn handle_success(self: &Rc<Self>, node: &NodeRef, args: Vec<Rc<dyn Any>>) {
        assert!(
            self.is_current(node),
            "success() called on a step that is not current"
        );
        assert!(
            node.borrow().children.is_empty(),
            "success() called with a non-empty sub-queue"
        );
        self.cleanup_terminal(node);
        self.stack.borrow_mut().pop();
        let parent = node.borrow().parent.clone();
        match parent {
            None => self.finish_root(StepOutcome::Success(args)),
            Some(weak_parent) => {
                let parent = weak_parent.upgrade().expect("parent dropped while child active");
                parent.borrow_mut().children.pop_front();
                *self.pending_args.borrow_mut() = Some(args);
                self.schedule_continue();
            }
        }
    }

    fn handle_error(self: &Rc<Self>, node: &NodeRef, code: ErrorCode, info: Option<Rc<dyn Any>>) {
        assert!(
            self.is_current(node),
            "error() called on a step that is not current"
        );
        if code.as_str() == codes::LOOP_BREAK || code.as_str() == codes::LOOP_CONT {
            let kind = if code.as_str() == codes::LOOP_BREAK {
                LoopSignalKind::Break
            } else {
                LoopSignalKind::Cont
            };
            let label = self.loop_signal.borrow_mut().take().and_then(|s| s.label);
            self.unwind_to_loop(node, kind, label);
            return;
        }
        self.unwind_to_handler(node, code, info);
    }

    fn pop_from_parent(&self, node: &NodeRef) -> Option<Weak<RefCell<StepNode>>> {
        let parent = node.borrow().parent.clone();
        if let Some(w) = &parent {
            if let Some(p) = w.upgrade() {
                p.borrow_mut().children.pop_front();
            }
        }
        parent
    }

    /// Search for an `on_error` starting at the erroring step itself (its
    /// own handler catches an error its own body raised directly, e.g.
    /// `add(|p| p.error("E", None), Some(handler))`) and then ascending
    /// through ancestors (asyncsteps.cpp:1097 begins the same search at
    /// `current`, not at its parent).
    fn unwind_to_handler(self: &Rc<Self>, node: &NodeRef, code: ErrorCode, info: Option<Rc<dyn Any>>) {
        debug!(%code, "step erroring, unwinding to nearest handler");
        let mut current = node.clone();

        loop {
            let handler = current.borrow_mut().on_error.take();
            if let Some(mut handler) = handler {
                // Abandon whatever of this step's sub-queue hasn't run yet
                // before the handler runs (asyncsteps.cpp's sub_queue_free,
                // asyncsteps.cpp:240/1084) -- the handler may call
                // success(), which requires an empty sub-queue.
                current.borrow_mut().children.clear();
                let len_before = self.stack.borrow().len();
                let protector = Protector::new(self.clone(), current.clone());
                handler(&protector, code.clone());
                if self.stack.borrow().len() < len_before || !self.is_current(&current) {
                    // The handler resolved `current` (success()/error()),
                    // which has already popped and propagated it further.
                    return;
                }
                current.borrow_mut().on_error = Some(handler);
                // Handler returned without terminating: propagate upward
                // through the same code (spec.md §7 item 4).
            }

            self.cleanup_terminal_abnormal(&current);
            self.stack.borrow_mut().pop();
            match self.pop_from_parent(&current) {
                Some(parent_weak) => {
                    current = parent_weak.upgrade().expect("parent dropped while child active");
                }
                None => {
                    self.finish_root(StepOutcome::Error(code, info));
                    return;
                }
            }
        }
    }

    fn unwind_to_loop(self: &Rc<Self>, node: &NodeRef, kind: LoopSignalKind, label: Option<Rc<str>>) {
        // The common case: the per-iteration body itself calls
        // break_loop()/continue_loop() on the same node the loop step's own
        // ext lives on. Check that before climbing to ancestors, or a
        // direct call here would always miss its own loop.
        let self_matches = matches!(
            &node.borrow().ext,
            Some(ExtState::Loop(l)) if label.is_none() || l.label == label
        );
        if self_matches {
            match kind {
                LoopSignalKind::Break => {
                    node.borrow_mut().flags.repeat_step = false;
                    node.borrow_mut().children.clear();
                    self.handle_success(node, Vec::new());
                }
                LoopSignalKind::Cont => {
                    node.borrow_mut().children.clear();
                    node.borrow_mut().body_invoked = false;
                    self.schedule_continue();
                }
            }
            return;
        }

        self.cleanup_terminal_abnormal(node);
        self.stack.borrow_mut().pop();
        let mut cursor = self.pop_from_parent(node);

        loop {
            let parent_weak = match cursor {
                Some(w) => w,
                None => panic!("break_loop()/continue_loop() called with no enclosing loop"),
            };
            let parent = parent_weak.upgrade().expect("parent dropped while child active");
            let is_match = matches!(
                &parent.borrow().ext,
                Some(ExtState::Loop(l)) if label.is_none() || l.label == label
            );
            if is_match {
                match kind {
                    LoopSignalKind::Break => {
                        parent.borrow_mut().flags.repeat_step = false;
                        parent.borrow_mut().children.clear();
                        self.handle_success(&parent, Vec::new());
                    }
                    LoopSignalKind::Cont => {
                        parent.borrow_mut().children.clear();
                        parent.borrow_mut().body_invoked = false;
                        self.schedule_continue();
                    }
                }
                return;
            }
            self.cleanup_terminal_abnormal(&parent);
            self.stack.borrow_mut().pop();
            cursor = self.pop_from_parent(&parent);
        }
    }

    fn finish_root(self: &Rc<Self>, outcome: StepOutcome) {
        if let Some(sink) = self.completion_sink.borrow_mut().take() {
            sink(outcome);
            return;
        }
        if let StepOutcome::Error(code, _) = outcome {
            let handled = {
                let mut hook = self.unhandled_error.borrow_mut();
                if let Some(h) = hook.as_mut() {
                    h(code.clone());
                    true
                } else {
                    false
                }
            };
            if !handled {
                panic!("unhandled step error {code:?} reached the engine root");
            }
        }
    }

    pub(crate) fn cancel_onthread(self: &Rc<Self>) {
        if self.cancelled.get() {
            return;
        }
        debug!(root_id = self.root_id, "cancelling engine");
        self.cancelled.set(true);
        let frames: Vec<NodeRef> = self.stack.borrow_mut().drain(..).collect();
        for node in frames.into_iter().rev() {
            let cancel_fn = node.borrow_mut().cancel_fn.take();
            if let Some(cancel_fn) = cancel_fn {
                cancel_fn();
            }
            let mut n = node.borrow_mut();
            let h = n.timeout_handle.get();
            if !h.is_null() {
                self.reactor.cancel(h);
            }
            if let Some(cap) = &self.capacity {
                cap.free_step(&n);
            }
            n.children.clear();
            n.ext = None;
            n.stack_allocs.clear();
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let id = self.root_id;
        ENGINE_REGISTRY.with(|r| {
            r.borrow_mut().remove(&id);
        });
    }
}

/// Cross-thread-safe handle for `cancel()` (spec.md P9): carries no engine
/// state beyond a `ReactorRemote` and the engine's id, so it is `Send` even
/// though `AsyncSteps`/`EngineInner` are not.
#[derive(Clone)]
pub struct AsyncStepsRemote {
    remote: crate::core::reactor::ReactorRemote,
    root_id: u64,
}

impl AsyncStepsRemote {
    pub fn cancel(&self) {
        let id = self.root_id;
        self.remote.marshal_raw(Box::new(move || {
            ENGINE_REGISTRY.with(|r| {
                if let Some(weak) = r.borrow().get(&id) {
                    if let Some(inner) = weak.upgrade() {
                        inner.cancel_onthread();
                    }
                }
            });
        }));
    }
}

/// The root of one step tree (spec.md §4.2 `AsyncSteps`).
pub struct AsyncSteps {
    pub(crate) inner: Rc<EngineInner>,
}

impl AsyncSteps {
    pub fn new(reactor: Rc<Reactor>) -> Self {
        AsyncSteps {
            inner: EngineInner::new(reactor),
        }
    }

    /// Wrap an already-built [`EngineInner`]; used by
    /// [`crate::engine::fixed::FixedAsyncSteps`] to attach a capacity
    /// budget before handing back the ordinary `AsyncSteps` surface.
    pub(crate) fn from_inner(inner: Rc<EngineInner>) -> Self {
        AsyncSteps { inner }
    }

    fn root_protector(&self) -> Protector {
        Protector::new(self.inner.clone(), self.inner.root.clone())
    }

    /// As `root_protector`, exposed crate-wide for [`crate::ffi::root_step`]
    /// to hand a foreign caller the `StepHandle` for an engine's root.
    pub(crate) fn root_protector_ffi(&self) -> Protector {
        self.root_protector()
    }

    pub fn add<F>(&self, body: F, on_error: Option<crate::engine::queue::ErrorFn>) -> &Self
    where
        F: FnMut(&Protector, &[Rc<dyn Any>]) + 'static,
    {
        self.root_protector().add(body, on_error);
        self
    }

    pub fn state(&self) -> Rc<RefCell<HashMap<String, Rc<dyn Any>>>> {
        self.inner.state_map.clone()
    }

    pub fn root_id(&self) -> u64 {
        self.inner.root_id
    }

    /// Install the hook fired when an error unwinds past the root without
    /// finding a handler; its absence is fatal (spec.md §7 item 5).
    pub fn on_unhandled_error<F>(&self, f: F)
    where
        F: FnMut(ErrorCode) + 'static,
    {
        *self.inner.unhandled_error.borrow_mut() = Some(Box::new(f));
    }

    /// Start the root; must be called exactly once (spec.md: "re-entry is
    /// fatal").
    pub fn execute(&self) {
        self.inner.start();
    }

    pub fn cancel(&self) {
        self.inner.cancel_onthread();
    }

    /// A `Send` capability token that can call `cancel()` from any thread.
    pub fn remote_handle(&self) -> AsyncStepsRemote {
        AsyncStepsRemote {
            remote: self.inner.reactor.remote(),
            root_id: self.inner.root_id,
        }
    }
}
