//! `parallel()` (spec.md §4.2 "Parallel semantics"): a step whose body
//! spawns N independent branch engines sharing the parent's `state()` map.
//!
//! Grounded on the reference's `BaseAsyncSteps::ParallelStep`
//! (`src/asyncsteps.cpp`): a normal step (`process_cb` as its `func_`) whose
//! extended data holds one nested `AsyncSteps` per branch, built eagerly
//! when [`ParallelFacade::add`]/`loop_`/`sync`/`await_` is called but not
//! *started* until the parallel step itself reaches the front of the queue.
//! [`ParallelFacade`] reuses the ordinary [`Protector`] extension methods
//! for each branch's root step instead of re-deriving add/loop/sync/await,
//! since a branch is just another engine.

use std::{any::Any, rc::Rc, time::Duration};

use crate::engine::engine::EngineInner;
use crate::engine::error::{ErrorCode, StepOutcome};
use crate::engine::protector::Protector;
use crate::engine::queue::{ErrorFn, ExtState, NodeRef, ParallelState};
use crate::sync::SyncPrimitive;

/// Restricted view over one `parallel()` step returned to the caller
/// building its branches. Each method call seeds one new branch engine;
/// chaining work *within* a branch happens inside the body closure itself,
/// via the [`Protector`] it's handed.
pub struct ParallelFacade {
    parent: Rc<EngineInner>,
    node: NodeRef,
}

impl ParallelFacade {
    pub(crate) fn new(parent: Rc<EngineInner>, node: NodeRef) -> Self {
        ParallelFacade { parent, node }
    }

    /// Build a fresh branch engine sharing the parent's `state()` map and
    /// reactor, register it in this parallel step's [`ParallelState`], and
    /// return the `Protector` for its (as yet unstarted) root step.
    fn new_branch(&self) -> Protector {
        let sink_parent = self.parent.clone();
        let sink_node = self.node.clone();
        let branch = EngineInner::new_branch(
            self.parent.reactor.clone(),
            self.parent.state_map.clone(),
            Box::new(move |outcome| on_branch_done(&sink_parent, &sink_node, outcome)),
        );

        if let Some(ExtState::Parallel(ps)) = &mut self.node.borrow_mut().ext {
            ps.children.push(branch.clone());
            ps.total = ps.children.len();
        }

        Protector::new(branch.clone(), branch.root.clone())
    }

    pub fn add<F>(&self, body: F, on_error: Option<ErrorFn>) -> &Self
    where
        F: FnMut(&Protector, &[Rc<dyn Any>]) + 'static,
    {
        self.new_branch().add(body, on_error);
        self
    }

    pub fn loop_<F>(&self, body: F, label: Option<&str>) -> &Self
    where
        F: FnMut(&Protector, u64) + 'static,
    {
        self.new_branch().loop_(body, label);
        self
    }

    pub fn sync<F>(&self, primitive: Rc<dyn SyncPrimitive>, body: F, on_error: Option<ErrorFn>) -> &Self
    where
        F: FnMut(&Protector, &[Rc<dyn Any>]) + 'static,
    {
        self.new_branch().sync(primitive, body, on_error);
        self
    }

    pub fn await_<F>(&self, poll: F) -> &Self
    where
        F: FnMut(&Protector, Duration, bool) -> bool + 'static,
    {
        self.new_branch().await_(poll);
        self
    }
}

impl Protector {
    /// Append a `parallel()` step to the current step's sub-queue and
    /// return the facade used to seed its branches.
    pub fn parallel(&self, on_error: Option<ErrorFn>) -> ParallelFacade {
        let child = self.inner.append_child(&self.node, None, on_error);
        if let Some(cap) = &self.inner.capacity {
            cap.alloc_extended();
        }
        {
            let mut n = child.borrow_mut();
            n.flags.have_extended = true;
            n.ext = Some(ExtState::Parallel(ParallelState {
                children: Vec::new(),
                total: 0,
                completed: std::cell::Cell::new(0),
                error: std::cell::RefCell::new(None),
            }));
        }
        ParallelFacade::new(self.inner.clone(), child)
    }
}

/// Dispatch entry point called by `engine::engine::EngineInner::invoke_body`
/// once a `parallel()` step reaches the front of its queue: starts every
/// registered branch and marks the step long-running. Vacuously succeeds a
/// `parallel()` with no branches registered.
pub(crate) fn start_parallel(engine: &Rc<EngineInner>, node: &NodeRef) {
    node.borrow_mut().flags.have_wait = true;

    let branches: Vec<Rc<EngineInner>> = match &node.borrow().ext {
        Some(ExtState::Parallel(ps)) => ps.children.clone(),
        _ => unreachable!("start_parallel called on a non-parallel step"),
    };

    if branches.is_empty() {
        Protector::new(engine.clone(), node.clone()).success();
        return;
    }

    for branch in branches {
        branch.start();
    }
}

fn on_branch_done(parent: &Rc<EngineInner>, node: &NodeRef, outcome: StepOutcome) {
    match outcome {
        StepOutcome::Success(_) => on_branch_success(parent, node),
        StepOutcome::Error(code, info) => on_branch_error(parent, node, code, info),
    }
}

fn on_branch_success(parent: &Rc<EngineInner>, node: &NodeRef) {
    let (total, completed_now) = match &node.borrow().ext {
        Some(ExtState::Parallel(ps)) => {
            ps.completed.set(ps.completed.get() + 1);
            (ps.total, ps.completed.get())
        }
        // The parallel step was already resolved (e.g. a sibling's error
        // already cancelled every branch, this one raced to finish too).
        None => return,
        _ => unreachable!(),
    };

    if completed_now < total {
        return;
    }

    let engine = parent.clone();
    let node = node.clone();
    parent.reactor.immediate(move || {
        Protector::new(engine, node).success();
    });
}

fn on_branch_error(parent: &Rc<EngineInner>, node: &NodeRef, code: ErrorCode, info: Option<Rc<dyn Any>>) {
    let first_error = match &node.borrow().ext {
        Some(ExtState::Parallel(ps)) => {
            let mut err = ps.error.borrow_mut();
            if err.is_some() {
                false
            } else {
                *err = Some(code.clone());
                true
            }
        }
        None => false,
    };
    if !first_error {
        return;
    }

    if let Some(ExtState::Parallel(ps)) = &node.borrow().ext {
        for child in &ps.children {
            child.cancel_onthread();
        }
    }

    let engine = parent.clone();
    let node = node.clone();
    parent.reactor.immediate(move || {
        Protector::new(engine, node).error(code, info);
    });
}
