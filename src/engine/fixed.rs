//! Fixed-storage variant (spec.md §4.3): the same dispatch discipline as
//! [`crate::engine::engine::AsyncSteps`], but every allocation is checked
//! against a compile-time capacity instead of growing, and exceeding any of
//! them is fatal.
//!
//! The reference keeps this as a second, array-backed implementation of the
//! whole engine. This port takes a narrower but behavior-preserving route:
//! the queue discipline in `engine::engine`/`engine::queue` is already an
//! arena of `Rc<RefCell<StepNode>>` nodes (see `queue.rs`'s module doc for
//! why), so "fixed storage" here means the same engine with a [`Capacity`]
//! budget attached that panics the moment any one of spec.md §4.3's five
//! counters would be exceeded, rather than a second from-scratch
//! implementation of the step tree over raw arrays. See DESIGN.md.

use std::cell::Cell;

use crate::core::reactor::Reactor;
use crate::engine::engine::{AsyncSteps, EngineInner};
use crate::engine::queue::StepNode;
use std::rc::Rc;

/// Per-engine counters checked against the fixed ceilings passed to
/// [`FixedAsyncSteps::new`]. Exceeding any of them panics (spec.md §4.2
/// "Fatal conditions... exceeding static capacity in the fixed-storage
/// variant").
pub(crate) struct Capacity {
    max_steps: usize,
    max_timeouts: usize,
    max_cancels: usize,
    max_extended: usize,
    max_stack_allocs: usize,
    steps: Cell<usize>,
    timeouts: Cell<usize>,
    cancels: Cell<usize>,
    extended: Cell<usize>,
    stack_allocs: Cell<usize>,
}

impl Capacity {
    pub(crate) fn alloc_step(&self) {
        assert!(
            self.steps.get() < self.max_steps,
            "fixed-storage engine exceeded max_steps={}",
            self.max_steps
        );
        self.steps.set(self.steps.get() + 1);
    }

    pub(crate) fn alloc_timeout(&self) {
        assert!(
            self.timeouts.get() < self.max_timeouts,
            "fixed-storage engine exceeded max_timeouts={}",
            self.max_timeouts
        );
        self.timeouts.set(self.timeouts.get() + 1);
    }

    pub(crate) fn alloc_cancel(&self) {
        assert!(
            self.cancels.get() < self.max_cancels,
            "fixed-storage engine exceeded max_cancels={}",
            self.max_cancels
        );
        self.cancels.set(self.cancels.get() + 1);
    }

    pub(crate) fn alloc_extended(&self) {
        assert!(
            self.extended.get() < self.max_extended,
            "fixed-storage engine exceeded max_extended_states={}",
            self.max_extended
        );
        self.extended.set(self.extended.get() + 1);
    }

    pub(crate) fn alloc_stack(&self) {
        assert!(
            self.stack_allocs.get() < self.max_stack_allocs,
            "fixed-storage engine exceeded max_stack_allocs={}",
            self.max_stack_allocs
        );
        self.stack_allocs.set(self.stack_allocs.get() + 1);
    }

    /// Release whatever `node` was still holding when it terminated, called
    /// from `EngineInner::cleanup_terminal`/`cancel_onthread` just before
    /// those clear the node's own fields.
    pub(crate) fn free_step(&self, node: &StepNode) {
        self.steps.set(self.steps.get().saturating_sub(1));
        if node.flags.have_timeout {
            self.timeouts.set(self.timeouts.get().saturating_sub(1));
        }
        if node.flags.have_cancel {
            self.cancels.set(self.cancels.get().saturating_sub(1));
        }
        if node.flags.have_extended {
            self.extended.set(self.extended.get().saturating_sub(1));
        }
        self.stack_allocs
            .set(self.stack_allocs.get().saturating_sub(node.stack_allocs.len()));
    }
}

/// Compile-time ceilings for one [`FixedAsyncSteps`] engine (spec.md §4.3:
/// "parameterizes over: max-steps, max-timeouts, max-cancels,
/// max-extended-states, max-stack-allocs, max-error-code-length").
///
/// `max_error_code_len` is enforced at the call site in
/// [`FixedAsyncSteps::error`] rather than inside [`Capacity`], since it
/// bounds a string rather than a pool slot count.
#[derive(Debug, Clone, Copy)]
pub struct FixedLimits {
    pub max_steps: usize,
    pub max_timeouts: usize,
    pub max_cancels: usize,
    pub max_extended_states: usize,
    pub max_stack_allocs: usize,
    pub max_error_code_len: usize,
}

impl Default for FixedLimits {
    /// Generous-but-bounded defaults suitable for an embedded hot path;
    /// tune per call site.
    fn default() -> Self {
        FixedLimits {
            max_steps: 64,
            max_timeouts: 16,
            max_cancels: 16,
            max_extended_states: 16,
            max_stack_allocs: 32,
            max_error_code_len: 32,
        }
    }
}

/// An [`AsyncSteps`] whose allocations are checked against [`FixedLimits`]
/// instead of growing unboundedly. Everything else -- `add`, `parallel`,
/// `loop_`, `sync`, `await_`, `execute`, `cancel` -- is the identical
/// `Protector` surface; this type only changes what happens when a program
/// asks for more than it budgeted.
pub struct FixedAsyncSteps {
    inner: AsyncSteps,
    limits: FixedLimits,
}

impl FixedAsyncSteps {
    pub fn new(reactor: Rc<Reactor>, limits: FixedLimits) -> Self {
        let capacity = Capacity {
            max_steps: limits.max_steps,
            max_timeouts: limits.max_timeouts,
            max_cancels: limits.max_cancels,
            max_extended: limits.max_extended_states,
            max_stack_allocs: limits.max_stack_allocs,
            steps: Cell::new(0),
            timeouts: Cell::new(0),
            cancels: Cell::new(0),
            extended: Cell::new(0),
            stack_allocs: Cell::new(0),
        };
        FixedAsyncSteps {
            inner: AsyncSteps::from_inner(EngineInner::new_with_capacity(reactor, capacity)),
            limits,
        }
    }

    /// Enforce `max_error_code_len` before handing `code` to the engine;
    /// fatal like every other capacity overrun in this variant.
    pub fn check_error_code(&self, code: &str) {
        assert!(
            code.len() <= self.limits.max_error_code_len,
            "fixed-storage error code {code:?} exceeds max_error_code_len={}",
            self.limits.max_error_code_len
        );
    }

    /// Borrow the underlying engine to use the full `Protector`-based API
    /// (`add`/`parallel`/`loop_`/`sync`/`await_`/`execute`/`cancel`/`state`).
    pub fn steps(&self) -> &AsyncSteps {
        &self.inner
    }
}
