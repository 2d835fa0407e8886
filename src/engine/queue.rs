//! The step record and its owning tree (spec.md §3 `StepData`).
//!
//! The reference stores steps in one flat deque and reaches children via
//! `[sub_queue_start, sub_queue_front)` index ranges into it (design note:
//! "arena of step records plus stable indices"). That discipline exists to
//! avoid a pointer graph built with placement-new. Safe Rust already has a
//! pointer-graph representation with none of placement-new's hazards: an
//! owned tree of `Rc<RefCell<StepNode>>` with `Weak` parent links. A child's
//! lifetime is tied to its parent's `children` deque exactly as I1 requires
//! ("children occupy a contiguous suffix... reclaimed on completion"),
//! reclamation is just `VecDeque::pop_front` plus ordinary `Drop`, and the
//! "current step" is a clone of an `Rc`, not a raw index into a shared
//! array. See DESIGN.md for the full rationale.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::{Rc, Weak},
};

use crate::core::handle::Handle;
use crate::engine::error::ErrorCode;
use crate::engine::protector::Protector;

pub(crate) type NodeRef = Rc<RefCell<StepNode>>;

pub type StepFn = Box<dyn FnMut(&Protector, &[Rc<dyn Any>])>;
pub type ErrorFn = Box<dyn FnMut(&Protector, ErrorCode)>;
pub type CancelFn = Box<dyn FnOnce()>;

/// flags in spec.md §3; `RepeatStep` lives alongside them rather than on
/// `ext_state` since plain `loop()`/`repeat()` are the only producers but
/// dispatch needs to check it on every step, extended or not.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct StepFlags {
    pub have_cancel: bool,
    pub have_timeout: bool,
    pub have_wait: bool,
    pub have_extended: bool,
    pub repeat_step: bool,
}

impl StepFlags {
    /// True once the step has marked itself long-running via any of the
    /// three suspension-point operations (spec.md §5).
    pub(crate) fn suspended(&self) -> bool {
        self.have_wait || self.have_timeout
    }
}

pub(crate) struct LoopState {
    pub label: Option<Rc<str>>,
    pub iteration: Cell<u64>,
    pub limit: Option<u64>,
}

pub(crate) struct ParallelState {
    pub children: Vec<Rc<crate::engine::engine::EngineInner>>,
    pub total: usize,
    pub completed: Cell<usize>,
    pub error: RefCell<Option<ErrorCode>>,
}

pub(crate) enum ExtState {
    Loop(LoopState),
    Parallel(ParallelState),
}

/// One node of the step tree (`StepData` in spec.md §3).
pub(crate) struct StepNode {
    pub func: Option<StepFn>,
    pub on_error: Option<ErrorFn>,
    pub cancel_fn: Option<CancelFn>,
    pub timeout_handle: Cell<Handle>,
    pub flags: StepFlags,
    pub parent: Option<Weak<RefCell<StepNode>>>,
    pub children: VecDeque<NodeRef>,
    pub ext: Option<ExtState>,
    pub stack_allocs: Vec<Box<dyn Any>>,
    /// Set once this invocation's body has run; cleared for the next
    /// iteration of a `RepeatStep`.
    pub body_invoked: bool,
}

impl StepNode {
    pub(crate) fn new_root() -> NodeRef {
        Rc::new(RefCell::new(StepNode {
            func: None,
            on_error: None,
            cancel_fn: None,
            timeout_handle: Cell::new(Handle::NULL),
            flags: StepFlags::default(),
            parent: None,
            children: VecDeque::new(),
            ext: None,
            stack_allocs: Vec::new(),
            body_invoked: true,
        }))
    }

    pub(crate) fn new_child(parent: &NodeRef, func: Option<StepFn>, on_error: Option<ErrorFn>) -> NodeRef {
        Rc::new(RefCell::new(StepNode {
            func,
            on_error,
            cancel_fn: None,
            timeout_handle: Cell::new(Handle::NULL),
            flags: StepFlags::default(),
            parent: Some(Rc::downgrade(parent)),
            children: VecDeque::new(),
            ext: None,
            stack_allocs: Vec::new(),
            body_invoked: false,
        }))
    }
}
