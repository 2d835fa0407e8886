//! The step engine (spec.md §2 `AsyncSteps`): a hierarchical, queue-based
//! state machine built on top of a [`crate::core::reactor::Reactor`].
//!
//! Mirrors the layout of the teacher's `io-engine::core` modules, one file
//! per concern rather than one god-object: `queue` owns the step tree,
//! `protector` is the programmer-facing facade, `engine` is the dispatcher,
//! and `loop_ext`/`sync_ext`/`await_ext`/`parallel` each add one family of
//! `Protector` methods (spec.md §2's "Loop/Sync/Await extensions" and
//! "ParallelStep" rows) as separate `impl Protector` blocks.

pub mod await_ext;
pub mod engine;
pub mod error;
pub mod fixed;
pub mod loop_ext;
pub mod parallel;
pub mod protector;
pub mod queue;
pub mod sync_ext;

pub use engine::{AsyncSteps, AsyncStepsRemote};
pub use error::{codes, ErrorCode};
pub use protector::Protector;
pub use queue::{CancelFn, ErrorFn, StepFn};
