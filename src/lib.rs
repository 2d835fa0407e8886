//! `asyncsteps-rt`: an embeddable, cooperative, single-reactor execution
//! runtime for hierarchical trees of steps.
//!
//! The crate is two tightly-coupled subsystems, laid out the way the
//! teacher (`io-engine`) separates its own core from the subsystems built
//! on it:
//!
//! - [`core`] -- the reactor (`AsyncTool`): immediate/deferred dispatch,
//!   cookie-validated handles, cross-thread marshalling, the memory-pool
//!   facade.
//! - [`engine`] -- the step engine (`AsyncSteps`): the queue discipline,
//!   the `Protector` step API, loop/sync/await/parallel extensions, and the
//!   fixed-storage variant.
//! - [`sync`] -- pluggable `lock`/`unlock` primitives (`Mutex`, `Throttle`,
//!   `Limiter`) the step engine composes into gated steps.
//! - [`ffi`] -- the stable slot layout of the cross-ABI bridge described at
//!   spec.md §6 (interface only; no native bridging runtime is built here).
//! - [`config`]/[`logger`] -- the ambient stack: CLI-constructible runtime
//!   configuration and a `tracing`-based log/trace setup, in the shape the
//!   teacher's own binaries use.

#[macro_use]
extern crate tracing;

pub mod config;
pub mod core;
pub mod engine;
pub mod ffi;
pub mod logger;
pub mod sync;

pub use core::reactor::{CycleResult, Reactor, ReactorRemote, ReactorState};
pub use core::{Handle, MemPool, ReactorError};
pub use engine::{codes, AsyncSteps, AsyncStepsRemote, CancelFn, ErrorCode, ErrorFn, Protector, StepFn};
