//! Reactor-side primitives: the event loop, cookie-validated handles, the
//! cross-thread marshalling queue and the typed memory-pool facade.
//!
//! This mirrors the layout of the teacher's `io-engine::core` module:
//! `Reactor`/`Reactors` there, `Reactor`/`ReactorRemote` here; `MemoryPool`
//! there, `MemPool` here.

pub mod cross_thread;
pub mod error;
pub mod handle;
pub mod mempool;
pub mod reactor;

pub use error::ReactorError;
pub use handle::Handle;
pub use mempool::MemPool;
pub use reactor::{CycleResult, Reactor, ReactorRemote, ReactorState, BURST_COUNT, MIN_DEFERRED_DELAY};
