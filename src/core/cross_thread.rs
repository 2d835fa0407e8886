//! Marshalling of off-thread reactor operations (I7 in spec.md).
//!
//! Any caller that is not on the reactor thread pushes a boxed closure onto
//! a bounded queue and parks on a one-shot channel until the reactor thread
//! pops and runs it. This keeps every mutation of reactor/engine state on a
//! single thread, the same discipline the teacher's `Reactor::send_future`
//! channel gives DPDK cores.

use crossbeam::channel::{bounded, Receiver, Sender};
use futures::channel::oneshot;

use crate::core::error::ReactorError;

/// Default capacity mirrors the reference's `BURST_COUNT * 10`.
pub(crate) const TASK_QUEUE_CAPACITY: usize = 1_000;

pub(crate) type MarshalledTask = Box<dyn FnOnce() + Send + 'static>;

/// The reactor-owned end of the cross-thread task queue.
pub(crate) struct TaskQueue {
    tx: Sender<MarshalledTask>,
    rx: Receiver<MarshalledTask>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = bounded(TASK_QUEUE_CAPACITY);
        TaskQueue { tx, rx }
    }

    pub(crate) fn sender(&self) -> Sender<MarshalledTask> {
        self.tx.clone()
    }

    /// Drain and execute every queued task; called only from the reactor
    /// thread (dispatch step 4).
    pub(crate) fn drain(&self) {
        while let Ok(task) = self.rx.try_recv() {
            task();
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Runs `f` on the reactor thread and blocks the caller until it completes,
/// returning `f`'s result. Used by operations such as `Reactor::cancel` that
/// must be callable from any thread but only ever mutate state on-thread.
pub(crate) fn marshal<F, T>(
    tx: &Sender<MarshalledTask>,
    poke: &(dyn Fn() + Send + Sync),
    f: F,
) -> Result<T, ReactorError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();
    let task: MarshalledTask = Box::new(move || {
        let result = f();
        // The reactor thread does not care whether the caller is still
        // waiting; a dropped receiver just means the result is discarded.
        let _ = done_tx.send(result);
    });

    tx.try_send(task).map_err(|_| ReactorError::TaskQueueFull {
        capacity: TASK_QUEUE_CAPACITY,
    })?;
    poke();

    futures::executor::block_on(done_rx).map_err(|_| ReactorError::Shutdown)
}
