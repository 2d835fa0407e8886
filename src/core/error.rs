use snafu::Snafu;

/// Errors surfaced by the [`Reactor`](crate::core::reactor::Reactor).
///
/// Misuse that spec.md classifies as fatal (e.g. a `deferred` delay under
/// the 100ms floor) panics instead of returning one of these: see
/// [`Reactor::deferred`](crate::core::reactor::Reactor::deferred).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ReactorError {
    #[snafu(display("reactor thread failed to start: {source}"))]
    SpawnFailed { source: std::io::Error },

    #[snafu(display(
        "cross-thread task queue is full ({capacity} entries in flight)"
    ))]
    TaskQueueFull { capacity: usize },

    #[snafu(display("reactor has already been shut down"))]
    Shutdown,
}
