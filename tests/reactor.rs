//! Integration tests for [`asyncsteps_rt::Reactor`] (spec.md §4.1, P1/P6/I6).

use std::{
    cell::Cell,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use asyncsteps_rt::{AsyncSteps, Reactor};

#[test]
fn immediate_callbacks_run_in_fifo_order() {
    let reactor = Reactor::new_external();
    reactor.bind_current_thread();

    let order = Rc::new(std::cell::RefCell::new(Vec::new()));
    for i in 0 .. 5 {
        let order = order.clone();
        reactor.immediate(move || order.borrow_mut().push(i));
    }

    reactor.iterate();
    assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn cancelling_an_immediate_skips_its_callback() {
    let reactor = Reactor::new_external();
    reactor.bind_current_thread();

    let ran = Rc::new(Cell::new(false));
    let handle = {
        let ran = ran.clone();
        reactor.immediate(move || ran.set(true))
    };

    assert!(reactor.is_valid(handle));
    reactor.cancel(handle);
    assert!(!reactor.is_valid(handle));

    reactor.iterate();
    assert!(!ran.get());
}

#[test]
fn deferred_does_not_fire_before_its_delay_elapses() {
    let reactor = Reactor::new_external();
    reactor.bind_current_thread();

    let fired = Rc::new(Cell::new(false));
    {
        let fired = fired.clone();
        reactor.deferred(Duration::from_millis(150), move || fired.set(true));
    }

    reactor.iterate();
    assert!(!fired.get(), "deferred callback fired before its delay elapsed");

    std::thread::sleep(Duration::from_millis(170));
    reactor.iterate();
    assert!(fired.get(), "deferred callback never fired after its delay elapsed");
}

#[test]
#[should_panic(expected = "below the")]
fn deferred_below_the_minimum_delay_is_fatal() {
    let reactor = Reactor::new_external();
    reactor.bind_current_thread();
    reactor.deferred(Duration::from_millis(1), || {});
}

#[test]
fn a_fired_handle_is_no_longer_valid() {
    let reactor = Reactor::new_external();
    reactor.bind_current_thread();

    let handle = reactor.immediate(|| {});
    reactor.iterate();
    assert!(!reactor.is_valid(handle), "a fired slot's cookie must not validate a stale handle");
}

#[test]
fn a_reused_slot_never_aliases_the_old_handle() {
    let reactor = Reactor::new_external();
    reactor.bind_current_thread();

    let first = reactor.immediate(|| {});
    reactor.iterate();
    // The freed slot is recycled for the next allocation; its cookie must
    // differ so `first` never validates again (I6).
    let second = reactor.immediate(|| {});
    assert!(!reactor.is_valid(first));
    assert!(reactor.is_valid(second));
}

#[test]
fn spawn_runs_a_step_tree_on_its_own_thread_and_shuts_down_on_request() {
    let ran = Arc::new(AtomicBool::new(false));

    let (join, remote) = {
        let ran = ran.clone();
        Reactor::spawn(move |reactor| {
            let steps = AsyncSteps::new(reactor.clone());
            let ran = ran.clone();
            steps.add(
                move |p, _args| {
                    ran.store(true, Ordering::SeqCst);
                    p.success();
                },
                None,
            );
            steps.execute();
        })
        .expect("failed to spawn reactor thread")
    };

    // The spawned thread's own reactor, not this one, drains the step; give
    // it a moment before asking it to stop.
    std::thread::sleep(Duration::from_millis(50));
    remote.shutdown();
    join.join().expect("reactor thread panicked");

    assert!(ran.load(Ordering::SeqCst), "step never ran on the spawned reactor thread");
}
