//! Integration tests for [`asyncsteps_rt::AsyncSteps`] (spec.md §8 scenarios
//! 1-6): chained steps, error unwinding, loop break, parallel fan-in, and
//! cancellation.

use std::{cell::RefCell, rc::Rc};

use assert_matches::assert_matches;
use asyncsteps_rt::sync::{Mutex, SyncPrimitive};
use asyncsteps_rt::{AsyncSteps, ErrorCode, Reactor};

fn run_to_completion(reactor: &Reactor) {
    for _ in 0 .. 1000 {
        let cycle = reactor.iterate();
        if !cycle.have_work {
            break;
        }
    }
}

#[test]
fn a_chain_runs_its_steps_in_order() {
    let reactor = Rc::new(Reactor::new_external());
    reactor.bind_current_thread();
    let steps = AsyncSteps::new(reactor.clone());
    let order = Rc::new(RefCell::new(Vec::new()));

    {
        let order = order.clone();
        steps.add(move |p, _args| {
            order.borrow_mut().push(1);
            p.success();
        }, None);
    }
    {
        let order = order.clone();
        steps.add(move |p, _args| {
            order.borrow_mut().push(2);
            p.success();
        }, None);
    }

    steps.execute();
    run_to_completion(&reactor);

    assert_eq!(*order.borrow(), vec![1, 2]);
}

#[test]
fn a_nested_add_runs_inside_its_parent_before_the_next_sibling() {
    let reactor = Rc::new(Reactor::new_external());
    reactor.bind_current_thread();
    let steps = AsyncSteps::new(reactor.clone());
    let order = Rc::new(RefCell::new(Vec::new()));

    {
        let order = order.clone();
        steps.add(move |p, _args| {
            order.borrow_mut().push("outer");
            let order = order.clone();
            p.add(move |p, _args| {
                order.borrow_mut().push("nested");
                p.success();
            }, None);
        }, None);
    }
    {
        let order = order.clone();
        steps.add(move |p, _args| {
            order.borrow_mut().push("sibling");
            p.success();
        }, None);
    }

    steps.execute();
    run_to_completion(&reactor);

    assert_eq!(*order.borrow(), vec!["outer", "nested", "sibling"]);
}

#[test]
fn a_handler_that_calls_success_resolves_the_error_and_the_chain_continues() {
    // The error originates from a child step with no `on_error` of its
    // own, so the search climbs to the child's parent and finds the
    // handler there; calling success() inside it resumes normal execution
    // from that parent onward, including its own siblings.
    let reactor = Rc::new(Reactor::new_external());
    reactor.bind_current_thread();
    let steps = AsyncSteps::new(reactor.clone());
    let seen_error: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
    let ran_next_step = Rc::new(RefCell::new(false));

    {
        let seen_error = seen_error.clone();
        steps.add(
            move |p, _args| {
                p.add(
                    |p, _args| {
                        p.error("boom", None);
                    },
                    None,
                );
            },
            Some(Box::new(move |p: &asyncsteps_rt::Protector, code: ErrorCode| {
                *seen_error.borrow_mut() = Some(code.as_str().to_string());
                p.success();
            })),
        );
    }
    {
        let ran_next_step = ran_next_step.clone();
        steps.add(move |p, _args| {
            *ran_next_step.borrow_mut() = true;
            p.success();
        }, None);
    }

    steps.on_unhandled_error(|code| panic!("error {code} should have been resolved by the handler"));
    steps.execute();
    run_to_completion(&reactor);

    assert_matches!(seen_error.borrow().as_deref(), Some("boom"));
    assert!(*ran_next_step.borrow(), "resolving the error must let the tree continue");
}

#[test]
fn an_error_with_no_resolving_handler_reaches_the_unhandled_error_hook() {
    // The handler here only observes the error and returns without
    // calling success()/error(); per spec.md §7 item 4 that propagates
    // the same error further up instead of stopping it, and with no
    // ancestor left to ask it reaches the root's unhandled-error hook.
    let reactor = Rc::new(Reactor::new_external());
    reactor.bind_current_thread();
    let steps = AsyncSteps::new(reactor.clone());
    let seen_by_handler: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
    let unhandled: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));

    {
        let seen_by_handler = seen_by_handler.clone();
        steps.add(
            move |p, _args| {
                p.add(
                    |p, _args| {
                        p.error("boom", None);
                    },
                    None,
                );
            },
            Some(Box::new(move |_p: &asyncsteps_rt::Protector, code: ErrorCode| {
                *seen_by_handler.borrow_mut() = Some(code.as_str().to_string());
            })),
        );
    }

    {
        let unhandled = unhandled.clone();
        steps.on_unhandled_error(move |code| {
            *unhandled.borrow_mut() = Some(code.as_str().to_string());
        });
    }
    steps.execute();
    run_to_completion(&reactor);

    assert_eq!(seen_by_handler.borrow().as_deref(), Some("boom"));
    assert_eq!(unhandled.borrow().as_deref(), Some("boom"));
}

#[test]
fn a_steps_own_handler_catches_an_error_its_own_body_raises_directly() {
    // Regression test: `add(|p| p.error(...), Some(handler))` -- no
    // descendant involved, the step's own body raises the error -- must
    // still reach its own `on_error`, not skip straight to the root.
    let reactor = Rc::new(Reactor::new_external());
    reactor.bind_current_thread();
    let steps = AsyncSteps::new(reactor.clone());
    let seen_error: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));

    {
        let seen_error = seen_error.clone();
        steps.add(
            |p, _args| {
                p.error("boom", None);
            },
            Some(Box::new(move |p: &asyncsteps_rt::Protector, code: ErrorCode| {
                *seen_error.borrow_mut() = Some(code.as_str().to_string());
                p.success();
            })),
        );
    }

    steps.on_unhandled_error(|code| panic!("error {code} should have been resolved by its own handler"));
    steps.execute();
    run_to_completion(&reactor);

    assert_matches!(seen_error.borrow().as_deref(), Some("boom"));
}

#[test]
fn a_recovering_handler_does_not_panic_on_a_sibling_left_in_the_sub_queue() {
    // Regression test: child A errors, child B (a sibling that never ran)
    // is still sitting in the parent's sub-queue, and the parent's
    // `on_error` recovers via success(). The still-pending sibling must be
    // abandoned before success() runs, or `handle_success`'s "non-empty
    // sub-queue" assertion fires; and the outer chain must still be able
    // to complete normally afterward.
    let reactor = Rc::new(Reactor::new_external());
    reactor.bind_current_thread();
    let steps = AsyncSteps::new(reactor.clone());
    let sibling_ran = Rc::new(RefCell::new(false));
    let outer_completed = Rc::new(RefCell::new(false));

    {
        let sibling_ran = sibling_ran.clone();
        steps.add(
            move |p, _args| {
                p.add(|p, _args| p.error("boom", None), None);
                let sibling_ran = sibling_ran.clone();
                p.add(
                    move |p, _args| {
                        *sibling_ran.borrow_mut() = true;
                        p.success();
                    },
                    None,
                );
            },
            Some(Box::new(move |p: &asyncsteps_rt::Protector, _code: ErrorCode| {
                p.success();
            })),
        );
    }
    {
        let outer_completed = outer_completed.clone();
        steps.add(
            move |p, _args| {
                *outer_completed.borrow_mut() = true;
                p.success();
            },
            None,
        );
    }

    steps.on_unhandled_error(|code| panic!("error {code} should have been resolved by the handler"));
    steps.execute();
    run_to_completion(&reactor);

    assert!(!*sibling_ran.borrow(), "the never-started sibling must be abandoned, not run");
    assert!(*outer_completed.borrow(), "recovery must let the rest of the chain run");
}

#[test]
fn break_loop_stops_a_loop_before_its_body_runs_again() {
    let reactor = Rc::new(Reactor::new_external());
    reactor.bind_current_thread();
    let steps = AsyncSteps::new(reactor.clone());
    let iterations = Rc::new(RefCell::new(Vec::new()));

    {
        let iterations = iterations.clone();
        steps.add(
            move |p, _args| {
                let iterations = iterations.clone();
                p.loop_(
                    move |p, i| {
                        iterations.borrow_mut().push(i);
                        if i == 2 {
                            p.break_loop(None);
                        }
                    },
                    None,
                );
            },
            None,
        );
    }

    steps.execute();
    run_to_completion(&reactor);

    assert_eq!(*iterations.borrow(), vec![0, 1, 2]);
}

#[test]
fn continue_loop_advances_exactly_one_iteration_per_call() {
    // Regression test: `continue_loop()` must schedule exactly one more
    // dispatch tick, not two -- a step whose body calls it must not have
    // its next iteration run twice (or get skipped) because of a
    // redundant `schedule_continue()`.
    let reactor = Rc::new(Reactor::new_external());
    reactor.bind_current_thread();
    let steps = AsyncSteps::new(reactor.clone());
    let iterations = Rc::new(RefCell::new(Vec::new()));

    {
        let iterations = iterations.clone();
        steps.add(
            move |p, _args| {
                let iterations = iterations.clone();
                p.loop_(
                    move |p, i| {
                        iterations.borrow_mut().push(i);
                        if i == 1 {
                            p.continue_loop(None);
                        } else if i == 4 {
                            p.break_loop(None);
                        }
                    },
                    None,
                );
            },
            None,
        );
    }

    steps.execute();
    run_to_completion(&reactor);

    assert_eq!(*iterations.borrow(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn repeat_runs_exactly_n_times_then_succeeds_on_its_own() {
    let reactor = Rc::new(Reactor::new_external());
    reactor.bind_current_thread();
    let steps = AsyncSteps::new(reactor.clone());
    let count = Rc::new(RefCell::new(0u64));
    let finished = Rc::new(RefCell::new(false));

    {
        let count = count.clone();
        steps.add(
            move |p, _args| {
                let count = count.clone();
                p.repeat(3, move |_p, _i| *count.borrow_mut() += 1, None);
            },
            None,
        );
    }
    {
        let finished = finished.clone();
        steps.add(move |p, _args| {
            *finished.borrow_mut() = true;
            p.success();
        }, None);
    }

    steps.execute();
    run_to_completion(&reactor);

    assert_eq!(*count.borrow(), 3);
    assert!(*finished.borrow());
}

#[test]
fn parallel_waits_for_every_branch_before_succeeding() {
    let reactor = Rc::new(Reactor::new_external());
    reactor.bind_current_thread();
    let steps = AsyncSteps::new(reactor.clone());
    let done: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    {
        let done = done.clone();
        steps.add(
            move |p, _args| {
                let facade = p.parallel(None);
                {
                    let done = done.clone();
                    facade.add(move |p, _args| {
                        done.borrow_mut().push("a");
                        p.success();
                    }, None);
                }
                {
                    let done = done.clone();
                    facade.add(move |p, _args| {
                        done.borrow_mut().push("b");
                        p.success();
                    }, None);
                }
            },
            None,
        );
    }

    steps.execute();
    run_to_completion(&reactor);

    let mut seen = done.borrow().clone();
    seen.sort();
    assert_eq!(seen, vec!["a", "b"]);
}

#[test]
fn parallel_propagates_the_first_branch_error_and_cancels_the_rest() {
    let reactor = Rc::new(Reactor::new_external());
    reactor.bind_current_thread();
    let steps = AsyncSteps::new(reactor.clone());
    let cancelled = Rc::new(RefCell::new(false));
    let handled = Rc::new(RefCell::new(None));

    {
        let cancelled = cancelled.clone();
        let handled = handled.clone();
        steps.add(
            move |p, _args| {
                let facade = p.parallel(None);
                facade.add(
                    |p, _args| {
                        p.error("branch-fail", None);
                    },
                    None,
                );
                {
                    let cancelled = cancelled.clone();
                    facade.add(
                        move |p, _args| {
                            let cancelled = cancelled.clone();
                            p.set_cancel(move || *cancelled.borrow_mut() = true);
                            p.wait_external();
                        },
                        None,
                    );
                }
                let _ = &handled;
            },
            Some(Box::new(move |p: &asyncsteps_rt::Protector, code: ErrorCode| {
                *handled.borrow_mut() = Some(code.as_str().to_string());
                p.success();
            })),
        );
    }

    steps.on_unhandled_error(|code| panic!("error {code} should have been resolved by the handler"));
    steps.execute();
    run_to_completion(&reactor);

    assert_eq!(handled.borrow().as_deref(), Some("branch-fail"));
    assert!(*cancelled.borrow(), "the sibling branch must be cancelled once the first error wins");
}

#[test]
fn cancel_invokes_the_cancel_hook_of_every_suspended_step() {
    let reactor = Rc::new(Reactor::new_external());
    reactor.bind_current_thread();
    let steps = AsyncSteps::new(reactor.clone());
    let cancelled = Rc::new(RefCell::new(false));

    {
        let cancelled = cancelled.clone();
        steps.add(
            move |p, _args| {
                let cancelled = cancelled.clone();
                p.set_cancel(move || *cancelled.borrow_mut() = true);
                p.wait_external();
            },
            None,
        );
    }

    steps.execute();
    run_to_completion(&reactor);
    assert!(!*cancelled.borrow(), "the step is still waiting; its cancel hook must not have fired yet");

    steps.cancel();
    assert!(*cancelled.borrow());
}

#[test]
fn a_fired_timeout_delivers_the_reserved_timeout_code() {
    let reactor = Rc::new(Reactor::new_external());
    reactor.bind_current_thread();
    let steps = AsyncSteps::new(reactor.clone());
    let seen = Rc::new(RefCell::new(None));

    {
        let seen = seen.clone();
        steps.add(
            move |p, _args| {
                p.add(
                    |p, _args| {
                        p.set_timeout(std::time::Duration::from_millis(150));
                        p.wait_external();
                    },
                    None,
                );
            },
            Some(Box::new(move |p: &asyncsteps_rt::Protector, code: ErrorCode| {
                *seen.borrow_mut() = Some(code.as_str().to_string());
                p.success();
            })),
        );
    }

    steps.on_unhandled_error(|code| panic!("timeout {code} should have been resolved by the handler"));
    steps.execute();
    run_to_completion(&reactor);
    assert!(seen.borrow().is_none(), "the timeout fired too early");

    std::thread::sleep(std::time::Duration::from_millis(170));
    run_to_completion(&reactor);

    assert_eq!(seen.borrow().as_deref(), Some("Timeout"));
}

#[test]
fn mutex_gated_steps_run_in_insertion_order_and_every_waiter_gets_its_turn() {
    // spec.md §8 scenario 6 / P7: 10 independent engines each running one
    // `sync(mutex, body)` step, `max=1`, must all complete, handed the
    // lock off in the order they first asked for it, with no holder count
    // ever exceeding 1. Each engine has its own `sync_root_id`, so -- unlike
    // sibling steps on one engine, which share an id and only ever
    // recursively re-acquire -- these genuinely contend and queue. Before
    // the fix to `sync_ext`'s grant callback, a queued waiter's hand-off
    // never re-scheduled its engine, so this test would hang instead of
    // reaching completion.
    let reactor = Rc::new(Reactor::new_external());
    reactor.bind_current_thread();
    let mutex = Mutex::new(1, 16);
    let order = Rc::new(RefCell::new(Vec::new()));
    let counter = Rc::new(RefCell::new(0u32));
    let max_seen_holders = Rc::new(RefCell::new(0usize));

    let engines: Vec<AsyncSteps> = (0 .. 10u32)
        .map(|i| {
            let engine = AsyncSteps::new(reactor.clone());
            let order = order.clone();
            let counter = counter.clone();
            let primitive: Rc<dyn SyncPrimitive> = Rc::new(mutex.clone());
            let mutex_for_check = mutex.clone();
            let max_seen_holders = max_seen_holders.clone();
            engine.add(
                move |p, _args| {
                    let order = order.clone();
                    let counter = counter.clone();
                    let mutex_for_check = mutex_for_check.clone();
                    let max_seen_holders = max_seen_holders.clone();
                    p.sync(
                        primitive.clone(),
                        move |_p, _args| {
                            let holders = mutex_for_check.holder_count();
                            let mut seen = max_seen_holders.borrow_mut();
                            *seen = (*seen).max(holders);
                            order.borrow_mut().push(i);
                            *counter.borrow_mut() += 1;
                        },
                        None,
                    );
                },
                None,
            );
            engine
        })
        .collect();

    for engine in &engines {
        engine.execute();
    }
    run_to_completion(&reactor);

    assert_eq!(*counter.borrow(), 10);
    assert_eq!(*order.borrow(), (0 .. 10).collect::<Vec<_>>());
    assert!(*max_seen_holders.borrow() <= 1, "mutex(max=1) must never have more than one holder");
    assert_eq!(mutex.holder_count(), 0, "every acquire must have been matched by a release");
    assert_eq!(mutex.queue_len(), 0);
}
