//! Demo binary exercising the scenarios spec.md §8 describes: a plain
//! chain, a counted loop, a `parallel()` fan-out, a `Mutex`-gated step, an
//! `await()` poll, and a `set_timeout`/`set_cancel` pair. Modeled on the
//! teacher's own thin `main.rs` (`io-engine/src/bin/io-engine.rs`): parse
//! args, init logging, build the runtime, run it to completion.

use std::{rc::Rc, time::Duration};

use asyncsteps_rt::config::RuntimeConfig;
use asyncsteps_rt::core::reactor::Reactor;
use asyncsteps_rt::engine::fixed::{FixedAsyncSteps, FixedLimits};
use asyncsteps_rt::engine::AsyncSteps;
use asyncsteps_rt::sync::Mutex;
use asyncsteps_rt::{logger, ErrorCode};

fn build_scenario(steps: &AsyncSteps, reactor: Rc<Reactor>, cfg: &RuntimeConfig) {
    let mutex = Mutex::new(cfg.mutex_max, cfg.mutex_queue_max);

    steps.add(
        |p, _args| {
            tracing::info!("chain: first step");
            p.success();
        },
        None,
    );

    steps.add(
        |p, _args| {
            tracing::info!("chain: counted loop");
            p.repeat(
                3,
                |_p, i| {
                    // The wrapper `repeat()` installs advances the
                    // iteration and ends the step once `i` reaches the
                    // count; calling success()/error() here would resolve
                    // the whole repeat early instead of just this pass.
                    tracing::info!(iteration = i, "loop body");
                },
                None,
            );
        },
        None,
    );

    steps.add(
        |p, _args| {
            tracing::info!("chain: parallel fan-out");
            let facade = p.parallel(None);
            facade.add(
                |p, _args| {
                    tracing::info!("branch A");
                    p.success();
                },
                None,
            );
            facade.add(
                |p, _args| {
                    tracing::info!("branch B");
                    p.success();
                },
                None,
            );
            // Both branches were just appended as children of the parallel
            // step this body appended to `p`; auto-success takes over once
            // that sub-queue drains (calling success() here would fire
            // while `p` still has that one pending child).
        },
        None,
    );

    steps.add(
        move |p, _args| {
            tracing::info!("chain: mutex-gated step");
            p.sync(
                Rc::new(mutex.clone()),
                |p, _args| {
                    tracing::info!("inside the gate");
                    p.success();
                },
                None,
            );
        },
        None,
    );

    steps.add(
        |p, _args| {
            tracing::info!("chain: await a trivially-true condition");
            p.await_(|_p, _elapsed, _first| true);
        },
        None,
    );

    steps.add(
        |p, _args| {
            tracing::info!("chain: timeout raced against an immediate success");
            p.set_timeout(Duration::from_millis(200));
            p.set_cancel(|| tracing::info!("timeout step cancelled"));
            p.success();
        },
        None,
    );

    steps.add(
        move |_p, _args| {
            tracing::info!("chain complete, shutting the reactor down");
            reactor.shutdown();
        },
        None,
    );
}

fn main() {
    let cfg = RuntimeConfig::from_env_args();
    logger::init_ex(&cfg.log_level, cfg.log_format);

    let reactor = Rc::new(Reactor::new_external());
    reactor.bind_current_thread();

    if cfg.fixed_storage {
        let limits = FixedLimits::default();
        let fixed = FixedAsyncSteps::new(reactor.clone(), limits);
        fixed.steps().on_unhandled_error(|code: ErrorCode| {
            tracing::error!(%code, "unhandled step error reached the root");
        });
        build_scenario(fixed.steps(), reactor.clone(), &cfg);
        fixed.steps().execute();
    } else {
        let steps = AsyncSteps::new(reactor.clone());
        steps.on_unhandled_error(|code: ErrorCode| {
            tracing::error!(%code, "unhandled step error reached the root");
        });
        build_scenario(&steps, reactor.clone(), &cfg);
        steps.execute();
    }

    reactor.run_until_shutdown();
}
