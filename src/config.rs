//! CLI-constructible runtime configuration (SPEC_FULL.md §A "Configuration"),
//! modeled on the shape of the teacher's `core::env::MayastorCliArgs`: one
//! `clap::Parser` struct the binary parses, converted into a plain runtime
//! struct the rest of the crate actually consumes (the teacher does the same
//! conversion in `MayastorEnvironment::new`/`env.rs`, trimmed here to the
//! handful of knobs this runtime actually exposes).

use std::time::Duration;

use clap::Parser;

use crate::logger::LogFormat;

#[derive(Parser, Debug)]
#[clap(name = "asyncsteps-demo", about = "AsyncTool/AsyncSteps runtime demo")]
pub struct CliArgs {
    /// Fallback `tracing` filter used when `RUST_LOG` is unset.
    #[clap(short = 'l', long = "log-level", default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Log event formatting style.
    #[clap(short = 'f', long = "log-format", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Maximum concurrent holders of the demo's `Mutex` sync primitive.
    #[clap(long = "mutex-max", default_value = "4")]
    pub mutex_max: u32,

    /// Maximum steps that may queue behind a full `Mutex`.
    #[clap(long = "mutex-queue-max", default_value = "64")]
    pub mutex_queue_max: u32,

    /// Tokens released into the demo `Throttle` per refill period.
    #[clap(long = "throttle-rate", default_value = "10")]
    pub throttle_rate: u32,

    /// Unused-token carryover cap for the demo `Throttle`.
    #[clap(long = "throttle-burst", default_value = "10")]
    pub throttle_burst: u32,

    /// Refill period, in milliseconds, for the demo `Throttle`.
    #[clap(long = "throttle-period-ms", default_value = "1000")]
    pub throttle_period_ms: u64,

    /// Run the fixed-storage scenario (`engine::fixed::FixedAsyncSteps`)
    /// instead of the growable one.
    #[clap(long = "fixed-storage")]
    pub fixed_storage: bool,
}

/// The parsed, typed form of [`CliArgs`] the rest of the crate works with.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub mutex_max: u32,
    pub mutex_queue_max: u32,
    pub throttle_rate: u32,
    pub throttle_burst: u32,
    pub throttle_period: Duration,
    pub fixed_storage: bool,
}

impl From<CliArgs> for RuntimeConfig {
    fn from(args: CliArgs) -> Self {
        RuntimeConfig {
            log_level: args.log_level,
            log_format: args.log_format,
            mutex_max: args.mutex_max,
            mutex_queue_max: args.mutex_queue_max,
            throttle_rate: args.throttle_rate,
            throttle_burst: args.throttle_burst,
            throttle_period: Duration::from_millis(args.throttle_period_ms),
            fixed_storage: args.fixed_storage,
        }
    }
}

impl RuntimeConfig {
    /// Parse `std::env::args()` into a [`RuntimeConfig`] (spec.md ambient
    /// config surface).
    pub fn from_env_args() -> Self {
        CliArgs::parse().into()
    }
}
