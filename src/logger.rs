//! Log/trace setup (SPEC_FULL.md §A "Logging"), modeled on the teacher's own
//! `io-engine::logger` but trimmed to the crates already in `Cargo.toml`: no
//! `ansi_term`/`chrono`/`tracing_log`/`spdk_rs` dependency, since this crate
//! has no SPDK log bridge to normalize and `tracing_subscriber::fmt` already
//! ships a perfectly serviceable ANSI/timestamped writer.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

/// Output shape for [`init_ex`]; mirrors the two styles the teacher's own
/// `LogFormat` exposes (`LogStyle::Default`/`LogStyle::Compact`), minus the
/// per-option string grammar the teacher parses (`color`, `nodate`, ...) --
/// this crate has no CLI surface wide enough to need it, see
/// [`crate::config::CliArgs::log_format`].
#[derive(Debug, Default, Copy, Clone, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" | "default" => Ok(LogFormat::Text),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unknown log format {other:?} (want text|compact)")),
        }
    }
}

/// Install the global `tracing` subscriber. `level` is the fallback filter
/// used when `RUST_LOG` is unset (spec.md ambient logging: "`RUST_LOG`
/// controls per-target verbosity the same way the teacher's binaries read
/// it").
pub fn init(level: &str) {
    init_ex(level, LogFormat::default())
}

pub fn init_ex(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };

    // A second call (e.g. from a test harness that already installed one)
    // is a no-op rather than fatal.
    let _ = result;
}
