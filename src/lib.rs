//! Kestrel is the process-event correlation daemon of a kernel
//! security-observability stack.
//!
//! Raw execve/exit notifications arrive from independent per-CPU
//! buffers with no order guarantee across CPUs. The
//! [correlation engine](kestrel_core::correlation::CorrelationEngine)
//! rebuilds the logical process tree, enriches each event with parent,
//! container and pod facts from pluggable lookup services, retries
//! what is not yet resolvable on a fixed cadence and hands every event
//! to its listeners exactly once, exec always before the matching
//! exit.
//!
//! The `kestrel-exec` binary wires the engine to:
//! - a procfs scan that seeds the process table with the processes
//!   already running at startup;
//! - a replay source consuming newline-delimited JSON raw messages
//!   from a file or stdin (live ring-buffer acquisition plugs in at
//!   the same interface);
//! - a console listener printing each delivered event.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod output;
pub mod replay;

pub mod metadata {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Init logger. We log from info level and above, hide timestamp
/// and module path.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: log::Level) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        env_logger::builder()
            .filter_level(override_log_level.to_level_filter())
            .init();
    }
}
