//! Logging setup: `tracing-subscriber` to stderr plus a rolling file sink via
//! `tracing-appender`. These crates were previously wired up through Bevy's
//! `LogPlugin`; with the engine gone, this crate owns the wiring directly.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes global tracing with an env-filter console layer and an
/// optional rolling-file layer.
///
/// Returns a [`WorkerGuard`] that must be kept alive for the lifetime of the
/// process — dropping it flushes and stops the background writer thread.
/// Call this once, near the start of `main`; subsequent calls are no-ops
/// (the underlying `tracing` global subscriber can only be set once).
pub fn init(log_dir: Option<&std::path::Path>) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("skirmish_nav=info,warn"));

    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "skirmish-nav.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = fmt().with_env_filter(env_filter).try_init();
            None
        }
    }
}
