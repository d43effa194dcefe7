//! Tracing subscriber setup.
//!
//! Logs go to stderr so that command output on stdout (answers, JSON
//! listings) stays machine-readable.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `RAG_LOG=rag_harness=debug`.
pub const LOG_ENV: &str = "RAG_LOG";

/// Install the global subscriber.
///
/// `verbose` raises the fallback level to `debug` when `RAG_LOG` is unset.
/// Calling this twice is harmless; the second install is ignored.
pub fn init(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
