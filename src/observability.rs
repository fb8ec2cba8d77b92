//! Logging setup.
//!
//! A single `init_tracing()` call installs a compact, non-JSON formatter to
//! stderr (so it never interleaves with the exec'd program's stdout),
//! honoring `MPIPIN_LOG` first and falling back to `RUST_LOG`.

use tracing_subscriber::EnvFilter;

const LOG_ENV_VAR: &str = "MPIPIN_LOG";

/// Installs the global tracing subscriber. Safe to call once at process
/// start, before argument resolution so that argument errors are logged too.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
