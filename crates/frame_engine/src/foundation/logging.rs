//! Logging initialisation
//!
//! The crate logs through the `log` facade; `env_logger` is the backend used by
//! binaries and tests.

pub use log::{debug, error, info, trace, warn};

/// Initialise `env_logger` from `RUST_LOG`, defaulting to `info`
///
/// Safe to call more than once; later calls are ignored.
pub fn init() {
    init_with_filter("info");
}

/// Initialise `env_logger` with `default_filter` when `RUST_LOG` is unset
pub fn init_with_filter(default_filter: &str) {
    let env = env_logger::Env::default().default_filter_or(default_filter);
    if env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init()
        .is_err()
    {
        log::trace!("Logger already initialised");
    }
}
