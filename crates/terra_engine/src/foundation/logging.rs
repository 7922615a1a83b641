//! Logging setup
//!
//! The engine logs through the `log` facade; binaries pick the backend.

pub use log::{debug, error, info, trace, warn};

/// Initialize env_logger, honouring `RUST_LOG` and falling back to `default_filter`
pub fn init_with_default(default_filter: &str) {
    let env = env_logger::Env::default().default_filter_or(default_filter);
    // A second init in the same process (tests, embedding) is not an error worth surfacing
    let _ = env_logger::Builder::from_env(env).format_timestamp_millis().try_init();
}

/// Initialize env_logger from `RUST_LOG`, defaulting to `info`
pub fn init() {
    init_with_default("info");
}
