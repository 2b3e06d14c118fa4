//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level so a single module can be
//! turned up without editing the config file, e.g. `RUST_LOG=rf_daq::hardware=trace`.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. Calling this more than once is harmless.
pub fn init(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let result = if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(false)
            .try_init()
    } else {
        fmt().with_env_filter(filter).with_target(true).try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
