use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Layout of each line written by the fmt layer
pub const LOG_FORMAT: &str = "{timestamp} {level} {message} {fields}";

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(default_level: &str) {
    let fmt_layer = fmt::layer().with_target(false);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
