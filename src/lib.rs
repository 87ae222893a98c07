pub mod agent;
pub mod commands;
pub mod comms;
pub mod utils;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name reported by `/health`
pub const SERVICE_NAME: &str = "hyper-v-webhook-service";
