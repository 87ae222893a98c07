use thiserror::Error;

/// Request problems detected before any command is run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("vm_name parameter required")]
    MissingVmName,

    #[error("Invalid vm_name: {0}")]
    InvalidVmName(String),

    #[error("Invalid action: {0}. Must be start, stop, or restart")]
    InvalidAction(String),

    #[error("No JSON data provided")]
    NoJsonBody,

    #[error("Validation error: {0}")]
    Validation(String),
}
