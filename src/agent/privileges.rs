use anyhow::{bail, Result};
use tracing::debug;

pub const PRIVILEGES_REQUIRED: &str = "Administrator privileges required for Hyper-V operations";

/// Whether the current process runs with administrative rights.
#[cfg(windows)]
pub fn is_admin() -> bool {
    use std::process::{Command, Stdio};

    // `net session` only succeeds from an elevated token
    let status = Command::new("net")
        .arg("session")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    debug!(?status, "elevation probe finished");
    status.map(|s| s.success()).unwrap_or(false)
}

#[cfg(unix)]
pub fn is_admin() -> bool {
    let euid = nix::unistd::geteuid();
    debug!(euid = euid.as_raw(), "elevation probe finished");
    euid.is_root()
}

#[cfg(not(any(unix, windows)))]
pub fn is_admin() -> bool {
    false
}

/// Fail fast before any Hyper-V command is attempted without elevation.
pub fn check_privileges() -> Result<()> {
    if !is_admin() {
        bail!(PRIVILEGES_REQUIRED);
    }
    Ok(())
}
