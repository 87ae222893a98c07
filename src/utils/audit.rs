use tracing::{info, warn};

use crate::commands::dispatcher::OperationOutcome;

/// Structured `audit` events for every VM request the service handles
#[derive(Debug, Clone, Default)]
pub struct OperationAudit;

impl OperationAudit {
    pub fn new() -> Self {
        Self
    }

    pub fn request_received(&self, endpoint: &str, vm_name: Option<&str>, action: &str) {
        info!(target: "audit", event = "request_received", endpoint, vm_name = vm_name.unwrap_or(""), action);
    }

    pub fn request_rejected(&self, endpoint: &str, reason: &str) {
        warn!(target: "audit", event = "request_rejected", endpoint, reason);
    }

    pub fn operation_finished(&self, endpoint: &str, action: &str, outcome: &OperationOutcome) {
        let vm_name = outcome.vm_name.as_deref().unwrap_or("");
        if outcome.success {
            info!(target: "audit", event = "operation_succeeded", endpoint, action, vm_name, status = outcome.status.as_deref().unwrap_or(""));
        } else {
            warn!(target: "audit", event = "operation_failed", endpoint, action, vm_name, error = outcome.error.as_deref().unwrap_or(""));
        }
    }
}
