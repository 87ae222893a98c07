use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::commands::error::RequestError;
use crate::commands::executor::CommandRunner;
use crate::commands::hyperv::{VmAction, VmOperation};

const VM_NOT_FOUND: &str = "VM not found";

/// Wording Hyper-V uses when `-Name` matches nothing
const HYPERV_NOT_FOUND_MARKER: &str = "unable to find a virtual machine";

/// Webhook payload: `{vm_name, action, force}`
#[derive(Debug, Clone, Deserialize)]
pub struct OperationRequest {
    pub vm_name: String,
    pub action: String,
    #[serde(default)]
    pub force: bool,
}

/// Payload for single-action endpoints: `{vm_name, force}`
#[derive(Debug, Clone, Deserialize)]
pub struct PowerRequest {
    pub vm_name: String,
    #[serde(default)]
    pub force: bool,
}

/// Why an operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    InvalidAction,
    Execution,
    Parse,
    NotFound,
}

/// Result of one VM operation, serialized as the response body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub failure: Option<FailureKind>,
}

impl OperationOutcome {
    pub fn succeeded(vm_name: &str, message: String) -> Self {
        Self {
            success: true,
            message: Some(message),
            vm_name: Some(vm_name.to_string()),
            ..Self::default()
        }
    }

    pub fn failed(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            failure: Some(kind),
            ..Self::default()
        }
    }

    pub fn rejected(err: RequestError) -> Self {
        let kind = match err {
            RequestError::InvalidAction(_) => FailureKind::InvalidAction,
            _ => FailureKind::Validation,
        };
        Self::failed(kind, err.to_string())
    }

    pub fn with_vm_name(mut self, vm_name: &str) -> Self {
        self.vm_name = Some(vm_name.to_string());
        self
    }
}

/// Turns VM requests into Hyper-V invocations and their output into outcomes.
///
/// Holds no per-request state; clones share the runner.
#[derive(Clone)]
pub struct VmDispatcher {
    runner: Arc<dyn CommandRunner>,
}

impl VmDispatcher {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub async fn start(&self, vm_name: &str) -> OperationOutcome {
        self.mutate(VmAction::Start, vm_name, false).await
    }

    pub async fn stop(&self, vm_name: &str, force: bool) -> OperationOutcome {
        self.mutate(VmAction::Stop, vm_name, force).await
    }

    pub async fn restart(&self, vm_name: &str, force: bool) -> OperationOutcome {
        self.mutate(VmAction::Restart, vm_name, force).await
    }

    /// Route a webhook action. Only start, stop and restart are accepted;
    /// anything else is rejected without running a command.
    pub async fn dispatch(&self, action: &str, vm_name: &str, force: bool) -> OperationOutcome {
        match action.parse::<VmAction>() {
            Ok(parsed) if parsed.is_mutation() => self.mutate(parsed, vm_name, force).await,
            _ => OperationOutcome::rejected(RequestError::InvalidAction(action.to_string())),
        }
    }

    pub async fn handle(&self, request: &OperationRequest) -> OperationOutcome {
        self.dispatch(&request.action, &request.vm_name, request.force)
            .await
    }

    /// Query the current power state of a VM
    pub async fn status(&self, vm_name: &str) -> OperationOutcome {
        let operation = match VmOperation::new(VmAction::Status, vm_name, false) {
            Ok(operation) => operation,
            Err(e) => return OperationOutcome::rejected(e),
        };

        let result = self.runner.execute(&operation.render()).await;
        debug!(?result, "VM status result");

        if result.succeeded && !result.stdout.is_empty() {
            return match parse_status(&result.stdout) {
                Ok((name, state)) => OperationOutcome {
                    success: true,
                    vm_name: Some(name),
                    status: Some(state),
                    ..OperationOutcome::default()
                },
                Err(detail) => {
                    warn!("Error parsing VM status: {}", detail);
                    OperationOutcome::failed(
                        FailureKind::Parse,
                        format!("Error parsing VM status: {}", detail),
                    )
                }
            };
        }

        // A failed query reports stderr, or stdout when stderr is empty
        let succeeded = result.succeeded;
        let stdout = Some(result.stdout).filter(|s| !succeeded && !s.is_empty());
        let diagnostic = result.stderr.filter(|s| !s.is_empty()).or(stdout);
        match diagnostic {
            Some(error) if !is_not_found(&error) => {
                OperationOutcome::failed(FailureKind::Execution, error)
            }
            Some(error) => OperationOutcome::failed(FailureKind::NotFound, error),
            None => OperationOutcome::failed(FailureKind::NotFound, VM_NOT_FOUND),
        }
    }

    async fn mutate(&self, action: VmAction, vm_name: &str, force: bool) -> OperationOutcome {
        let operation = match VmOperation::new(action, vm_name, force) {
            Ok(operation) => operation,
            Err(e) => return OperationOutcome::rejected(e).with_vm_name(vm_name),
        };

        info!(
            action = %operation.action(),
            vm_name = operation.vm_name(),
            force,
            "Running VM power operation"
        );
        let result = self.runner.execute(&operation.render()).await;
        if !result.succeeded {
            return OperationOutcome::failed(FailureKind::Execution, result.error_text())
                .with_vm_name(vm_name);
        }

        let message = format!("VM '{}' {} successfully", vm_name, past_tense(action));
        info!("{}", message);
        let mut outcome = OperationOutcome::succeeded(vm_name, message);

        // A failed follow-up query leaves the mutation outcome as it is
        let current = self.status(vm_name).await;
        match current.status {
            Some(state) if current.success => outcome.status = Some(state),
            _ => debug!(vm_name, error = ?current.error, "status enrichment skipped"),
        }

        outcome
    }
}

fn past_tense(action: VmAction) -> &'static str {
    match action {
        VmAction::Start => "started",
        VmAction::Stop => "stopped",
        VmAction::Restart => "restarted",
        VmAction::Status => "queried",
    }
}

fn is_not_found(error: &str) -> bool {
    let lowered = error.to_lowercase();
    lowered == VM_NOT_FOUND.to_lowercase() || lowered.contains(HYPERV_NOT_FOUND_MARKER)
}

/// Extract `(Name, normalized state)` from `Get-VM | ConvertTo-Json` output.
///
/// Accepts a single object or an array (duplicate VM names), in which case
/// the first entry wins.
fn parse_status(output: &str) -> Result<(String, String), String> {
    let parsed: Value = serde_json::from_str(output).map_err(|e| e.to_string())?;
    let vm = match parsed {
        Value::Array(items) => items
            .into_iter()
            .next()
            .ok_or_else(|| "empty VM list".to_string())?,
        other => other,
    };

    let name = match vm.get("Name") {
        Some(Value::String(name)) => name.clone(),
        Some(other) => return Err(format!("unexpected Name value: {}", other)),
        None => return Err("missing field `Name`".to_string()),
    };

    let state = match vm.get("State") {
        Some(Value::String(state)) => normalize_state(state),
        Some(Value::Number(code)) => code
            .as_u64()
            .map(state_from_code)
            .unwrap_or("unknown")
            .to_string(),
        _ => "unknown".to_string(),
    };

    Ok((name, state))
}

/// Lowercase a reported state, mapping Hyper-V's "Off" to "stopped"
pub fn normalize_state(raw: &str) -> String {
    let state = raw.to_lowercase();
    if state == "off" {
        "stopped".to_string()
    } else {
        state
    }
}

// Numeric VMState values, seen when -EnumsAsStrings is unsupported
fn state_from_code(code: u64) -> &'static str {
    match code {
        2 => "running",
        3 => "stopped",
        4 => "stopping",
        6 => "saved",
        9 => "paused",
        10 => "starting",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::executor::CommandResult;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers by cmdlet prefix and records every script it is given
    struct FakeRunner {
        calls: Mutex<Vec<String>>,
        mutation: CommandResult,
        status: CommandResult,
    }

    impl FakeRunner {
        fn new(mutation: CommandResult, status: CommandResult) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                mutation,
                status,
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn execute(&self, script: &str) -> CommandResult {
            self.calls.lock().unwrap().push(script.to_string());
            if script.starts_with("Get-VM") {
                self.status.clone()
            } else {
                self.mutation.clone()
            }
        }
    }

    fn state_json(name: &str, state: &str) -> CommandResult {
        CommandResult::success(format!(r#"{{"Name": "{}", "State": "{}"}}"#, name, state))
    }

    fn failed(stderr: &str) -> CommandResult {
        CommandResult {
            succeeded: false,
            stderr: Some(stderr.to_string()),
            exit_code: Some(1),
            ..CommandResult::default()
        }
    }

    #[tokio::test]
    async fn test_start_enriches_with_queried_status() {
        let runner = FakeRunner::new(CommandResult::success(""), state_json("TestVM", "Saved"));
        let dispatcher = VmDispatcher::new(runner.clone());

        let outcome = dispatcher.start("TestVM").await;

        assert!(outcome.success);
        assert_eq!(outcome.message.as_deref(), Some("VM 'TestVM' started successfully"));
        assert_eq!(outcome.vm_name.as_deref(), Some("TestVM"));
        // Whatever the query reports, not an assumed "running"
        assert_eq!(outcome.status.as_deref(), Some("saved"));
        assert_eq!(
            runner.calls(),
            vec![
                "Start-VM -Name 'TestVM'".to_string(),
                "Get-VM -Name 'TestVM' | Select-Object Name, State | ConvertTo-Json -EnumsAsStrings"
                    .to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_force_uses_force_flag() {
        let runner = FakeRunner::new(CommandResult::success(""), state_json("TestVM", "Off"));
        let dispatcher = VmDispatcher::new(runner.clone());

        let outcome = dispatcher.stop("TestVM", true).await;

        assert!(outcome.success);
        assert_eq!(outcome.message.as_deref(), Some("VM 'TestVM' stopped successfully"));
        assert_eq!(outcome.status.as_deref(), Some("stopped"));
        assert_eq!(runner.calls()[0], "Stop-VM -Name 'TestVM' -Force");
    }

    #[tokio::test]
    async fn test_restart_message() {
        let runner = FakeRunner::new(CommandResult::success(""), state_json("db", "Running"));
        let outcome = VmDispatcher::new(runner.clone()).restart("db", false).await;

        assert_eq!(outcome.message.as_deref(), Some("VM 'db' restarted successfully"));
        assert_eq!(outcome.status.as_deref(), Some("running"));
        assert_eq!(runner.calls()[0], "Restart-VM -Name 'db' -Confirm:$false");
    }

    #[tokio::test]
    async fn test_mutation_failure_carries_error_and_skips_status() {
        let runner = FakeRunner::new(
            failed("Start-VM : The operation cannot be performed"),
            state_json("TestVM", "Off"),
        );
        let dispatcher = VmDispatcher::new(runner.clone());

        let outcome = dispatcher.start("TestVM").await;

        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureKind::Execution));
        assert_eq!(
            outcome.error.as_deref(),
            Some("Start-VM : The operation cannot be performed")
        );
        assert_eq!(outcome.vm_name.as_deref(), Some("TestVM"));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_silent_mutation_failure_is_not_empty() {
        let silent = CommandResult {
            succeeded: false,
            exit_code: Some(1),
            ..CommandResult::default()
        };
        let runner = FakeRunner::new(silent, state_json("vm", "Off"));
        let outcome = VmDispatcher::new(runner).stop("vm", false).await;

        assert_eq!(outcome.error.as_deref(), Some("Command failed with exit code 1"));
    }

    #[tokio::test]
    async fn test_enrichment_failure_is_silent() {
        let runner = FakeRunner::new(CommandResult::success(""), failed("boom"));
        let outcome = VmDispatcher::new(runner).start("TestVM").await;

        assert!(outcome.success);
        assert_eq!(outcome.status, None);
        assert_eq!(outcome.error, None);
    }

    #[tokio::test]
    async fn test_timeout_surfaces_marker() {
        let runner = FakeRunner::new(CommandResult::timeout(), state_json("vm", "Off"));
        let outcome = VmDispatcher::new(runner).restart("vm", true).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Command timed out"));
    }

    #[tokio::test]
    async fn test_status_normalizes_states() {
        for (reported, expected) in [
            ("Off", "stopped"),
            ("Running", "running"),
            ("Paused", "paused"),
            ("Saved", "saved"),
            ("FastSaved", "fastsaved"),
        ] {
            let runner = FakeRunner::new(CommandResult::success(""), state_json("vm", reported));
            let outcome = VmDispatcher::new(runner).status("vm").await;

            assert!(outcome.success);
            assert_eq!(outcome.status.as_deref(), Some(expected));
            assert_eq!(outcome.vm_name.as_deref(), Some("vm"));
            assert_eq!(outcome.message, None);
        }
    }

    #[tokio::test]
    async fn test_status_missing_state_is_unknown() {
        let runner = FakeRunner::new(
            CommandResult::success(""),
            CommandResult::success(r#"{"Name": "vm"}"#),
        );
        let outcome = VmDispatcher::new(runner).status("vm").await;

        assert_eq!(outcome.status.as_deref(), Some("unknown"));
    }

    #[tokio::test]
    async fn test_status_accepts_array_and_numeric_state() {
        let runner = FakeRunner::new(
            CommandResult::success(""),
            CommandResult::success(r#"[{"Name": "dup", "State": 3}, {"Name": "dup", "State": 2}]"#),
        );
        let outcome = VmDispatcher::new(runner).status("dup").await;

        assert_eq!(outcome.status.as_deref(), Some("stopped"));
    }

    #[tokio::test]
    async fn test_status_parse_errors() {
        for output in ["not json", r#"{"State": "Running"}"#, "[]"] {
            let runner =
                FakeRunner::new(CommandResult::success(""), CommandResult::success(output));
            let outcome = VmDispatcher::new(runner).status("vm").await;

            assert!(!outcome.success);
            assert_eq!(outcome.failure, Some(FailureKind::Parse));
            assert!(outcome
                .error
                .as_deref()
                .unwrap()
                .starts_with("Error parsing VM status: "));
        }
    }

    #[tokio::test]
    async fn test_status_failures() {
        let cases = [
            (failed("VM not found"), "VM not found", FailureKind::NotFound),
            (CommandResult::success(""), "VM not found", FailureKind::NotFound),
            (
                failed("Get-VM : Hyper-V was unable to find a virtual machine with name \"Ghost\"."),
                "Get-VM : Hyper-V was unable to find a virtual machine with name \"Ghost\".",
                FailureKind::NotFound,
            ),
            (failed("Access is denied"), "Access is denied", FailureKind::Execution),
            (
                CommandResult {
                    succeeded: false,
                    stdout: "Get-VM : access denied".to_string(),
                    exit_code: Some(1),
                    ..CommandResult::default()
                },
                "Get-VM : access denied",
                FailureKind::Execution,
            ),
            (
                CommandResult {
                    succeeded: false,
                    stderr: Some(String::new()),
                    exit_code: Some(1),
                    ..CommandResult::default()
                },
                "VM not found",
                FailureKind::NotFound,
            ),
        ];

        for (status, error, kind) in cases {
            let runner = FakeRunner::new(CommandResult::success(""), status);
            let outcome = VmDispatcher::new(runner).status("Ghost").await;

            assert!(!outcome.success);
            assert_eq!(outcome.error.as_deref(), Some(error));
            assert_eq!(outcome.failure, Some(kind));
            assert_eq!(outcome.vm_name, None);
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_case_insensitively() {
        let runner = FakeRunner::new(CommandResult::success(""), state_json("vm", "Running"));
        let dispatcher = VmDispatcher::new(runner.clone());

        let outcome = dispatcher.dispatch("START", "vm", false).await;
        assert!(outcome.success);
        assert_eq!(runner.calls()[0], "Start-VM -Name 'vm'");

        let request = OperationRequest {
            vm_name: "vm".to_string(),
            action: "Stop".to_string(),
            force: true,
        };
        dispatcher.handle(&request).await;
        assert_eq!(runner.calls()[2], "Stop-VM -Name 'vm' -Force");
    }

    #[tokio::test]
    async fn test_dispatch_rejects_other_actions_without_running() {
        let runner = FakeRunner::new(CommandResult::success(""), state_json("vm", "Running"));
        let dispatcher = VmDispatcher::new(runner.clone());

        for action in ["reboot", "status", ""] {
            let outcome = dispatcher.dispatch(action, "vm", false).await;
            assert!(!outcome.success);
            assert_eq!(outcome.failure, Some(FailureKind::InvalidAction));
            assert_eq!(
                outcome.error,
                Some(format!("Invalid action: {}. Must be start, stop, or restart", action))
            );
        }
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_names_never_reach_runner() {
        let runner = FakeRunner::new(CommandResult::success(""), state_json("vm", "Running"));
        let dispatcher = VmDispatcher::new(runner.clone());

        let outcome = dispatcher.start("").await;
        assert_eq!(outcome.failure, Some(FailureKind::Validation));
        assert_eq!(outcome.error.as_deref(), Some("vm_name parameter required"));

        let outcome = dispatcher.status("bad\nname").await;
        assert_eq!(outcome.failure, Some(FailureKind::Validation));

        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_outcome_serialization_omits_absent_fields() {
        let mut outcome = OperationOutcome::succeeded("TestVM", "done".to_string());
        outcome.status = Some("running".to_string());
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "success": true,
                "message": "done",
                "vm_name": "TestVM",
                "status": "running"
            })
        );

        let json = serde_json::to_value(OperationOutcome::failed(FailureKind::NotFound, "VM not found"))
            .unwrap();
        assert_eq!(json, serde_json::json!({"success": false, "error": "VM not found"}));
    }
}
