use std::fmt;
use std::str::FromStr;

use crate::commands::error::RequestError;
use crate::commands::validator::VmNameValidator;

/// Action requested for a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAction {
    Start,
    Stop,
    Restart,
    Status,
}

impl VmAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmAction::Start => "start",
            VmAction::Stop => "stop",
            VmAction::Restart => "restart",
            VmAction::Status => "status",
        }
    }

    /// Whether the action changes power state
    pub fn is_mutation(&self) -> bool {
        !matches!(self, VmAction::Status)
    }
}

impl fmt::Display for VmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmAction {
    type Err = RequestError;

    /// Case-insensitive: "START", "Start" and "start" are the same action
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            VmAction::Start,
            VmAction::Stop,
            VmAction::Restart,
            VmAction::Status,
        ]
        .into_iter()
        .find(|action| action.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| RequestError::InvalidAction(s.to_string()))
    }
}

/// A Hyper-V cmdlet invocation for one VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmOperation {
    /// Start-VM
    Start(String),
    /// Stop-VM, `-Force` turns off the VM without a guest shutdown
    Stop { name: String, force: bool },
    /// Restart-VM, `-Force` resets the VM immediately
    Restart { name: String, force: bool },
    /// Get-VM rendered as JSON with Name and State
    Status(String),
}

impl VmOperation {
    /// Build an operation after validating the VM name. `force` is ignored
    /// for start and status.
    pub fn new(action: VmAction, name: &str, force: bool) -> Result<Self, RequestError> {
        VmNameValidator::default().validate(name)?;
        let name = name.to_string();

        Ok(match action {
            VmAction::Start => VmOperation::Start(name),
            VmAction::Stop => VmOperation::Stop { name, force },
            VmAction::Restart => VmOperation::Restart { name, force },
            VmAction::Status => VmOperation::Status(name),
        })
    }

    pub fn vm_name(&self) -> &str {
        match self {
            VmOperation::Start(name) => name,
            VmOperation::Stop { name, .. } => name,
            VmOperation::Restart { name, .. } => name,
            VmOperation::Status(name) => name,
        }
    }

    pub fn action(&self) -> VmAction {
        match self {
            VmOperation::Start(_) => VmAction::Start,
            VmOperation::Stop { .. } => VmAction::Stop,
            VmOperation::Restart { .. } => VmAction::Restart,
            VmOperation::Status(_) => VmAction::Status,
        }
    }

    /// Render the PowerShell script for this operation
    pub fn render(&self) -> String {
        let name = quote_vm_name(self.vm_name());
        match self {
            VmOperation::Start(_) => format!("Start-VM -Name {}", name),
            VmOperation::Stop { force, .. } => {
                format!("Stop-VM -Name {}{}", name, confirmation_flag(*force))
            }
            VmOperation::Restart { force, .. } => {
                format!("Restart-VM -Name {}{}", name, confirmation_flag(*force))
            }
            VmOperation::Status(_) => format!(
                "Get-VM -Name {} | Select-Object Name, State | ConvertTo-Json -EnumsAsStrings",
                name
            ),
        }
    }
}

// Without -Force the cmdlets would prompt, and nobody is there to answer
fn confirmation_flag(force: bool) -> &'static str {
    if force {
        " -Force"
    } else {
        " -Confirm:$false"
    }
}

/// Quote a VM name as a PowerShell single-quoted literal that matches exactly
/// one name: wildcard characters are backtick-escaped for `-Name`, and every
/// quote character is doubled so the literal cannot be closed early.
pub fn quote_vm_name(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('\'');
    for c in name.chars() {
        match c {
            '*' | '?' | '[' | ']' | '`' => quoted.push('`'),
            '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => quoted.push(c),
            _ => {}
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}
