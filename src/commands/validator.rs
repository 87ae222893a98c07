use crate::commands::error::RequestError;

/// Hyper-V rejects VM names longer than this
pub const MAX_VM_NAME_LEN: usize = 100;

/// Validates VM names before they are rendered into a script
#[derive(Debug, Clone)]
pub struct VmNameValidator {
    max_len: usize,
}

impl VmNameValidator {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    /// Validate a VM name; returns Ok if usable else Err explaining the issue
    pub fn validate(&self, name: &str) -> Result<(), RequestError> {
        if name.trim().is_empty() {
            return Err(RequestError::MissingVmName);
        }

        let len = name.chars().count();
        if len > self.max_len {
            return Err(RequestError::InvalidVmName(format!(
                "name too long: {} > {} characters",
                len, self.max_len
            )));
        }

        // Newlines would end the statement inside the script
        if name.chars().any(char::is_control) {
            return Err(RequestError::InvalidVmName(
                "name contains control characters".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for VmNameValidator {
    fn default() -> Self {
        Self::new(MAX_VM_NAME_LEN)
    }
}
