//! Error types for the KVM automation layer.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while driving a KVM host.
#[derive(Error, Debug)]
pub enum HypervisorError {
    // =========================================================================
    // Execution
    // =========================================================================
    /// A command exited with a return code outside the expected set.
    #[error("Command `{command}` ended with code {code}: stdout: {stdout}, stderr: {stderr}")]
    Execution {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    /// A command did not finish within its timeout.
    #[error("Command `{command}` did not finish in {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// Local I/O failure (spawning processes, reading templates).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Not found
    // =========================================================================
    /// Network interface missing on the host.
    #[error("Interface {0} not found")]
    InterfaceNotFound(String),

    /// File missing on the host.
    #[error("Not found {0} in system.")]
    FileNotFound(String),

    /// Expected element, attribute or record missing in command output.
    #[error("{0}")]
    NotFound(String),

    /// Malformed XML document.
    #[error("XML error: {0}")]
    Xml(String),

    /// Output could not be interpreted.
    #[error("Parse error: {0}")]
    Parse(String),

    // =========================================================================
    // Count mismatch
    // =========================================================================
    #[error("Mismatched count of expected and created VFs {actual} != {expected}")]
    VfCountMismatch { expected: usize, actual: usize },

    #[error(
        "Not enough free PCI devices. Cannot create expected number of PCI Controllers: \
         expected: {expected}, created: {created}"
    )]
    NotEnoughPciAddresses { expected: usize, created: usize },

    /// VF lookup or listing failure.
    #[error("{0}")]
    Vf(String),

    // =========================================================================
    // State
    // =========================================================================
    #[error("VM was unable to boot after: {tries} retries!")]
    VmNotBooted { tries: u32 },

    #[error("VM is up but management IP is unavailable for MAC: {mac}!")]
    MngIpUnavailable { mac: String },

    #[error("Not enough free RAM on SUT for VM.")]
    NotEnoughRam,

    #[error("Cloning image {image} not finished in given timeout: {timeout}")]
    CloneTimeout { image: String, timeout: u64 },

    #[error("Not enough free network data: expected {expected}, found {found}")]
    NetworkDataExhausted { expected: usize, found: usize },

    // =========================================================================
    // Usage
    // =========================================================================
    #[error("Unsupported action: {0}, please use 'add' or 'rem'.")]
    UnsupportedAction(String),

    #[error("Invalid PCI address: {0}")]
    InvalidPciAddress(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HypervisorError {
    /// True when this is an execution error whose stderr contains `needle`.
    pub fn stderr_contains(&self, needle: &str) -> bool {
        matches!(self, Self::Execution { stderr, .. } if stderr.contains(needle))
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_contains() {
        let err = HypervisorError::Execution {
            command: "echo 4 > sriov_numvfs".to_string(),
            code: 1,
            stdout: String::new(),
            stderr: "write error: Device or resource busy".to_string(),
        };
        assert!(err.stderr_contains("Device or resource busy"));
        assert!(!err.stderr_contains("No such file"));
        assert!(!HypervisorError::NotEnoughRam.stderr_contains("busy"));
    }

    #[test]
    fn test_messages() {
        let err = HypervisorError::VfCountMismatch { expected: 4, actual: 2 };
        assert_eq!(
            err.to_string(),
            "Mismatched count of expected and created VFs 2 != 4"
        );

        let err = HypervisorError::NotEnoughPciAddresses { expected: 5, created: 1 };
        assert_eq!(
            err.to_string(),
            "Not enough free PCI devices. Cannot create expected number of PCI Controllers: \
             expected: 5, created: 1"
        );
    }
}
