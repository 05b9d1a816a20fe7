use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::InterlockState;
use crate::trust::OperationMode;

/// Kernel-wide error type spanning discovery, integrity, persistence and
/// actuation gating.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KernelError {
    /// Hardware discovery I/O failed.  Recoverable by falling back to the
    /// sensor-only default.
    #[error("Probe Failure: {0}")]
    ProbeFailure(String),

    /// The measured environment does not match the sealed reference.
    #[error("Attestation Invalid: {0}")]
    AttestationInvalid(String),

    /// A cached vault document could not be read or parsed.
    #[error("Config Corrupt: {0}")]
    ConfigCorrupt(String),

    #[error("Schema Mismatch: cached v{cached}, current v{current}")]
    SchemaMismatch { cached: u32, current: u32 },

    #[error("Command Forbidden: {command} requires {required}, current mode is {mode}")]
    CommandForbidden {
        command: String,
        required: OperationMode,
        mode: OperationMode,
    },

    #[error("Actuation Blocked: interlock is {state}")]
    ActuationBlocked { state: InterlockState },

    #[error("Unknown Command: {0}")]
    UnknownCommand(String),

    #[error("Invalid Command: {0}")]
    InvalidCommand(String),

    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Vault Error: {0}")]
    Vault(String),

    #[error("Invalid Config: {0}")]
    InvalidConfig(String),
}

impl KernelError {
    /// Integrity and interlock failures must reach the actuation gate and are
    /// never absorbed locally.
    pub fn is_fatal_to_boot(&self) -> bool {
        matches!(self, KernelError::AttestationInvalid(_))
    }

    /// Errors that a cold reprobe resolves.
    pub fn triggers_cold_boot(&self) -> bool {
        matches!(
            self,
            KernelError::ConfigCorrupt(_) | KernelError::SchemaMismatch { .. }
        )
    }
}
