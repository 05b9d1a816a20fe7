//! [`Attestor`] – measured-boot check.
//!
//! The measurement is `SHA-256(binary ‖ machine_name ‖ os ‖ arch)`.  It is
//! compared in constant time against a [`SealedReference`] kept in the
//! vault, and against a hardware-held reference when a [`SecureElement`] is
//! available.
//!
//! | Situation | Level |
//! |---|---|
//! | Matches, secure element agrees | `Strong` |
//! | Matches, software reference only | `Weak` |
//! | No reference, provisioning allowed (cold boot) | `Weak`, reference sealed |
//! | No reference, provisioning not allowed (fast boot) | `Invalid` |
//! | Mismatch, other machine, unreadable binary or reference | `Invalid` |

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};
use trustgate_types::{AttestationResult, KernelError, MachineIdentity, PlatformClass};

use crate::vault::Vault;

pub const SEALED_REFERENCE: &str = "SealedReference";

/// A hardware-held measurement reference (TPM, secure enclave, HSM).
pub trait SecureElement: Send + Sync {
    /// The measurement sealed into hardware, if one has been provisioned.
    fn sealed_measurement(&self) -> Option<[u8; 32]>;
}

/// Software reference persisted in the vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedReference {
    pub machine_name: String,
    /// Hex-encoded SHA-256.
    pub measurement: String,
    /// Platform class locked at provisioning time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformClass>,
    pub sealed_at: DateTime<Utc>,
}

/// Whether a missing reference may be created on this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealPolicy {
    /// Trust on first use: seal a reference if none exists.
    ProvisionIfMissing,
    /// Seal a fresh reference even if one exists.  Explicit maintenance only.
    Reseal,
    /// A reference must already exist.
    RequireExisting,
}

pub struct Attestor {
    binary_path: PathBuf,
    secure_element: Option<Arc<dyn SecureElement>>,
}

impl Attestor {
    /// Measure the binary at `binary_path` (normally `current_exe()`).
    pub fn new(binary_path: impl AsRef<Path>) -> Self {
        Self {
            binary_path: binary_path.as_ref().to_path_buf(),
            secure_element: None,
        }
    }

    pub fn with_secure_element(mut self, se: Arc<dyn SecureElement>) -> Self {
        self.secure_element = Some(se);
        self
    }

    /// Compute the measurement for `identity`.
    pub fn measure(&self, identity: &MachineIdentity) -> Result<[u8; 32], KernelError> {
        let binary = fs::read(&self.binary_path).map_err(|e| {
            KernelError::ProbeFailure(format!(
                "cannot read {} for measurement: {e}",
                self.binary_path.display()
            ))
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&binary);
        hasher.update(identity.machine_name.as_bytes());
        hasher.update(identity.os.as_bytes());
        hasher.update(identity.arch.as_bytes());
        Ok(hasher.finalize().into())
    }

    /// The platform class sealed with the reference, if any.
    pub fn sealed_platform(&self, vault: &Vault) -> Option<PlatformClass> {
        vault
            .load::<SealedReference>(SEALED_REFERENCE)
            .ok()
            .flatten()
            .and_then(|r| r.platform)
    }

    /// Run the measured-boot check.
    ///
    /// Integrity failures are reported as an [`AttestationResult`] with
    /// `valid == false`, never as `Err`.  `Err` is reserved for vault write
    /// failures while provisioning.
    #[instrument(skip(self, vault, identity), fields(machine = %identity.machine_name))]
    pub fn attest(
        &self,
        vault: &Vault,
        identity: &MachineIdentity,
        policy: SealPolicy,
        platform: Option<PlatformClass>,
    ) -> Result<AttestationResult, KernelError> {
        let measurement = match self.measure(identity) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Measurement failed");
                return Ok(AttestationResult::invalid(String::new()));
            }
        };
        let env_hash = hex::encode(measurement);

        if policy == SealPolicy::Reseal {
            return self.provision(vault, identity, measurement, &env_hash, platform);
        }

        let reference = match vault.load::<SealedReference>(SEALED_REFERENCE) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Sealed reference unreadable");
                return Ok(AttestationResult::invalid(env_hash));
            }
        };

        let Some(reference) = reference else {
            return match policy {
                SealPolicy::RequireExisting => {
                    warn!("No sealed reference on a fast boot");
                    Ok(AttestationResult::invalid(env_hash))
                }
                _ => self.provision(vault, identity, measurement, &env_hash, platform),
            };
        };

        if reference.machine_name != identity.machine_name {
            warn!(sealed_for = %reference.machine_name, "Reference sealed for another machine");
            return Ok(AttestationResult::invalid(env_hash));
        }
        let Ok(sealed) = hex::decode(&reference.measurement) else {
            warn!("Sealed measurement is not valid hex");
            return Ok(AttestationResult::invalid(env_hash));
        };
        if !bool::from(sealed.as_slice().ct_eq(measurement.as_slice())) {
            warn!("Measurement does not match sealed reference");
            return Ok(AttestationResult::invalid(env_hash));
        }

        Ok(self.hardware_level(measurement, env_hash))
    }

    fn provision(
        &self,
        vault: &Vault,
        identity: &MachineIdentity,
        measurement: [u8; 32],
        env_hash: &str,
        platform: Option<PlatformClass>,
    ) -> Result<AttestationResult, KernelError> {
        vault.store(
            SEALED_REFERENCE,
            &SealedReference {
                machine_name: identity.machine_name.clone(),
                measurement: env_hash.to_string(),
                platform,
                sealed_at: Utc::now(),
            },
        )?;
        info!(hash = %&env_hash[..16], "Sealed new measurement reference");
        Ok(self.hardware_level(measurement, env_hash.to_string()))
    }

    /// Upgrade to `Strong` when the secure element agrees; a disagreeing
    /// secure element is a mismatch.
    fn hardware_level(&self, measurement: [u8; 32], env_hash: String) -> AttestationResult {
        match self.secure_element.as_ref().map(|se| se.sealed_measurement()) {
            Some(Some(hw)) if bool::from(hw.as_slice().ct_eq(measurement.as_slice())) => {
                AttestationResult::strong(env_hash)
            }
            Some(Some(_)) => {
                warn!("Secure element disagrees with measurement");
                AttestationResult::invalid(env_hash)
            }
            _ => AttestationResult::weak(env_hash),
        }
    }
}
