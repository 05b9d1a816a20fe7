//! Attestation, trust fusion output and the boot result.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::platform::{PlatformClass, PlatformResolution};
use crate::q16::Q16;
use crate::snapshot::HardwareSnapshot;

// ────────────────────────────────────────────────────────────────────────────
// Attestation
// ────────────────────────────────────────────────────────────────────────────

/// Strength of a measured-boot check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationLevel {
    /// Compared against a hardware-held reference.
    Strong,
    /// Software-only hash comparison.
    Weak,
    /// Measurement did not match the sealed reference.
    Invalid,
}

/// Result of one attestation run.  `valid == false` always pairs with
/// [`AttestationLevel::Invalid`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationResult {
    pub valid: bool,
    pub level: AttestationLevel,
    /// Hex SHA-256 of the measured environment.
    pub env_hash: String,
}

impl AttestationResult {
    pub fn strong(env_hash: impl Into<String>) -> Self {
        Self {
            valid: true,
            level: AttestationLevel::Strong,
            env_hash: env_hash.into(),
        }
    }

    pub fn weak(env_hash: impl Into<String>) -> Self {
        Self {
            valid: true,
            level: AttestationLevel::Weak,
            env_hash: env_hash.into(),
        }
    }

    pub fn invalid(env_hash: impl Into<String>) -> Self {
        Self {
            valid: false,
            level: AttestationLevel::Invalid,
            env_hash: env_hash.into(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Trust descriptor
// ────────────────────────────────────────────────────────────────────────────

/// What the kernel lets the AI do.  Ordered from least to most permissive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationMode {
    ManualOnly,
    Assisted,
    Autonomous,
}

impl OperationMode {
    /// The label shown to operators for this mode.
    pub fn label(self) -> TrustLabel {
        match self {
            OperationMode::Autonomous => TrustLabel::Nominal,
            OperationMode::Assisted => TrustLabel::Degraded,
            OperationMode::ManualOnly => TrustLabel::Critical,
        }
    }

    /// What the actuation bridge energises in this mode.
    pub fn power_state(self) -> PowerState {
        match self {
            OperationMode::Autonomous => PowerState::ActuatorsOn,
            OperationMode::Assisted => PowerState::SensorsOnly,
            OperationMode::ManualOnly => PowerState::Isolated,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationMode::Autonomous => "AUTONOMOUS",
            OperationMode::Assisted => "ASSISTED",
            OperationMode::ManualOnly => "MANUAL_ONLY",
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical state of the actuation path.
///
/// Only [`PowerState::ActuatorsOn`] lets drive packets reach the bus; the
/// other two hold every actuator at its safe state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    ActuatorsOn,
    /// Sensing and planning continue, actuators stay neutral.
    SensorsOnly,
    Isolated,
}

impl PowerState {
    pub fn drives_actuators(self) -> bool {
        self == PowerState::ActuatorsOn
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PowerState::ActuatorsOn => "ACTUATORS_ON",
            PowerState::SensorsOnly => "SENSORS_ONLY",
            PowerState::Isolated => "ISOLATED",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-facing mirror of [`OperationMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustLabel {
    Nominal,
    Degraded,
    Critical,
}

impl fmt::Display for TrustLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrustLabel::Nominal => "NOMINAL",
            TrustLabel::Degraded => "DEGRADED",
            TrustLabel::Critical => "CRITICAL",
        })
    }
}

/// One auditable unit of evidence fed into trust fusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustFactor {
    pub component: String,
    /// In `[0, 1]`.
    pub probability: f64,
    /// Strictly positive.
    pub weight: f64,
    pub reason: String,
}

/// Fused trust decision.  Never mutated in place; a new descriptor replaces
/// the old one wholesale on every evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustDescriptor {
    /// In `[0, 1]`.
    pub score: f64,
    pub raw_score_q16: Q16,
    pub label: TrustLabel,
    pub operation_mode: OperationMode,
    pub factors: Vec<TrustFactor>,
    /// Why the mode was lowered below what the score alone would allow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downgraded_by: Option<String>,
}

impl TrustDescriptor {
    /// Zero-trust descriptor used before the first evaluation.
    pub fn untrusted() -> Self {
        Self {
            score: 0.0,
            raw_score_q16: Q16::ZERO,
            label: TrustLabel::Critical,
            operation_mode: OperationMode::ManualOnly,
            factors: Vec::new(),
            downgraded_by: Some("not yet evaluated".to_string()),
        }
    }

    /// `true` when `mode` is permitted under this descriptor.
    pub fn permits(&self, mode: OperationMode) -> bool {
        self.operation_mode >= mode
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Boot result
// ────────────────────────────────────────────────────────────────────────────

/// Which boot path produced a [`BootSequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootPath {
    Cold,
    Fast,
}

/// Immutable result of one successful bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootSequence {
    pub platform_id: PlatformClass,
    pub trust_score: f64,
    pub is_verified: bool,
    pub mode: OperationMode,
    pub env_snapshot: HardwareSnapshot,
    pub platform: PlatformResolution,
    pub trust: TrustDescriptor,
    pub path: BootPath,
    pub attestation: AttestationResult,
}

impl BootSequence {
    /// One-line description for logs and the operator console.
    pub fn summary(&self) -> String {
        format!(
            "platform={} trust={:.2} ({}) mode={} verified={} path={:?}",
            self.platform_id,
            self.trust_score,
            self.trust.label,
            self.mode,
            self.is_verified,
            self.path,
        )
    }

    /// Anything above manual-only accepts routed tasks.
    pub fn can_operate(&self) -> bool {
        self.mode != OperationMode::ManualOnly
    }

    pub fn power_state(&self) -> PowerState {
        self.mode.power_state()
    }

    pub fn is_autonomous(&self) -> bool {
        self.mode == OperationMode::Autonomous
    }
}
