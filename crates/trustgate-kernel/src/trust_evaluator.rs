//! [`TrustEvaluator`] – weighted evidence fusion into an operational mode.
//!
//! Three evidence sources each contribute a `(probability, weight)` pair:
//!
//! | Component | Probability | Default weight |
//! |---|---|---|
//! | `attestation` | strong 0.99, weak 0.75, invalid 0.10 | 0.4 |
//! | `platform_identity` | final class confidence (0 if unlocked) | 0.3 |
//! | `hardware_io` | mean bus confidence (0.5 with no buses) × bus pulse health | 0.3 |
//!
//! `score = Σ(p·w) / Σ(w)`.  Invalid attestation additionally caps the score
//! at [`INVALID_ATTESTATION_CAP`], so a tampered environment can never reach
//! an actuating mode no matter how good the rest of the evidence looks.
//!
//! Mode thresholds: `score < 0.5` is always `MANUAL_ONLY`; below
//! `min_threshold` is `ASSISTED`; otherwise `AUTONOMOUS`.  Capability facts
//! can only lower the mode afterwards.
//!
//! [`TrustCell`] publishes descriptors to concurrent readers by swapping a
//! whole `Arc`, so nobody ever observes a half-updated descriptor.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use trustgate_types::{
    AttestationLevel, AttestationResult, HardwareSnapshot, KernelError, OperationMode,
    PlatformResolution, Q16, TrustDescriptor, TrustFactor,
};

/// Below this score the mode is `MANUAL_ONLY` regardless of configuration.
pub const MANUAL_ONLY_BELOW: f64 = 0.5;
pub const DEFAULT_MIN_THRESHOLD: f64 = 0.9;
/// Score ceiling when attestation is invalid.
pub const INVALID_ATTESTATION_CAP: f64 = 0.30;

const P_STRONG: f64 = 0.99;
const P_WEAK: f64 = 0.75;
const P_INVALID: f64 = 0.10;
const P_NO_BUSES: f64 = 0.5;

/// Per-source weights.  Need not sum to one; fusion normalises.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustWeights {
    pub attestation: f64,
    pub platform: f64,
    pub hardware: f64,
}

impl Default for TrustWeights {
    fn default() -> Self {
        Self {
            attestation: 0.4,
            platform: 0.3,
            hardware: 0.3,
        }
    }
}

impl TrustWeights {
    /// # Errors
    ///
    /// [`KernelError::InvalidConfig`] unless every weight is finite and > 0.
    pub fn validate(&self) -> Result<(), KernelError> {
        for (name, w) in [
            ("attestation", self.attestation),
            ("platform", self.platform),
            ("hardware", self.hardware),
        ] {
            if !w.is_finite() || w <= 0.0 {
                return Err(KernelError::InvalidConfig(format!(
                    "trust weight '{name}' must be positive, got {w}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TrustEvaluator {
    weights: TrustWeights,
    min_threshold: f64,
}

impl Default for TrustEvaluator {
    fn default() -> Self {
        Self {
            weights: TrustWeights::default(),
            min_threshold: DEFAULT_MIN_THRESHOLD,
        }
    }
}

impl TrustEvaluator {
    /// # Errors
    ///
    /// [`KernelError::InvalidConfig`] for non-positive weights or a threshold
    /// outside `(0, 1]`.
    pub fn new(weights: TrustWeights, min_threshold: f64) -> Result<Self, KernelError> {
        weights.validate()?;
        if !(min_threshold > 0.0 && min_threshold <= 1.0) {
            return Err(KernelError::InvalidConfig(format!(
                "min_threshold must be in (0, 1], got {min_threshold}"
            )));
        }
        Ok(Self {
            weights,
            min_threshold,
        })
    }

    pub fn min_threshold(&self) -> f64 {
        self.min_threshold
    }

    /// Build the three evidence factors.  `bus_health` in `[0, 1]` scales
    /// the hardware factor (see [`PulseCheck`](crate::bus_pulse::PulseCheck)).
    pub fn factors(
        &self,
        attestation: &AttestationResult,
        platform: &PlatformResolution,
        snap: &HardwareSnapshot,
        bus_health: f64,
    ) -> Vec<TrustFactor> {
        let (p_att, att_reason) = match (attestation.valid, attestation.level) {
            (true, AttestationLevel::Strong) => (P_STRONG, "hardware-backed measurement match"),
            (true, AttestationLevel::Weak) => (P_WEAK, "software measurement match"),
            _ => (P_INVALID, "measurement mismatch"),
        };
        let p_platform = platform.final_confidence().to_float();
        let (p_hw, mut hw_reason) = match snap.mean_bus_confidence() {
            Some(mean) => (mean, format!("mean confidence of {} buses", snap.buses.len())),
            None => (P_NO_BUSES, "no buses discovered".to_string()),
        };
        let bus_health = if bus_health.is_nan() {
            0.0
        } else {
            bus_health.clamp(0.0, 1.0)
        };
        if bus_health < 1.0 {
            hw_reason.push_str(&format!(", bus pulse health {bus_health:.2}"));
        }
        let p_hw = p_hw * bus_health;

        vec![
            TrustFactor {
                component: "attestation".to_string(),
                probability: p_att,
                weight: self.weights.attestation,
                reason: att_reason.to_string(),
            },
            TrustFactor {
                component: "platform_identity".to_string(),
                probability: p_platform,
                weight: self.weights.platform,
                reason: if platform.locked {
                    format!("{} via {:?}", platform.final_class, platform.source)
                } else {
                    "platform not locked".to_string()
                },
            },
            TrustFactor {
                component: "hardware_io".to_string(),
                probability: p_hw,
                weight: self.weights.hardware,
                reason: hw_reason,
            },
        ]
    }

    /// `Σ(p·w) / Σ(w)` over factors with positive finite weight, clamped to
    /// `[0, 1]`.  Empty evidence fuses to zero.
    pub fn fuse(factors: &[TrustFactor]) -> f64 {
        let (num, den) = factors
            .iter()
            .filter(|f| f.weight.is_finite() && f.weight > 0.0)
            .fold((0.0, 0.0), |(n, d), f| {
                let p = if f.probability.is_nan() {
                    0.0
                } else {
                    f.probability.clamp(0.0, 1.0)
                };
                (n + p * f.weight, d + f.weight)
            });
        if den <= 0.0 { 0.0 } else { (num / den).clamp(0.0, 1.0) }
    }

    /// Map a score to a mode using the strict thresholds.
    pub fn mode_for(&self, score: f64) -> OperationMode {
        if score.is_nan() || score < MANUAL_ONLY_BELOW {
            OperationMode::ManualOnly
        } else if score < self.min_threshold {
            OperationMode::Assisted
        } else {
            OperationMode::Autonomous
        }
    }

    /// Full evaluation: fuse, veto, threshold, capability gating.
    pub fn evaluate(
        &self,
        attestation: &AttestationResult,
        platform: &PlatformResolution,
        snap: &HardwareSnapshot,
    ) -> TrustDescriptor {
        self.evaluate_with_bus(attestation, platform, snap, 1.0)
    }

    /// [`evaluate`](Self::evaluate) with a measured bus pulse health.
    pub fn evaluate_with_bus(
        &self,
        attestation: &AttestationResult,
        platform: &PlatformResolution,
        snap: &HardwareSnapshot,
        bus_health: f64,
    ) -> TrustDescriptor {
        let factors = self.factors(attestation, platform, snap, bus_health);
        let mut score = Self::fuse(&factors);
        let mut downgraded_by = None;

        if !attestation.valid && score > INVALID_ATTESTATION_CAP {
            score = INVALID_ATTESTATION_CAP;
            downgraded_by = Some("invalid attestation".to_string());
        }

        let mut mode = self.mode_for(score);

        let caps = &snap.capabilities;
        if mode == OperationMode::Autonomous && (caps.sensor_only || !caps.supports_goal_control)
        {
            mode = OperationMode::Assisted;
            downgraded_by = Some(if caps.sensor_only {
                "hardware is sensor-only".to_string()
            } else {
                "no goal-control support".to_string()
            });
        }

        let descriptor = TrustDescriptor {
            score,
            raw_score_q16: Q16::from_float(score),
            label: mode.label(),
            operation_mode: mode,
            factors,
            downgraded_by,
        };
        if mode == OperationMode::ManualOnly {
            warn!(score = descriptor.score, "Trust evaluation: MANUAL_ONLY");
        } else {
            info!(score = descriptor.score, mode = %mode, "Trust evaluation complete");
        }
        descriptor
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TrustCell
// ────────────────────────────────────────────────────────────────────────────

/// Copy-on-write holder for the current [`TrustDescriptor`].
#[derive(Debug)]
pub struct TrustCell {
    inner: RwLock<Arc<TrustDescriptor>>,
}

impl Default for TrustCell {
    fn default() -> Self {
        Self::new(TrustDescriptor::untrusted())
    }
}

impl TrustCell {
    pub fn new(initial: TrustDescriptor) -> Self {
        Self {
            inner: RwLock::new(Arc::new(initial)),
        }
    }

    /// The current descriptor.  The lock is held only long enough to clone
    /// the `Arc`.  A poisoned cell reads as untrusted.
    pub fn load(&self) -> Arc<TrustDescriptor> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(_) => Arc::new(TrustDescriptor::untrusted()),
        }
    }

    /// Non-blocking variant for the real-time loop.  `None` only while a
    /// writer is mid-swap.
    pub fn try_load(&self) -> Option<Arc<TrustDescriptor>> {
        match self.inner.try_read() {
            Ok(guard) => Some(Arc::clone(&guard)),
            Err(std::sync::TryLockError::WouldBlock) => None,
            Err(std::sync::TryLockError::Poisoned(_)) => {
                Some(Arc::new(TrustDescriptor::untrusted()))
            }
        }
    }

    /// Replace the descriptor wholesale and return the previous one.
    pub fn replace(&self, next: TrustDescriptor) -> Arc<TrustDescriptor> {
        let next = Arc::new(next);
        match self.inner.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, next),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), next),
        }
    }
}
