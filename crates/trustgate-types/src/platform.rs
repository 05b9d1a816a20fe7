//! Platform identity: classes, scored candidates and the final resolution.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::q16::Q16;

/// The kinds of host the controller knows how to run on.
///
/// Declaration order matters: when two safety-critical candidates tie, the
/// one declared first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformClass {
    Vehicle,
    Industrial,
    Drone,
    Robot,
    Embedded,
    Laptop,
    Workstation,
    Mobile,
    /// Chosen when no candidate is convincing enough.
    GenericSafeMode,
}

impl PlatformClass {
    /// Every class, in declaration order.
    pub const ALL: [PlatformClass; 9] = [
        PlatformClass::Vehicle,
        PlatformClass::Industrial,
        PlatformClass::Drone,
        PlatformClass::Robot,
        PlatformClass::Embedded,
        PlatformClass::Laptop,
        PlatformClass::Workstation,
        PlatformClass::Mobile,
        PlatformClass::GenericSafeMode,
    ];

    /// Classes where misidentification can hurt people or equipment.
    pub fn is_safety_critical(self) -> bool {
        matches!(
            self,
            PlatformClass::Vehicle
                | PlatformClass::Industrial
                | PlatformClass::Drone
                | PlatformClass::Robot
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlatformClass::Vehicle => "vehicle",
            PlatformClass::Industrial => "industrial",
            PlatformClass::Drone => "drone",
            PlatformClass::Robot => "robot",
            PlatformClass::Embedded => "embedded",
            PlatformClass::Laptop => "laptop",
            PlatformClass::Workstation => "workstation",
            PlatformClass::Mobile => "mobile",
            PlatformClass::GenericSafeMode => "generic_safe_mode",
        }
    }

    /// Position in [`PlatformClass::ALL`].
    pub fn ordinal(self) -> usize {
        Self::ALL.iter().position(|c| *c == self).unwrap_or(Self::ALL.len())
    }
}

impl fmt::Display for PlatformClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scored hypothesis about what the host is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformCandidate {
    pub class: PlatformClass,
    pub raw_score: f64,
    pub max_score: f64,
    /// `raw_score / max_score`, clamped to `[0, 1]`.
    pub confidence: Q16,
    /// Human-readable evidence, e.g. `"can bus detected"`.
    pub signals: Vec<String>,
}

impl PlatformCandidate {
    /// A zero-score candidate for `class` with the given ceiling.
    pub fn new(class: PlatformClass, max_score: f64) -> Self {
        Self {
            class,
            raw_score: 0.0,
            max_score,
            confidence: Q16::ZERO,
            signals: Vec::new(),
        }
    }

    /// Add `weight` to the raw score and record the evidence.
    pub fn add(&mut self, weight: f64, signal: impl Into<String>) {
        self.raw_score += weight;
        self.signals.push(signal.into());
    }

    /// Recompute [`PlatformCandidate::confidence`] from the raw score.
    pub fn normalize(&mut self) {
        let ratio = if self.max_score > 0.0 {
            self.raw_score / self.max_score
        } else {
            0.0
        };
        self.confidence = Q16::from_float(ratio);
    }
}

/// Where the final class came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Heuristic,
    AttestationLock,
    Fallback,
}

/// The outcome of platform scoring.
///
/// Once `locked` is set the resolution must not be recomputed except by an
/// explicit cold reprobe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformResolution {
    pub final_class: PlatformClass,
    pub candidates: Vec<PlatformCandidate>,
    pub source: ResolutionSource,
    pub resolved_at: DateTime<Utc>,
    pub locked: bool,
}

impl PlatformResolution {
    /// An unlocked, unresolved placeholder.
    pub fn pending() -> Self {
        Self {
            final_class: PlatformClass::GenericSafeMode,
            candidates: Vec::new(),
            source: ResolutionSource::Fallback,
            resolved_at: Utc::now(),
            locked: false,
        }
    }

    /// The candidate entry for the selected class, if one was scored.
    pub fn final_candidate(&self) -> Option<&PlatformCandidate> {
        self.candidates.iter().find(|c| c.class == self.final_class)
    }

    /// Confidence in the final class.  Zero until the resolution is locked.
    pub fn final_confidence(&self) -> Q16 {
        if !self.locked {
            return Q16::ZERO;
        }
        self.final_candidate().map(|c| c.confidence).unwrap_or(Q16::ZERO)
    }
}
