//! [`PlatformScorer`] – heuristic evidence-to-class scoring.
//!
//! Each rule that fires adds a weighted increment to one or more candidate
//! classes and records a human-readable signal.  Confidence is
//! `raw_score / max_score` encoded as [`Q16`].
//!
//! Selection picks the highest confidence.  On an exact tie a safety-critical
//! class beats a general-purpose one, then declaration order decides.
//! Mistaking a vehicle for a workstation is worse than the reverse.  Below
//! [`MIN_CONFIDENCE`] the scorer refuses to guess and falls back to
//! [`PlatformClass::GenericSafeMode`].
//!
//! ```
//! use trustgate_kernel::platform_scorer::PlatformScorer;
//! use trustgate_types::{PlatformClass, PlatformResolution};
//! use trustgate_hal::{HardwareProbe, sim::SimHost};
//!
//! let probe = SimHost::new("ecu").with_can("can0").build();
//! let snap = probe.active_scan(probe.passive_scan().unwrap()).unwrap();
//!
//! let scorer = PlatformScorer::new();
//! let mut res = PlatformResolution::pending();
//! scorer.resolve(&snap, &mut res);
//! assert_eq!(res.final_class, PlatformClass::Vehicle);
//! assert!(res.locked);
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info};
use trustgate_types::{
    BusType, HardwareSnapshot, PlatformCandidate, PlatformClass, PlatformResolution, Q16,
    ResolutionSource,
};

/// Minimum confidence for a heuristic pick.
pub const MIN_CONFIDENCE: f64 = 0.40;

/// Score ceiling per class.
fn max_score(class: PlatformClass) -> f64 {
    match class {
        PlatformClass::Vehicle => 1.5,
        PlatformClass::Industrial | PlatformClass::Robot => 1.2,
        _ => 1.0,
    }
}

const AUTOMOTIVE_OS_HINTS: [&str; 4] = ["agl", "automotive", "qnx", "autosar"];

#[derive(Debug, Clone)]
pub struct PlatformScorer {
    min_confidence: f64,
}

impl Default for PlatformScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformScorer {
    pub fn new() -> Self {
        Self {
            min_confidence: MIN_CONFIDENCE,
        }
    }

    /// Score every class with at least one matching signal.  Candidates come
    /// back normalised, in [`PlatformClass::ALL`] order.
    pub fn score(&self, snap: &HardwareSnapshot) -> Vec<PlatformCandidate> {
        let mut acc: HashMap<PlatformClass, PlatformCandidate> = HashMap::new();
        let mut add = |class: PlatformClass, weight: f64, signal: &str| {
            acc.entry(class)
                .or_insert_with(|| PlatformCandidate::new(class, max_score(class)))
                .add(weight, signal);
        };

        let id = &snap.identity;
        let has_can = snap.has_bus(BusType::Can);
        let has_i2c = snap.has_bus(BusType::I2c);
        let has_spi = snap.has_bus(BusType::Spi);
        let release = id.os_release.to_ascii_lowercase();
        let arch = id.arch.to_ascii_lowercase();

        if has_can {
            add(PlatformClass::Vehicle, 0.8, "can bus detected");
            add(PlatformClass::Industrial, 0.3, "can bus detected");
        }
        if AUTOMOTIVE_OS_HINTS.iter().any(|h| release.contains(h)) {
            add(PlatformClass::Vehicle, 0.5, "automotive-grade os");
        }
        if snap.has_processor("ECU") {
            add(PlatformClass::Vehicle, 0.2, "ecu processor");
        }
        if has_i2c && has_spi {
            add(PlatformClass::Robot, 0.5, "i2c and spi buses");
        }
        if snap.protocol.writable_registers > 0 && snap.protocol.supports_safe_stop {
            add(PlatformClass::Robot, 0.3, "writable controller with safe-stop");
            add(PlatformClass::Industrial, 0.3, "writable controller with safe-stop");
        }
        if snap.has_bus(BusType::Modbus) {
            add(PlatformClass::Industrial, 0.6, "modbus rtu candidate");
        }
        if id.industrial_node_id.is_some() {
            add(PlatformClass::Industrial, 0.6, "industrial node id provisioned");
        }
        if snap.has_battery {
            add(PlatformClass::Laptop, 0.6, "battery present");
            add(PlatformClass::Robot, 0.2, "battery present");
            if has_spi && !has_can {
                add(PlatformClass::Drone, 0.5, "battery-powered spi flight controller");
            }
        } else {
            add(PlatformClass::Workstation, 0.4, "no battery");
        }
        if snap.has_processor("GPU") {
            add(PlatformClass::Workstation, 0.3, "discrete gpu");
            add(PlatformClass::Laptop, 0.2, "discrete gpu");
        }
        if arch == "x86_64" && !has_can && !has_i2c {
            add(PlatformClass::Workstation, 0.2, "x86_64 without field buses");
        }
        if arch.starts_with("arm") || arch.starts_with("aarch64") || arch.starts_with("riscv") {
            add(PlatformClass::Embedded, 0.4, "embedded architecture");
        }
        if has_i2c && !has_spi {
            add(PlatformClass::Embedded, 0.3, "i2c only");
        }
        if matches!(id.os.as_str(), "android" | "ios") {
            add(PlatformClass::Mobile, 0.9, "mobile operating system");
        }

        let mut candidates: Vec<PlatformCandidate> = acc.into_values().collect();
        for c in &mut candidates {
            c.normalize();
        }
        candidates.sort_by_key(|c| c.class.ordinal());
        candidates
    }

    /// Pick the final class from `candidates`.
    pub fn select(&self, candidates: &[PlatformCandidate]) -> (PlatformClass, ResolutionSource) {
        let best = candidates.iter().max_by(|a, b| rank(a, b));
        match best {
            Some(c) if c.confidence.to_float() >= self.min_confidence => {
                (c.class, ResolutionSource::Heuristic)
            }
            _ => (PlatformClass::GenericSafeMode, ResolutionSource::Fallback),
        }
    }

    /// Score and lock `resolution`.  A no-op when it is already locked.
    pub fn resolve(&self, snap: &HardwareSnapshot, resolution: &mut PlatformResolution) {
        if resolution.locked {
            debug!(class = %resolution.final_class, "Platform already locked; skipping resolution");
            return;
        }
        let candidates = self.score(snap);
        let (final_class, source) = self.select(&candidates);
        *resolution = PlatformResolution {
            final_class,
            candidates,
            source,
            resolved_at: Utc::now(),
            locked: true,
        };
        info!(
            class = %final_class,
            source = ?source,
            confidence = resolution.final_confidence().percentage(),
            "Platform resolved"
        );
    }

    /// Lock `resolution` to a class sealed with the attestation reference,
    /// keeping the heuristic candidates for audit.  A no-op when already
    /// locked.
    pub fn lock_to(
        &self,
        class: PlatformClass,
        snap: &HardwareSnapshot,
        resolution: &mut PlatformResolution,
    ) {
        if resolution.locked {
            return;
        }
        let mut candidates = self.score(snap);
        if !candidates.iter().any(|c| c.class == class) {
            let mut c = PlatformCandidate::new(class, max_score(class));
            c.signals.push("sealed platform".to_string());
            candidates.push(c);
        }
        // The sealed identity is the evidence; report it at full confidence.
        for c in candidates.iter_mut().filter(|c| c.class == class) {
            c.confidence = Q16::MAX;
        }
        *resolution = PlatformResolution {
            final_class: class,
            candidates,
            source: ResolutionSource::AttestationLock,
            resolved_at: Utc::now(),
            locked: true,
        };
        info!(class = %class, "Platform locked by sealed reference");
    }

    /// Explicit cold reprobe: drop the lock and resolve again.
    pub fn reprobe(&self, snap: &HardwareSnapshot, resolution: &mut PlatformResolution) {
        resolution.locked = false;
        self.resolve(snap, resolution);
    }
}

/// Confidence first, then safety bias, then declaration order.
fn rank(a: &PlatformCandidate, b: &PlatformCandidate) -> Ordering {
    a.confidence
        .cmp(&b.confidence)
        .then_with(|| {
            a.class
                .is_safety_critical()
                .cmp(&b.class.is_safety_critical())
        })
        .then_with(|| b.class.ordinal().cmp(&a.class.ordinal()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustgate_hal::HardwareProbe;
    use trustgate_hal::sim::SimHost;

    fn snapshot(host: SimHost) -> HardwareSnapshot {
        let probe = host.build();
        probe.active_scan(probe.passive_scan().unwrap()).unwrap()
    }

    fn candidate(class: PlatformClass, raw: u16) -> PlatformCandidate {
        PlatformCandidate {
            class,
            raw_score: 0.0,
            max_score: 1.0,
            confidence: Q16::from_raw(raw),
            signals: Vec::new(),
        }
    }

    #[test]
    fn exact_tie_prefers_safety_critical_class() {
        let scorer = PlatformScorer::new();
        let candidates = vec![
            candidate(PlatformClass::Workstation, 40000),
            candidate(PlatformClass::Vehicle, 40000),
        ];
        assert_eq!(
            scorer.select(&candidates),
            (PlatformClass::Vehicle, ResolutionSource::Heuristic)
        );
        // Order of the input does not matter.
        let reversed: Vec<_> = candidates.into_iter().rev().collect();
        assert_eq!(scorer.select(&reversed).0, PlatformClass::Vehicle);
    }

    #[test]
    fn tie_between_safety_classes_uses_declaration_order() {
        let scorer = PlatformScorer::new();
        let candidates = vec![
            candidate(PlatformClass::Robot, 50000),
            candidate(PlatformClass::Industrial, 50000),
        ];
        assert_eq!(scorer.select(&candidates).0, PlatformClass::Industrial);
    }

    #[test]
    fn higher_confidence_beats_safety_bias() {
        let scorer = PlatformScorer::new();
        let candidates = vec![
            candidate(PlatformClass::Vehicle, 40000),
            candidate(PlatformClass::Workstation, 40001),
        ];
        assert_eq!(scorer.select(&candidates).0, PlatformClass::Workstation);
    }

    #[test]
    fn low_confidence_falls_back_to_safe_mode() {
        let scorer = PlatformScorer::new();
        let candidates = vec![candidate(PlatformClass::Laptop, Q16::from_float(0.39).raw())];
        assert_eq!(
            scorer.select(&candidates),
            (PlatformClass::GenericSafeMode, ResolutionSource::Fallback)
        );
        assert_eq!(scorer.select(&[]).0, PlatformClass::GenericSafeMode);
    }

    #[test]
    fn can_bus_scores_vehicle() {
        let snap = snapshot(
            SimHost::new("ecu")
                .with_can("can0")
                .with_os_release("Automotive Grade Linux"),
        );
        let candidates = PlatformScorer::new().score(&snap);
        let vehicle = candidates
            .iter()
            .find(|c| c.class == PlatformClass::Vehicle)
            .unwrap();
        assert!((vehicle.raw_score - 1.3).abs() < 1e-9);
        assert!(vehicle.signals.iter().any(|s| s.contains("can")));
    }

    #[test]
    fn i2c_and_spi_with_battery_is_robot() {
        let snap = snapshot(
            SimHost::new("rover")
                .with_i2c("i2c-1")
                .with_spi("spidev0.0")
                .with_battery()
                .with_actuation(),
        );
        let mut res = PlatformResolution::pending();
        PlatformScorer::new().resolve(&snap, &mut res);
        assert_eq!(res.final_class, PlatformClass::Robot);
        assert_eq!(res.source, ResolutionSource::Heuristic);
    }

    #[test]
    fn arm_board_with_i2c_is_embedded() {
        let snap = snapshot(SimHost::new("sbc").with_arch("aarch64").with_i2c("i2c-0"));
        let mut res = PlatformResolution::pending();
        PlatformScorer::new().resolve(&snap, &mut res);
        assert_eq!(res.final_class, PlatformClass::Embedded);
        assert!((res.final_confidence().to_float() - 0.7).abs() < 1e-3);
    }

    #[test]
    fn bare_desktop_is_workstation() {
        let snap = snapshot(SimHost::new("desk").with_gpu());
        let mut res = PlatformResolution::pending();
        PlatformScorer::new().resolve(&snap, &mut res);
        assert_eq!(res.final_class, PlatformClass::Workstation);
    }

    #[test]
    fn resolving_a_locked_resolution_is_idempotent() {
        let scorer = PlatformScorer::new();
        let snap = snapshot(SimHost::new("ecu").with_can("can0"));
        let mut res = PlatformResolution::pending();
        scorer.resolve(&snap, &mut res);
        let first = res.clone();

        // Different hardware, same locked resolution.
        let other = snapshot(SimHost::new("desk").with_gpu());
        scorer.resolve(&other, &mut res);
        assert_eq!(res, first);
        scorer.resolve(&snap, &mut res);
        assert_eq!(res, first);
    }

    #[test]
    fn reprobe_clears_the_lock() {
        let scorer = PlatformScorer::new();
        let mut res = PlatformResolution::pending();
        scorer.resolve(&snapshot(SimHost::new("ecu").with_can("can0")), &mut res);
        scorer.reprobe(&snapshot(SimHost::new("desk").with_gpu()), &mut res);
        assert_eq!(res.final_class, PlatformClass::Workstation);
        assert!(res.locked);
    }

    #[test]
    fn attestation_lock_overrides_heuristics() {
        let scorer = PlatformScorer::new();
        let snap = snapshot(SimHost::new("desk").with_gpu());
        let mut res = PlatformResolution::pending();
        scorer.lock_to(PlatformClass::Industrial, &snap, &mut res);
        assert_eq!(res.final_class, PlatformClass::Industrial);
        assert_eq!(res.source, ResolutionSource::AttestationLock);
        assert_eq!(res.final_confidence(), Q16::MAX);
    }
}
