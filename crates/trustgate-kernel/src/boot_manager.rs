//! [`BootManager`] – Probe → Score → Attest → Trust orchestration.
//!
//! ```text
//!            ┌──── no marker / no cache / corrupt / schema drift ────┐
//!  start ────┤                                                       ├─► Cold ──┐
//!            └──── cached env ok ─► Fast ── sanity fails ────────────┘          │
//!                                    │                                          │
//!                                    └──────────────► attestation ◄─────────────┘
//!                                                      │        │
//!                                                invalid│        │valid
//!                                                      ▼        ▼
//!                                                 Recovery    Ready
//! ```
//!
//! Every call to [`BootManager::bootstrap`] starts again from the initial
//! check.  An invalid attestation never proceeds: the manager parks in
//! [`BootState::Recovery`] and returns [`KernelError::AttestationInvalid`].
//!
//! Once the kernel is running, [`BootManager::reattest`] re-checks the
//! measurement without aborting; an invalid result is folded into the trust
//! score instead.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use trustgate_hal::{HardwareBus, HardwareProbe};
use trustgate_types::{
    AttestationResult, BootPath, BootSequence, HardwareSnapshot, KernelError, MachineIdentity,
    PlatformResolution, ResolutionSource, TrustDescriptor,
};

use crate::attestor::{Attestor, SealPolicy};
use crate::bus_pulse::PulseCheck;
use crate::platform_scorer::PlatformScorer;
use crate::telemetry_feed::{TelemetryEvent, TelemetryFeed};
use crate::trust_evaluator::{DEFAULT_MIN_THRESHOLD, TrustEvaluator, TrustWeights};
use crate::vault::{StoredEnv, Vault};
use crate::watchdog::Heartbeat;

/// Where the boot state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    NeedsCold,
    Cold,
    Fast,
    Recovery,
    Ready,
}

/// Inputs that shape a bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BootConfig {
    pub weights: TrustWeights,
    pub min_threshold: f64,
    /// Re-provision the sealed reference on this cold boot.
    pub reseal: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            weights: TrustWeights::default(),
            min_threshold: DEFAULT_MIN_THRESHOLD,
            reseal: false,
        }
    }
}

pub struct BootManager {
    probe: Arc<dyn HardwareProbe>,
    vault: Arc<Vault>,
    attestor: Attestor,
    scorer: PlatformScorer,
    evaluator: TrustEvaluator,
    feed: TelemetryFeed,
    reseal: bool,
    heartbeat: Option<Heartbeat>,
    bus: Option<Arc<dyn HardwareBus>>,
    pulse: PulseCheck,
    state: Mutex<BootState>,
}

impl BootManager {
    /// # Errors
    ///
    /// [`KernelError::InvalidConfig`] for bad weights or threshold.
    pub fn new(
        config: BootConfig,
        probe: Arc<dyn HardwareProbe>,
        vault: Arc<Vault>,
        attestor: Attestor,
        feed: TelemetryFeed,
    ) -> Result<Self, KernelError> {
        Ok(Self {
            probe,
            vault,
            attestor,
            scorer: PlatformScorer::new(),
            evaluator: TrustEvaluator::new(config.weights, config.min_threshold)?,
            feed,
            reseal: config.reseal,
            heartbeat: None,
            bus: None,
            pulse: PulseCheck::default(),
            state: Mutex::new(BootState::NeedsCold),
        })
    }

    /// Beat `heartbeat` at every boot stage so a supervisor can spot a hang.
    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Grade `bus`'s write latency into every trust evaluation.
    pub fn with_bus(mut self, bus: Arc<dyn HardwareBus>, pulse: PulseCheck) -> Self {
        self.bus = Some(bus);
        self.pulse = pulse;
        self
    }

    pub fn state(&self) -> BootState {
        self.state.lock().map(|s| *s).unwrap_or(BootState::Recovery)
    }

    /// Run one full boot attempt.
    ///
    /// # Errors
    ///
    /// - [`KernelError::AttestationInvalid`] – integrity check failed; the
    ///   manager is in [`BootState::Recovery`] and the caller must not
    ///   operate actuators.
    /// - [`KernelError::Vault`] – the sealed reference could not be written;
    ///   the manager is in [`BootState::Recovery`].
    ///
    /// With `reseal` set the cached environment is ignored, so the boot is
    /// always cold and re-provisions the sealed reference.
    #[instrument(skip(self), name = "bootstrap")]
    pub fn bootstrap(&self) -> Result<BootSequence, KernelError> {
        self.transition(BootState::NeedsCold);
        self.progress("probing", 0.1);

        let identity = match self.probe.passive_scan() {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Passive scan failed; using unknown identity");
                MachineIdentity::unknown()
            }
        };

        let cached = if self.reseal {
            warn!("Reseal requested; ignoring cached environment");
            None
        } else {
            self.cached_env()
        };
        match cached {
            Some(env) => self.fast(identity, env),
            None => self.cold(identity),
        }
    }

    /// Drop the first-boot marker so the next bootstrap runs a full cold
    /// discovery.
    pub fn reprobe(&self) -> Result<(), KernelError> {
        info!("Cold reprobe requested");
        self.vault.invalidate()
    }

    /// Re-check the measurement on a running system.  Never aborts; an
    /// invalid result drives the score down through the veto cap.
    pub fn reattest(&self, boot: &BootSequence) -> TrustDescriptor {
        let attestation = match self.attestor.attest(
            &self.vault,
            &boot.env_snapshot.identity,
            SealPolicy::RequireExisting,
            None,
        ) {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "Re-attestation failed");
                AttestationResult::invalid(String::new())
            }
        };
        if !attestation.valid {
            warn!("Re-attestation invalid; applying score penalty");
        }
        let trust = self.evaluator.evaluate_with_bus(
            &attestation,
            &boot.platform,
            &boot.env_snapshot,
            self.bus_health(),
        );
        self.feed
            .publish(TelemetryEvent::trust(&trust, boot.platform.final_class));
        trust
    }

    // ---- paths -------------------------------------------------------------

    /// `Some` only when a marker exists and the cached env parses at the
    /// current schema version.
    fn cached_env(&self) -> Option<StoredEnv> {
        if !self.vault.has_first_boot_marker() {
            info!("No first-boot marker; cold boot required");
            return None;
        }
        match self.vault.load_env() {
            Ok(Some(env)) => Some(env),
            Ok(None) => {
                info!("No cached environment; cold boot required");
                None
            }
            Err(e) => {
                warn!(error = %e, cold_boot = e.triggers_cold_boot(), "Cached environment unusable");
                None
            }
        }
    }

    fn cold(&self, identity: MachineIdentity) -> Result<BootSequence, KernelError> {
        self.transition(BootState::Cold);

        let snapshot = match self.probe.active_scan(identity.clone()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Active discovery failed; assuming sensor-only hardware");
                HardwareSnapshot::sensor_only_default(identity)
            }
        };

        let mut platform = PlatformResolution::pending();
        let sealed = if self.reseal {
            None
        } else {
            self.attestor.sealed_platform(&self.vault)
        };
        match sealed {
            Some(class) => self.scorer.lock_to(class, &snapshot, &mut platform),
            None => self.scorer.resolve(&snapshot, &mut platform),
        }
        self.progress("attesting", 0.5);

        let policy = if self.reseal {
            SealPolicy::Reseal
        } else {
            SealPolicy::ProvisionIfMissing
        };
        let seal_class =
            (platform.source != ResolutionSource::Fallback).then_some(platform.final_class);
        let attestation = self
            .attestor
            .attest(&self.vault, &snapshot.identity, policy, seal_class)
            .map_err(|e| self.abort(e))?;
        if !attestation.valid {
            return Err(self.recover(&attestation));
        }
        self.progress("evaluating", 0.8);

        let trust =
            self.evaluator
                .evaluate_with_bus(&attestation, &platform, &snapshot, self.bus_health());

        match self
            .vault
            .store_env(&StoredEnv::new(snapshot.clone(), platform.clone()))
        {
            Ok(()) => {
                if let Err(e) = self.vault.write_first_boot_marker() {
                    warn!(error = %e, "Failed to write first-boot marker");
                }
            }
            Err(e) => warn!(error = %e, "Failed to persist environment; next boot is cold"),
        }

        Ok(self.finish(BootPath::Cold, snapshot, platform, attestation, trust))
    }

    fn fast(&self, identity: MachineIdentity, env: StoredEnv) -> Result<BootSequence, KernelError> {
        self.transition(BootState::Fast);

        if !self.probe.sanity_check(&env.snapshot) {
            warn!("Sanity check failed; falling back to cold boot");
            return self.cold(identity);
        }
        self.progress("attesting", 0.5);

        let attestation = self
            .attestor
            .attest(&self.vault, &identity, SealPolicy::RequireExisting, None)
            .map_err(|e| self.abort(e))?;
        if !attestation.valid {
            return Err(self.recover(&attestation));
        }
        self.progress("evaluating", 0.8);

        let mut platform = env.platform;
        self.scorer.resolve(&env.snapshot, &mut platform);
        let trust = self.evaluator.evaluate_with_bus(
            &attestation,
            &platform,
            &env.snapshot,
            self.bus_health(),
        );

        Ok(self.finish(BootPath::Fast, env.snapshot, platform, attestation, trust))
    }

    fn recover(&self, attestation: &AttestationResult) -> KernelError {
        error!(env_hash = %attestation.env_hash, "Attestation invalid");
        self.abort(KernelError::AttestationInvalid(format!(
            "measurement mismatch (env_hash={})",
            attestation.env_hash
        )))
    }

    /// Park in [`BootState::Recovery`] and hand `e` back to the caller.
    fn abort(&self, e: KernelError) -> KernelError {
        self.transition(BootState::Recovery);
        error!(error = %e, "Boot aborted; entering recovery");
        self.feed.publish(TelemetryEvent::Denied {
            subject: "boot".to_string(),
            reason: e.to_string(),
        });
        e
    }

    fn finish(
        &self,
        path: BootPath,
        env_snapshot: HardwareSnapshot,
        platform: PlatformResolution,
        attestation: AttestationResult,
        trust: TrustDescriptor,
    ) -> BootSequence {
        self.transition(BootState::Ready);
        self.progress("complete", 1.0);
        self.feed
            .publish(TelemetryEvent::trust(&trust, platform.final_class));

        let boot = BootSequence {
            platform_id: platform.final_class,
            trust_score: trust.score,
            is_verified: attestation.valid,
            mode: trust.operation_mode,
            env_snapshot,
            platform,
            trust,
            path,
            attestation,
        };
        info!(summary = %boot.summary(), "Boot complete");
        boot
    }

    // ---- helpers -----------------------------------------------------------

    fn transition(&self, next: BootState) {
        if let Ok(mut s) = self.state.lock() {
            let prev = *s;
            if prev != next {
                info!(from = ?prev, to = ?next, "Boot state");
            }
            *s = next;
        }
    }

    fn bus_health(&self) -> f64 {
        self.bus
            .as_deref()
            .map_or(1.0, |bus| self.pulse.verify(bus))
    }

    fn progress(&self, stage: &str, fraction: f32) {
        if let Some(hb) = &self.heartbeat {
            hb.beat();
        }
        self.feed.publish(TelemetryEvent::progress(stage, fraction));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    use trustgate_hal::sim::{SimHost, SimProbe};
    use trustgate_types::{OperationMode, PlatformClass};

    use crate::vault::LAST_KNOWN_ENV;

    struct Fixture {
        _dir: tempfile::TempDir,
        vault: Arc<Vault>,
        binary: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("trustgate.bin");
        fs::write(&binary, b"\x7fELF trustgate").unwrap();
        let vault = Arc::new(Vault::open(dir.path().join("vault")).unwrap());
        Fixture { _dir: dir, vault, binary }
    }

    fn vehicle() -> SimProbe {
        SimHost::new("ecu-01").with_can("can0").with_os_release("AGL 16").build()
    }

    fn manager(f: &Fixture, probe: Arc<SimProbe>, config: BootConfig) -> BootManager {
        BootManager::new(
            config,
            probe,
            f.vault.clone(),
            Attestor::new(&f.binary),
            TelemetryFeed::detached(),
        )
        .unwrap()
    }

    #[test]
    fn first_boot_is_cold_then_fast() {
        let f = fixture();
        let probe = Arc::new(vehicle());
        let bm = manager(&f, probe.clone(), BootConfig::default());

        let first = bm.bootstrap().unwrap();
        assert_eq!(first.path, BootPath::Cold);
        assert_eq!(first.platform_id, PlatformClass::Vehicle);
        assert!(first.is_verified);
        assert_eq!(bm.state(), BootState::Ready);
        assert!(f.vault.has_first_boot_marker());

        let second = bm.bootstrap().unwrap();
        assert_eq!(second.path, BootPath::Fast);
        assert_eq!(second.platform_id, PlatformClass::Vehicle);
        assert_eq!(probe.active_scan_count(), 1);
    }

    #[test]
    fn schema_drift_forces_cold_boot_despite_marker() {
        let f = fixture();
        let probe = Arc::new(vehicle());
        let bm = manager(&f, probe.clone(), BootConfig::default());
        bm.bootstrap().unwrap();

        // Rewrite the cached env as schema version 2.
        let path = f.vault.document_path(LAST_KNOWN_ENV);
        let mut doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        doc["schema_version"] = serde_json::json!(2);
        fs::write(&path, doc.to_string()).unwrap();
        assert!(f.vault.has_first_boot_marker());

        let boot = bm.bootstrap().unwrap();
        assert_eq!(boot.path, BootPath::Cold);
        assert_eq!(probe.active_scan_count(), 2);
    }

    #[test]
    fn corrupt_cache_forces_cold_boot() {
        let f = fixture();
        let probe = Arc::new(vehicle());
        let bm = manager(&f, probe.clone(), BootConfig::default());
        bm.bootstrap().unwrap();
        fs::write(f.vault.document_path(LAST_KNOWN_ENV), "{ not json").unwrap();
        assert_eq!(bm.bootstrap().unwrap().path, BootPath::Cold);
    }

    #[test]
    fn unplugged_bus_fails_sanity_and_goes_cold() {
        let f = fixture();
        let probe = Arc::new(vehicle());
        let bm = manager(&f, probe.clone(), BootConfig::default());
        bm.bootstrap().unwrap();
        probe.unplug("can0");
        assert_eq!(bm.bootstrap().unwrap().path, BootPath::Cold);
        assert_eq!(probe.active_scan_count(), 2);
    }

    #[test]
    fn tampered_binary_enters_recovery() {
        let f = fixture();
        let bm = manager(&f, Arc::new(vehicle()), BootConfig::default());
        bm.bootstrap().unwrap();

        fs::write(&f.binary, b"\x7fELF patched").unwrap();
        let err = bm.bootstrap().unwrap_err();
        assert!(matches!(err, KernelError::AttestationInvalid(_)));
        assert!(err.is_fatal_to_boot());
        assert_eq!(bm.state(), BootState::Recovery);

        // A cold reprobe does not launder the mismatch either.
        bm.reprobe().unwrap();
        assert!(bm.bootstrap().is_err());
    }

    #[test]
    fn fast_boot_without_sealed_reference_enters_recovery() {
        let f = fixture();
        let bm = manager(&f, Arc::new(vehicle()), BootConfig::default());
        bm.bootstrap().unwrap();
        fs::remove_file(f.vault.document_path(crate::attestor::SEALED_REFERENCE)).unwrap();
        assert!(matches!(
            bm.bootstrap(),
            Err(KernelError::AttestationInvalid(_))
        ));
    }

    #[test]
    fn reseal_accepts_an_upgraded_binary() {
        let f = fixture();
        let probe = Arc::new(vehicle());
        manager(&f, probe.clone(), BootConfig::default())
            .bootstrap()
            .unwrap();
        fs::write(&f.binary, b"\x7fELF v2").unwrap();
        assert!(f.vault.has_first_boot_marker());

        // Without reseal the upgrade looks like tampering.
        let plain = manager(&f, probe.clone(), BootConfig::default());
        assert!(matches!(
            plain.bootstrap(),
            Err(KernelError::AttestationInvalid(_))
        ));

        let config = BootConfig {
            reseal: true,
            ..BootConfig::default()
        };
        let boot = manager(&f, probe.clone(), config).bootstrap().unwrap();
        assert!(boot.is_verified);
        assert_eq!(boot.path, BootPath::Cold);
        assert_eq!(probe.active_scan_count(), 2);

        // The new measurement is now the reference for ordinary boots.
        let after = manager(&f, probe, BootConfig::default()).bootstrap().unwrap();
        assert_eq!(after.path, BootPath::Fast);
        assert!(after.is_verified);
    }

    #[test]
    fn sealing_failure_enters_recovery() {
        let f = fixture();
        // A directory squatting on the reference path makes the write fail.
        let squat = f.vault.document_path(crate::attestor::SEALED_REFERENCE);
        fs::create_dir_all(&squat).unwrap();
        fs::write(squat.join("keep"), b"x").unwrap();

        let config = BootConfig {
            reseal: true,
            ..BootConfig::default()
        };
        let bm = manager(&f, Arc::new(vehicle()), config);
        let err = bm.bootstrap().unwrap_err();
        assert!(matches!(err, KernelError::Vault(_)), "{err:?}");
        assert_eq!(bm.state(), BootState::Recovery);
        assert!(!f.vault.has_first_boot_marker());
    }

    #[test]
    fn probe_failure_falls_back_to_sensor_only() {
        let f = fixture();
        let probe = Arc::new(SimHost::new("cell-7").with_modbus("ttyUSB0").with_actuation().build());
        probe.set_fail_active(true);
        let boot = manager(&f, probe, BootConfig::default()).bootstrap().unwrap();
        assert!(boot.env_snapshot.capabilities.sensor_only);
        assert!(boot.env_snapshot.buses.is_empty());
        assert_ne!(boot.mode, OperationMode::Autonomous);
    }

    #[test]
    fn sealed_platform_locks_later_cold_boots() {
        let f = fixture();
        let bm = manager(&f, Arc::new(vehicle()), BootConfig::default());
        bm.bootstrap().unwrap();
        bm.reprobe().unwrap();

        let boot = bm.bootstrap().unwrap();
        assert_eq!(boot.path, BootPath::Cold);
        assert_eq!(boot.platform_id, PlatformClass::Vehicle);
        let env = f.vault.load_env().unwrap().unwrap();
        assert_eq!(env.platform.source, ResolutionSource::AttestationLock);
    }

    #[test]
    fn reattest_penalises_instead_of_aborting() {
        let f = fixture();
        let bm = manager(&f, Arc::new(vehicle()), BootConfig::default());
        let boot = bm.bootstrap().unwrap();

        let ok = bm.reattest(&boot);
        assert_eq!(ok.score, boot.trust_score);

        fs::write(&f.binary, b"\x7fELF swapped at runtime").unwrap();
        let penalised = bm.reattest(&boot);
        assert_eq!(penalised.operation_mode, OperationMode::ManualOnly);
        assert!(penalised.score <= 0.30);
    }

    #[test]
    fn slow_bus_lowers_hardware_trust() {
        use std::time::Duration;
        use trustgate_hal::BusPulse;
        use trustgate_hal::sim::SimBus;

        let f = fixture();
        let bus = Arc::new(SimBus::new());
        let bm = manager(&f, Arc::new(vehicle()), BootConfig::default())
            .with_bus(bus.clone(), PulseCheck::default());
        let boot = bm.bootstrap().unwrap();
        let hw = |t: &TrustDescriptor| t.factors[2].probability;
        assert_eq!(hw(&boot.trust), 1.0);

        bus.set_pulse(Some(BusPulse {
            latency: Duration::from_millis(20),
            age: Duration::ZERO,
        }));
        assert!((hw(&bm.reattest(&boot)) - 0.5).abs() < 1e-9);

        bus.set_pulse(Some(BusPulse {
            latency: Duration::from_millis(1),
            age: Duration::from_secs(10),
        }));
        let stale = bm.reattest(&boot);
        assert_eq!(hw(&stale), 0.0);
        assert!(stale.score < boot.trust_score);
    }

    #[test]
    fn bad_config_is_rejected() {
        let f = fixture();
        let config = BootConfig {
            min_threshold: 1.5,
            ..BootConfig::default()
        };
        let result = BootManager::new(
            config,
            Arc::new(vehicle()),
            f.vault.clone(),
            Attestor::new(&f.binary),
            TelemetryFeed::detached(),
        );
        assert!(matches!(result, Err(KernelError::InvalidConfig(_))));
    }

    #[test]
    fn progress_and_trust_are_published() {
        let f = fixture();
        let (feed, mut rx) = TelemetryFeed::new(16);
        let bm = BootManager::new(
            BootConfig::default(),
            Arc::new(vehicle()),
            f.vault.clone(),
            Attestor::new(&f.binary),
            feed,
        )
        .unwrap();
        bm.bootstrap().unwrap();

        let mut fractions = Vec::new();
        let mut saw_trust = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                TelemetryEvent::Progress { fraction, .. } => fractions.push(fraction),
                TelemetryEvent::Trust { platform_class, .. } => {
                    assert_eq!(platform_class, PlatformClass::Vehicle);
                    saw_trust = true;
                }
                _ => {}
            }
        }
        assert_eq!(fractions, vec![0.1, 0.5, 0.8, 1.0]);
        assert!(saw_trust);
    }
}
