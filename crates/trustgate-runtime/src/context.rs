//! [`KernelHandles`] – the explicit, passed-down kernel context.
//!
//! Built once by [`KernelHandles::assemble`] and shared by `Arc`.  Every
//! execution context gets what it needs from here; there is no global state.
//!
//! The interlock and the trust cell exist before the boot runs, so the
//! interlock poller and the actuator loop can start first.  Until
//! [`KernelHandles::bootstrap`] succeeds the trust cell holds an untrusted
//! descriptor and the loop only writes the safe state.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use trustgate_hal::{HardwareBus, HardwareProbe};
use trustgate_kernel::{
    Attestor, BootConfig, BootManager, CommandRouter, IncidentLog, PulseCheck, SafetyInterlock,
    TaskDispatcher, TelemetryEvent, TelemetryFeed, TrustCell, Vault, Watchdog,
};
use trustgate_types::{BootSequence, KernelError, TrustDescriptor};

use crate::actuator_loop::{ActuatorLoop, ActuatorLoopConfig};
use crate::intent_slot::IntentSlot;
use crate::interlock_poller::InterlockPoller;

pub const BOOT_COMPONENT: &str = "boot";
pub const ACTUATOR_COMPONENT: &str = "actuator_loop";
pub const POLLER_COMPONENT: &str = "interlock_poller";

/// Everything [`KernelHandles::assemble`] needs from the caller.
pub struct KernelParts {
    pub vault: Arc<Vault>,
    pub probe: Arc<dyn HardwareProbe>,
    pub bus: Arc<dyn HardwareBus>,
    pub attestor: Attestor,
    pub boot: BootConfig,
    pub telemetry_capacity: usize,
    /// Boot must finish within this long or the watchdog reports it frozen.
    pub boot_timeout: Duration,
}

pub struct KernelHandles {
    pub vault: Arc<Vault>,
    pub bus: Arc<dyn HardwareBus>,
    pub interlock: Arc<SafetyInterlock>,
    pub trust: Arc<TrustCell>,
    pub intents: Arc<IntentSlot>,
    pub watchdog: Arc<Watchdog>,
    pub feed: TelemetryFeed,
    boot_manager: BootManager,
    last_boot: RwLock<Option<Arc<BootSequence>>>,
}

impl KernelHandles {
    /// Wire up the kernel.  Returns the handles and the telemetry receiver.
    ///
    /// # Errors
    ///
    /// - [`KernelError::Vault`] – the incident log cannot be opened.
    /// - [`KernelError::InvalidConfig`] – bad trust weights or threshold.
    pub fn assemble(
        parts: KernelParts,
    ) -> Result<(Self, mpsc::Receiver<TelemetryEvent>), KernelError> {
        let (feed, receiver) = TelemetryFeed::new(parts.telemetry_capacity);
        let incidents = Arc::new(IncidentLog::open(parts.vault.incident_log_path())?);
        let interlock = Arc::new(SafetyInterlock::new(
            parts.bus.clone(),
            incidents,
            feed.clone(),
        ));
        let watchdog = Arc::new(Watchdog::new());

        let boot_manager = BootManager::new(
            parts.boot,
            parts.probe,
            parts.vault.clone(),
            parts.attestor,
            feed.clone(),
        )?
        .with_heartbeat(watchdog.register(BOOT_COMPONENT, parts.boot_timeout))
        .with_bus(parts.bus.clone(), PulseCheck::default());

        Ok((
            Self {
                vault: parts.vault,
                bus: parts.bus,
                interlock,
                trust: Arc::new(TrustCell::default()),
                intents: Arc::new(IntentSlot::new()),
                watchdog,
                feed,
                boot_manager,
                last_boot: RwLock::new(None),
            },
            receiver,
        ))
    }

    /// Run the boot state machine and publish its trust descriptor.
    ///
    /// On failure the trust cell is reset to untrusted, so nothing that was
    /// trusted before keeps actuating.
    pub fn bootstrap(&self) -> Result<Arc<BootSequence>, KernelError> {
        let result = self.boot_manager.bootstrap();
        self.watchdog.unregister(BOOT_COMPONENT);

        match result {
            Ok(boot) => {
                let boot = Arc::new(boot);
                self.trust.replace(boot.trust.clone());
                if let Ok(mut last) = self.last_boot.write() {
                    *last = Some(boot.clone());
                }
                Ok(boot)
            }
            Err(e) => {
                error!(error = %e, "Bootstrap failed; trust revoked");
                self.trust.replace(TrustDescriptor::untrusted());
                Err(e)
            }
        }
    }

    /// The most recent successful boot.
    pub fn last_boot(&self) -> Option<Arc<BootSequence>> {
        self.last_boot.read().ok().and_then(|b| b.clone())
    }

    /// Re-attest the running system and swap in the new descriptor.  `None`
    /// before the first successful boot.
    pub fn refresh_trust(&self) -> Option<Arc<TrustDescriptor>> {
        let boot = self.last_boot()?;
        let next = self.boot_manager.reattest(&boot);
        let prev = self.trust.replace(next);
        let current = self.trust.load();
        if current.operation_mode != prev.operation_mode {
            warn!(from = %prev.operation_mode, to = %current.operation_mode, "Operation mode changed");
        } else {
            info!(score = current.score, "Trust refreshed");
        }
        Some(current)
    }

    /// Drop the first-boot marker so the next bootstrap is cold.
    pub fn reprobe(&self) -> Result<(), KernelError> {
        self.boot_manager.reprobe()
    }

    pub fn router(&self, dispatcher: Arc<dyn TaskDispatcher>) -> CommandRouter {
        CommandRouter::new(
            self.trust.clone(),
            self.interlock.clone(),
            dispatcher,
            self.feed.clone(),
        )
    }

    /// An actuator loop registered with the watchdog under
    /// [`ACTUATOR_COMPONENT`].
    pub fn actuator_loop(
        &self,
        config: ActuatorLoopConfig,
        watchdog_timeout: Duration,
    ) -> Result<ActuatorLoop, KernelError> {
        let heartbeat = self.watchdog.register(ACTUATOR_COMPONENT, watchdog_timeout);
        Ok(ActuatorLoop::new(
            config,
            self.bus.clone(),
            self.interlock.clone(),
            self.trust.clone(),
            self.intents.clone(),
            self.feed.clone(),
        )?
        .with_heartbeat(heartbeat))
    }

    /// An interlock poller registered with the watchdog under
    /// [`POLLER_COMPONENT`].
    pub fn interlock_poller(&self, interval: Duration, watchdog_timeout: Duration) -> InterlockPoller {
        InterlockPoller::new(self.interlock.clone(), interval)
            .with_heartbeat(self.watchdog.register(POLLER_COMPONENT, watchdog_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use trustgate_hal::sim::{SimBus, SimHost};
    use trustgate_types::OperationMode;

    struct Fixture {
        _dir: tempfile::TempDir,
        binary: std::path::PathBuf,
        handles: KernelHandles,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("trustgate.bin");
        fs::write(&binary, b"\x7fELF trustgate").unwrap();
        let parts = KernelParts {
            vault: Arc::new(Vault::open(dir.path().join("vault")).unwrap()),
            probe: Arc::new(
                SimHost::new("rover-1")
                    .with_i2c("i2c-1")
                    .with_spi("spidev0.0")
                    .with_battery()
                    .with_actuation()
                    .build(),
            ),
            bus: Arc::new(SimBus::new()),
            attestor: Attestor::new(&binary),
            boot: BootConfig::default(),
            telemetry_capacity: 64,
            boot_timeout: Duration::from_secs(30),
        };
        let (handles, _rx) = KernelHandles::assemble(parts).unwrap();
        Fixture {
            _dir: dir,
            binary,
            handles,
        }
    }

    #[test]
    fn trust_starts_untrusted_and_boot_installs_descriptor() {
        let f = fixture();
        assert_eq!(f.handles.trust.load().operation_mode, OperationMode::ManualOnly);
        assert!(f.handles.last_boot().is_none());

        let boot = f.handles.bootstrap().unwrap();
        assert_eq!(*f.handles.trust.load(), boot.trust);
        assert!(f.handles.watchdog.check_all().is_empty());
    }

    #[test]
    fn failed_boot_revokes_trust() {
        let f = fixture();
        f.handles.bootstrap().unwrap();
        fs::write(&f.binary, b"\x7fELF tampered").unwrap();
        assert!(f.handles.bootstrap().is_err());
        assert_eq!(f.handles.trust.load().operation_mode, OperationMode::ManualOnly);
    }

    #[test]
    fn refresh_trust_applies_runtime_penalty() {
        let f = fixture();
        assert!(f.handles.refresh_trust().is_none());
        f.handles.bootstrap().unwrap();

        fs::write(&f.binary, b"\x7fELF tampered").unwrap();
        let refreshed = f.handles.refresh_trust().unwrap();
        assert_eq!(refreshed.operation_mode, OperationMode::ManualOnly);
        assert_eq!(f.handles.trust.load().operation_mode, OperationMode::ManualOnly);
    }
}
