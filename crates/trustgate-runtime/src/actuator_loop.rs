//! [`ActuatorLoop`] – fixed-frequency, level-triggered actuation.
//!
//! Each tick:
//!
//! 1. **Interlock** – anything but `CLEAR` writes the safe state and ends the
//!    tick.  This check is always first.
//! 2. **Power** – the trust mode's [`PowerState`] must be `ACTUATORS_ON`,
//!    which only `AUTONOMOUS` grants.  `ASSISTED` (sensors only) and
//!    `MANUAL_ONLY` (isolated) write the safe state.  The descriptor is read
//!    with [`TrustCell::try_load`]; if a writer is mid-swap the previous
//!    tick's descriptor is reused, so the loop never blocks on it.
//! 3. **Intent** – the newest value in the [`IntentSlot`], neutral if none.
//! 4. **Translate & write** – clamp, convert to bytes, write to the bus.
//!
//! Nothing is queued or retried.  A missed tick is simply a missed update.
//!
//! # Example
//!
//! ```
//! use trustgate_runtime::actuator_loop::translate;
//! use trustgate_types::Intent;
//!
//! let cmd = translate(Intent::new(1.0, -1.0));
//! assert_eq!(cmd.payload, vec![255, 0]);
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use trustgate_hal::HardwareBus;
use trustgate_kernel::{Heartbeat, SafetyInterlock, TelemetryEvent, TelemetryFeed, TrustCell};
use trustgate_types::{Intent, KernelError, OperationMode, PowerState, RawCommand, TrustDescriptor};

use crate::intent_slot::IntentSlot;

pub const DEFAULT_LOOP_HZ: u32 = 100;
/// Command id of the drive packet `[throttle, steer]`.
pub const DRIVE_COMMAND_ID: u32 = 0x01;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorLoopConfig {
    pub hz: u32,
}

impl Default for ActuatorLoopConfig {
    fn default() -> Self {
        Self {
            hz: DEFAULT_LOOP_HZ,
        }
    }
}

impl ActuatorLoopConfig {
    /// # Errors
    ///
    /// [`KernelError::InvalidConfig`] when `hz` is zero.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.hz == 0 {
            return Err(KernelError::InvalidConfig(
                "actuator loop frequency must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.hz.max(1)))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Translation
// ────────────────────────────────────────────────────────────────────────────

/// Clamp `intent` and convert it to a drive packet.
///
/// `throttle_byte = round(throttle · 255)`, `steer_byte = round((steer + 1) · 127.5)`.
/// Centre steering rounds half away from zero to 128.
pub fn translate(intent: Intent) -> RawCommand {
    let i = intent.clamped();
    let throttle = (i.throttle * 255.0).round() as u8;
    let steer = ((i.steer + 1.0) * 127.5).round() as u8;
    RawCommand {
        id: DRIVE_COMMAND_ID,
        payload: vec![throttle, steer],
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Loop
// ────────────────────────────────────────────────────────────────────────────

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// A drive packet reached the bus.
    Actuated(RawCommand),
    /// The safe state was written instead, for this reason.
    Neutralised(KernelError),
}

pub struct ActuatorLoop {
    config: ActuatorLoopConfig,
    bus: Arc<dyn HardwareBus>,
    interlock: Arc<SafetyInterlock>,
    trust: Arc<TrustCell>,
    intents: Arc<IntentSlot>,
    feed: TelemetryFeed,
    heartbeat: Option<Heartbeat>,
    last_trust: Arc<TrustDescriptor>,
    power: PowerState,
    /// Reason last published, so a steady denial is reported once.
    last_denial: Option<String>,
    overruns: u64,
}

impl ActuatorLoop {
    /// # Errors
    ///
    /// [`KernelError::InvalidConfig`] for a zero frequency.
    pub fn new(
        config: ActuatorLoopConfig,
        bus: Arc<dyn HardwareBus>,
        interlock: Arc<SafetyInterlock>,
        trust: Arc<TrustCell>,
        intents: Arc<IntentSlot>,
        feed: TelemetryFeed,
    ) -> Result<Self, KernelError> {
        config.validate()?;
        let last_trust = trust.load();
        let power = last_trust.operation_mode.power_state();
        Ok(Self {
            config,
            bus,
            interlock,
            trust,
            intents,
            feed,
            heartbeat: None,
            last_trust,
            power,
            last_denial: None,
            overruns: 0,
        })
    }

    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Run one control cycle.
    pub fn tick(&mut self) -> TickOutcome {
        if let Err(blocked) = self.interlock.check_actuation() {
            return self.neutralise(blocked);
        }

        if let Some(current) = self.trust.try_load() {
            self.last_trust = current;
        }
        let mode = self.last_trust.operation_mode;
        self.sync_power(mode);
        if !self.power.drives_actuators() {
            return self.neutralise(KernelError::CommandForbidden {
                command: "DRIVE".to_string(),
                required: OperationMode::Autonomous,
                mode,
            });
        }

        let cmd = translate(self.intents.load());
        if let Err(e) = self.bus.write(cmd.clone()) {
            return self.neutralise(e);
        }
        // An emergency stop may have landed between the check and the write.
        if let Err(blocked) = self.interlock.check_actuation() {
            return self.neutralise(blocked);
        }

        if self.last_denial.take().is_some() {
            info!("Actuation resumed");
        }
        TickOutcome::Actuated(cmd)
    }

    /// Tick at the configured rate until `shutdown` is set, then write the
    /// safe state as the final action.
    pub fn run(mut self, shutdown: &AtomicBool) {
        let period = self.config.period();
        info!(hz = self.config.hz, "Actuator loop started");

        let mut next = Instant::now();
        while !shutdown.load(Ordering::Acquire) {
            self.tick();
            if let Some(hb) = &self.heartbeat {
                hb.beat();
            }

            next += period;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                // Behind schedule: skip the missed ticks instead of bursting.
                self.overruns += 1;
                next = now;
            }
        }

        if let Err(e) = self.bus.write_safe_state() {
            warn!(error = %e, "Final safe-state write failed");
        }
        info!(overruns = self.overruns, "Actuator loop stopped; actuators neutral");
    }

    /// Run on a dedicated thread named `actuator-loop`.
    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("actuator-loop".to_string())
            .spawn(move || self.run(&shutdown))
    }

    pub fn power_state(&self) -> PowerState {
        self.power
    }

    fn sync_power(&mut self, mode: OperationMode) {
        let target = mode.power_state();
        if self.power != target {
            warn!(from = %self.power, to = %target, %mode, "Actuation power transition");
            self.power = target;
            self.feed.publish(TelemetryEvent::Power {
                state: target,
                mode,
            });
        }
    }

    fn neutralise(&mut self, reason: KernelError) -> TickOutcome {
        let write = self.bus.write_safe_state();

        let text = reason.to_string();
        if self.last_denial.as_deref() != Some(text.as_str()) {
            debug!(reason = %text, "Actuation denied");
            if let Err(e) = &write {
                warn!(error = %e, "Safe-state write failed");
            }
            self.feed.publish(TelemetryEvent::Denied {
                subject: "actuation".to_string(),
                reason: text.clone(),
            });
            self.last_denial = Some(text);
        }
        TickOutcome::Neutralised(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustgate_hal::sim::{BusEvent, SimBus};
    use trustgate_kernel::IncidentLog;
    use trustgate_types::{InterlockState, Q16};

    struct Fixture {
        _dir: tempfile::TempDir,
        bus: Arc<SimBus>,
        interlock: Arc<SafetyInterlock>,
        trust: Arc<TrustCell>,
        intents: Arc<IntentSlot>,
    }

    fn descriptor(mode: OperationMode) -> TrustDescriptor {
        TrustDescriptor {
            score: 0.8,
            raw_score_q16: Q16::from_float(0.8),
            label: mode.label(),
            operation_mode: mode,
            factors: Vec::new(),
            downgraded_by: None,
        }
    }

    fn fixture(mode: OperationMode) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(SimBus::new());
        let interlock = Arc::new(SafetyInterlock::new(
            bus.clone(),
            Arc::new(IncidentLog::open(dir.path().join("incidents.jsonl")).unwrap()),
            TelemetryFeed::detached(),
        ));
        Fixture {
            _dir: dir,
            bus,
            interlock,
            trust: Arc::new(TrustCell::new(descriptor(mode))),
            intents: Arc::new(IntentSlot::new()),
        }
    }

    fn actuator(f: &Fixture, feed: TelemetryFeed) -> ActuatorLoop {
        ActuatorLoop::new(
            ActuatorLoopConfig::default(),
            f.bus.clone(),
            f.interlock.clone(),
            f.trust.clone(),
            f.intents.clone(),
            feed,
        )
        .unwrap()
    }

    #[test]
    fn translation_boundaries() {
        assert_eq!(translate(Intent::new(0.0, -1.0)).payload, vec![0, 0]);
        assert_eq!(translate(Intent::new(0.0, 0.0)).payload, vec![0, 128]);
        assert_eq!(translate(Intent::new(1.0, 1.0)).payload, vec![255, 255]);
        assert_eq!(translate(Intent::new(0.5, 0.0)).payload, vec![128, 128]);
        assert_eq!(translate(Intent::new(7.0, -9.0)).payload, vec![255, 0]);
        assert_eq!(translate(Intent::new(f32::NAN, f32::NAN)).payload, vec![0, 128]);
    }

    #[test]
    fn clear_interlock_drives_latest_intent() {
        let f = fixture(OperationMode::Autonomous);
        let mut al = actuator(&f, TelemetryFeed::detached());
        f.intents.store(Intent::new(1.0, -1.0));
        let cmd = RawCommand {
            id: DRIVE_COMMAND_ID,
            payload: vec![255, 0],
        };
        assert_eq!(al.tick(), TickOutcome::Actuated(cmd.clone()));
        assert_eq!(f.bus.last_write(), Some(cmd));
    }

    #[test]
    fn unset_intent_is_neutral() {
        let f = fixture(OperationMode::Autonomous);
        let mut al = actuator(&f, TelemetryFeed::detached());
        al.tick();
        assert_eq!(f.bus.last_write().unwrap().payload, vec![0, 128]);
    }

    #[test]
    fn non_clear_interlock_only_writes_safe_state() {
        for state in [
            InterlockState::Warning,
            InterlockState::Obstruction,
            InterlockState::EStop,
        ] {
            let f = fixture(OperationMode::Autonomous);
            let mut al = actuator(&f, TelemetryFeed::detached());
            f.intents.store(Intent::new(0.8, 0.2));
            f.interlock.escalate(state, "test");
            f.bus.clear();

            for _ in 0..5 {
                assert!(matches!(
                    al.tick(),
                    TickOutcome::Neutralised(KernelError::ActuationBlocked { .. })
                ));
            }
            assert!(f.bus.writes().is_empty(), "{state} let a write through");
            assert_eq!(f.bus.safe_state_count(), 5);
        }
    }

    #[test]
    fn only_autonomous_trust_powers_the_bus() {
        let f = fixture(OperationMode::ManualOnly);
        let mut al = actuator(&f, TelemetryFeed::detached());
        f.intents.store(Intent::new(0.5, 0.0));
        assert_eq!(al.power_state(), PowerState::Isolated);
        assert!(matches!(
            al.tick(),
            TickOutcome::Neutralised(KernelError::CommandForbidden { .. })
        ));

        f.trust.replace(descriptor(OperationMode::Assisted));
        assert_eq!(
            al.tick(),
            TickOutcome::Neutralised(KernelError::CommandForbidden {
                command: "DRIVE".into(),
                required: OperationMode::Autonomous,
                mode: OperationMode::Assisted,
            })
        );
        assert_eq!(al.power_state(), PowerState::SensorsOnly);
        assert!(f.bus.writes().is_empty());
        assert_eq!(f.bus.safe_state_count(), 2);

        f.trust.replace(descriptor(OperationMode::Autonomous));
        assert!(matches!(al.tick(), TickOutcome::Actuated(_)));
        assert_eq!(al.power_state(), PowerState::ActuatorsOn);

        // Losing trust mid-run cuts power on the next tick.
        f.trust.replace(descriptor(OperationMode::Assisted));
        assert!(matches!(al.tick(), TickOutcome::Neutralised(_)));
        assert_eq!(f.bus.events().last(), Some(&BusEvent::SafeState));
    }

    #[test]
    fn power_transitions_are_published() {
        let f = fixture(OperationMode::ManualOnly);
        let (feed, mut rx) = TelemetryFeed::new(16);
        let mut al = actuator(&f, feed);
        al.tick();
        f.trust.replace(descriptor(OperationMode::Autonomous));
        al.tick();
        al.tick();

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TelemetryEvent::Power { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(states, vec![PowerState::ActuatorsOn]);
    }

    #[test]
    fn bus_fault_falls_back_to_safe_state() {
        let f = fixture(OperationMode::Autonomous);
        let mut al = actuator(&f, TelemetryFeed::detached());
        f.bus.set_fail_writes(true);
        assert!(matches!(
            al.tick(),
            TickOutcome::Neutralised(KernelError::HardwareFault { .. })
        ));
        assert_eq!(f.bus.events().last(), Some(&BusEvent::SafeState));
    }

    #[test]
    fn steady_denial_is_published_once() {
        let f = fixture(OperationMode::Autonomous);
        let (feed, mut rx) = TelemetryFeed::new(16);
        let mut al = actuator(&f, feed);
        f.interlock.escalate(InterlockState::Obstruction, "crate");
        for _ in 0..10 {
            al.tick();
        }
        let mut denials = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, TelemetryEvent::Denied { .. }) {
                denials += 1;
            }
        }
        assert_eq!(denials, 1);
    }

    #[test]
    fn zero_hz_is_rejected() {
        let f = fixture(OperationMode::Autonomous);
        let result = ActuatorLoop::new(
            ActuatorLoopConfig { hz: 0 },
            f.bus.clone(),
            f.interlock.clone(),
            f.trust.clone(),
            f.intents.clone(),
            TelemetryFeed::detached(),
        );
        assert!(matches!(result, Err(KernelError::InvalidConfig(_))));
    }

    #[test]
    fn shutdown_ends_with_safe_state() {
        let f = fixture(OperationMode::Autonomous);
        f.intents.store(Intent::new(0.4, 0.0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = actuator(&f, TelemetryFeed::detached())
            .spawn(shutdown.clone())
            .unwrap();
        thread::sleep(Duration::from_millis(60));
        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();

        assert!(!f.bus.writes().is_empty());
        assert_eq!(f.bus.events().last(), Some(&BusEvent::SafeState));
    }
}
