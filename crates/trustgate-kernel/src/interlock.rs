//! [`SafetyInterlock`] – lock-free, escalate-only kill switch.
//!
//! The state lives in a single `AtomicU8` and only ever moves towards more
//! severe values (`fetch_max`).  `WARNING` and `OBSTRUCTION` can be cleared
//! by an explicit [`SafetyInterlock::acknowledge`]; `E_STOP` is latched for
//! the life of the process.
//!
//! [`SafetyInterlock::trigger_emergency_stop`] runs, in order:
//!
//! 1. atomically set `E_STOP`, which blocks every later actuation tick;
//! 2. durably record the reason in the incident log (first trigger only);
//! 3. command the bus to its safe state.
//!
//! Concurrent triggers race on step 1; exactly one of them observes the
//! previous non-`E_STOP` value and writes the incident record.  Every
//! trigger still writes the safe state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{error, info, warn};
use trustgate_hal::{HardwareBus, SafetyInput};
use trustgate_types::{InterlockState, KernelError};

use crate::incident_log::IncidentLog;
use crate::telemetry_feed::{TelemetryEvent, TelemetryFeed};

pub struct SafetyInterlock {
    state: AtomicU8,
    bus: Arc<dyn HardwareBus>,
    incidents: Arc<IncidentLog>,
    feed: TelemetryFeed,
}

impl SafetyInterlock {
    pub fn new(bus: Arc<dyn HardwareBus>, incidents: Arc<IncidentLog>, feed: TelemetryFeed) -> Self {
        Self {
            state: AtomicU8::new(InterlockState::Clear.as_u8()),
            bus,
            incidents,
            feed,
        }
    }

    /// Current state.  Never blocks.
    pub fn state(&self) -> InterlockState {
        InterlockState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_clear(&self) -> bool {
        self.state().is_clear()
    }

    /// # Errors
    ///
    /// [`KernelError::ActuationBlocked`] when the state is not `CLEAR`.
    pub fn check_actuation(&self) -> Result<(), KernelError> {
        match self.state() {
            InterlockState::Clear => Ok(()),
            state => Err(KernelError::ActuationBlocked { state }),
        }
    }

    /// Short operator-facing description.
    pub fn status_label(&self) -> &'static str {
        match self.state() {
            InterlockState::Clear => "SYSTEM NOMINAL",
            InterlockState::Warning => "CAUTION: SAFETY WARNING",
            InterlockState::Obstruction => "HALTED: OBSTRUCTION DETECTED",
            InterlockState::EStop => "EMERGENCY STOP ENGAGED",
        }
    }

    /// Raise the state to at least `to`.  Returns the previous state.
    /// Escalating to `E_STOP` runs the full emergency-stop sequence.
    pub fn escalate(&self, to: InterlockState, reason: &str) -> InterlockState {
        if to == InterlockState::EStop {
            let (prev, result) = self.latch_estop("interlock", reason);
            if let Err(e) = result {
                error!(error = %e, "Emergency stop sequence reported a failure");
            }
            return prev;
        }
        let prev = InterlockState::from_u8(self.state.fetch_max(to.as_u8(), Ordering::AcqRel));
        if to > prev {
            warn!(from = %prev, to = %to, reason, "Interlock escalated");
            self.feed.publish(TelemetryEvent::Interlock {
                state: to,
                reason: reason.to_string(),
            });
        }
        prev
    }

    /// Latch `E_STOP`, record why, and neutralise the actuators.
    ///
    /// The safe-state write happens even when the incident record fails; the
    /// first error encountered is returned afterwards.
    pub fn trigger_emergency_stop(&self, source: &str, reason: &str) -> Result<(), KernelError> {
        self.latch_estop(source, reason).1
    }

    /// The emergency-stop sequence.  The returned state is the one `fetch_max`
    /// replaced, so exactly one concurrent caller sees a non-`E_STOP` value.
    fn latch_estop(&self, source: &str, reason: &str) -> (InterlockState, Result<(), KernelError>) {
        let prev = InterlockState::from_u8(
            self.state
                .fetch_max(InterlockState::EStop.as_u8(), Ordering::AcqRel),
        );

        let mut first_err = None;
        if prev != InterlockState::EStop {
            error!(source, reason, "CRITICAL_SAFETY_INTERVENTION");
            if let Err(e) = self.incidents.record(source, reason) {
                error!(error = %e, "Failed to persist incident record");
                first_err = Some(e);
            }
            self.feed.publish(TelemetryEvent::Interlock {
                state: InterlockState::EStop,
                reason: reason.to_string(),
            });
        }

        if let Err(e) = self.bus.write_safe_state() {
            error!(error = %e, "Safe-state write failed during emergency stop");
            first_err.get_or_insert(e);
        }

        let result = match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        };
        (prev, result)
    }

    /// Clear `WARNING` or `OBSTRUCTION` after an operator has inspected the
    /// cause.
    ///
    /// # Errors
    ///
    /// [`KernelError::ActuationBlocked`] when the interlock is in `E_STOP`,
    /// which has no software clear path.
    pub fn acknowledge(&self) -> Result<(), KernelError> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match InterlockState::from_u8(current) {
                InterlockState::Clear => return Ok(()),
                InterlockState::EStop => {
                    return Err(KernelError::ActuationBlocked {
                        state: InterlockState::EStop,
                    });
                }
                _ => {}
            }
            match self.state.compare_exchange(
                current,
                InterlockState::Clear.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    info!(from = %InterlockState::from_u8(current), "Interlock acknowledged");
                    self.feed.publish(TelemetryEvent::Interlock {
                        state: InterlockState::Clear,
                        reason: "operator acknowledged".to_string(),
                    });
                    return Ok(());
                }
                // Lost a race with an escalation; re-evaluate.
                Err(actual) => current = actual,
            }
        }
    }

    /// One hardware poll.  Only ever escalates; a read failure counts as a
    /// warning.
    pub fn poll(&self, input: &dyn SafetyInput) {
        match input.read() {
            Ok(InterlockState::Clear) => {}
            Ok(InterlockState::EStop) => {
                let reason = format!("hardware e-stop on {}", input.id());
                if let Err(e) = self.trigger_emergency_stop("interlock_poll", &reason) {
                    error!(error = %e, "Emergency stop sequence reported a failure");
                }
            }
            Ok(state) => {
                self.escalate(state, &format!("{} reported {state}", input.id()));
            }
            Err(e) => {
                self.escalate(
                    InterlockState::Warning,
                    &format!("{} unreadable: {e}", input.id()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use trustgate_hal::sim::{SimBus, SimSafetyInput};

    struct Fixture {
        dir: tempfile::TempDir,
        bus: Arc<SimBus>,
        interlock: Arc<SafetyInterlock>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(SimBus::new());
        let log = Arc::new(IncidentLog::open(dir.path().join("incidents.jsonl")).unwrap());
        let interlock = Arc::new(SafetyInterlock::new(
            bus.clone(),
            log,
            TelemetryFeed::detached(),
        ));
        Fixture { dir, bus, interlock }
    }

    fn incidents(f: &Fixture) -> usize {
        IncidentLog::read_all(f.dir.path().join("incidents.jsonl"))
            .unwrap()
            .len()
    }

    #[test]
    fn starts_clear() {
        let f = fixture();
        assert_eq!(f.interlock.state(), InterlockState::Clear);
        assert!(f.interlock.check_actuation().is_ok());
        assert_eq!(f.interlock.status_label(), "SYSTEM NOMINAL");
    }

    #[test]
    fn escalation_never_lowers_state() {
        let f = fixture();
        f.interlock.escalate(InterlockState::Obstruction, "lidar");
        f.interlock.escalate(InterlockState::Warning, "late warning");
        assert_eq!(f.interlock.state(), InterlockState::Obstruction);
        assert!(matches!(
            f.interlock.check_actuation(),
            Err(KernelError::ActuationBlocked { state: InterlockState::Obstruction })
        ));
    }

    #[test]
    fn emergency_stop_records_then_neutralises() {
        let f = fixture();
        f.interlock.trigger_emergency_stop("router", "EMERGENCY_HALT").unwrap();
        assert_eq!(f.interlock.state(), InterlockState::EStop);
        assert_eq!(incidents(&f), 1);
        assert_eq!(f.bus.safe_state_count(), 1);
        assert!(f.bus.writes().is_empty());
    }

    #[test]
    fn estop_is_latched() {
        let f = fixture();
        f.interlock.trigger_emergency_stop("test", "latch").unwrap();
        assert!(f.interlock.acknowledge().is_err());
        f.interlock.escalate(InterlockState::Warning, "noise");
        f.interlock.poll(&SimSafetyInput::new("pin"));
        assert_eq!(f.interlock.state(), InterlockState::EStop);
    }

    #[test]
    fn acknowledge_clears_warning_and_obstruction() {
        let f = fixture();
        f.interlock.escalate(InterlockState::Obstruction, "box in path");
        f.interlock.acknowledge().unwrap();
        assert_eq!(f.interlock.state(), InterlockState::Clear);
        // Acknowledging a clear interlock is a no-op.
        f.interlock.acknowledge().unwrap();
    }

    #[test]
    fn repeated_stop_writes_safe_state_but_one_incident() {
        let f = fixture();
        f.interlock.trigger_emergency_stop("a", "first").unwrap();
        f.interlock.trigger_emergency_stop("b", "second").unwrap();
        assert_eq!(incidents(&f), 1);
        assert_eq!(f.bus.safe_state_count(), 2);
    }

    #[test]
    fn concurrent_stops_record_exactly_one_incident() {
        for _ in 0..20 {
            let f = fixture();
            let handles: Vec<_> = (0..2)
                .map(|i| {
                    let il = f.interlock.clone();
                    thread::spawn(move || {
                        il.trigger_emergency_stop("race", &format!("thread {i}")).unwrap();
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(f.interlock.state(), InterlockState::EStop);
            assert_eq!(incidents(&f), 1);
            assert_eq!(f.bus.safe_state_count(), 2);
        }
    }

    #[test]
    fn poll_maps_hardware_inputs() {
        let f = fixture();
        let pin = SimSafetyInput::new("estop_pin");
        f.interlock.poll(&pin);
        assert!(f.interlock.is_clear());

        pin.set_fail(true);
        f.interlock.poll(&pin);
        assert_eq!(f.interlock.state(), InterlockState::Warning);

        pin.set_fail(false);
        pin.set(InterlockState::Obstruction);
        f.interlock.poll(&pin);
        assert_eq!(f.interlock.state(), InterlockState::Obstruction);

        // The pin returning to clear does not clear the interlock.
        pin.set(InterlockState::Clear);
        f.interlock.poll(&pin);
        assert_eq!(f.interlock.state(), InterlockState::Obstruction);

        pin.set(InterlockState::EStop);
        f.interlock.poll(&pin);
        assert_eq!(f.interlock.state(), InterlockState::EStop);
        assert_eq!(incidents(&f), 1);
    }

    #[test]
    fn escalate_to_estop_runs_full_sequence() {
        let f = fixture();
        let prev = f.interlock.escalate(InterlockState::EStop, "watchdog");
        assert_eq!(prev, InterlockState::Clear);
        assert_eq!(incidents(&f), 1);
        assert_eq!(f.bus.safe_state_count(), 1);

        let prev = f.interlock.escalate(InterlockState::EStop, "again");
        assert_eq!(prev, InterlockState::EStop);
    }

    #[test]
    fn racing_escalations_report_one_transition() {
        for _ in 0..20 {
            let f = fixture();
            f.interlock.escalate(InterlockState::Obstruction, "pallet");
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let il = f.interlock.clone();
                    thread::spawn(move || il.escalate(InterlockState::EStop, &format!("thread {i}")))
                })
                .collect();
            let prevs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(
                prevs.iter().filter(|p| **p == InterlockState::Obstruction).count(),
                1,
                "{prevs:?}"
            );
            assert!(prevs.iter().all(|p| matches!(p, InterlockState::Obstruction | InterlockState::EStop)));
            assert_eq!(incidents(&f), 1);
        }
    }
}
