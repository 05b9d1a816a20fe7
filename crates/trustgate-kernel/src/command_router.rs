//! [`CommandRouter`] – single interception point between task producers and
//! the subsystems that execute them.
//!
//! Every [`Task`] passes through [`CommandRouter::route`], which applies, in
//! order:
//!
//! 1. **Halt bypass**: `EMERGENCY_HALT` skips every other check and goes
//!    straight to [`SafetyInterlock::trigger_emergency_stop`].
//! 2. **Trust gate**: the current [`TrustDescriptor`] must permit the
//!    command's required [`OperationMode`], else
//!    [`KernelError::CommandForbidden`].
//! 3. **Interlock gate**: commands that move the platform need a `CLEAR`
//!    interlock, else [`KernelError::ActuationBlocked`].
//! 4. **Parameter validation**: e.g. coordinates in range, else
//!    [`KernelError::InvalidCommand`].
//!
//! Only then is the task handed to the [`TaskDispatcher`].  Refusals are
//! published to the telemetry feed so they stay observable.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use trustgate_hal::sim::SimBus;
//! use trustgate_kernel::{
//!     CommandRouter, IncidentLog, NullDispatcher, SafetyInterlock, TelemetryFeed, TrustCell,
//! };
//! use trustgate_types::{Command, KernelError, Task};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let interlock = Arc::new(SafetyInterlock::new(
//!     Arc::new(SimBus::new()),
//!     Arc::new(IncidentLog::open(dir.path().join("incidents.jsonl")).unwrap()),
//!     TelemetryFeed::detached(),
//! ));
//! let router = CommandRouter::new(
//!     Arc::new(TrustCell::default()),
//!     interlock.clone(),
//!     Arc::new(NullDispatcher),
//!     TelemetryFeed::detached(),
//! );
//!
//! // Untrusted kernel: navigation is refused...
//! let nav = Task::new(Command::Navigate { lat: 1.0, lng: 2.0 }, 1);
//! assert!(matches!(router.route(&nav), Err(KernelError::CommandForbidden { .. })));
//!
//! // ...but a halt always lands.
//! let halt = Task::new(Command::EmergencyHalt { reason: "operator".into() }, 9);
//! assert!(router.route(&halt).is_ok());
//! assert!(!interlock.is_clear());
//! ```

use std::sync::Arc;

use tracing::{debug, info, warn};
use trustgate_types::{Command, KernelError, OperationMode, Task, TrustDescriptor};

use crate::interlock::SafetyInterlock;
use crate::telemetry_feed::{TelemetryEvent, TelemetryFeed};
use crate::trust_evaluator::TrustCell;

/// Executes tasks that passed the router's gates.
pub trait TaskDispatcher: Send + Sync {
    fn dispatch(&self, task: &Task) -> Result<(), KernelError>;
}

/// Accepts everything and does nothing.  For nodes with no executor wired in.
pub struct NullDispatcher;

impl TaskDispatcher for NullDispatcher {
    fn dispatch(&self, task: &Task) -> Result<(), KernelError> {
        debug!(task = %task.id, kind = task.command.kind(), "No dispatcher attached");
        Ok(())
    }
}

/// What happened to an accepted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Dispatched,
    /// The emergency stop sequence ran.
    Halted,
}

pub struct CommandRouter {
    trust: Arc<TrustCell>,
    interlock: Arc<SafetyInterlock>,
    dispatcher: Arc<dyn TaskDispatcher>,
    feed: TelemetryFeed,
}

impl CommandRouter {
    pub fn new(
        trust: Arc<TrustCell>,
        interlock: Arc<SafetyInterlock>,
        dispatcher: Arc<dyn TaskDispatcher>,
        feed: TelemetryFeed,
    ) -> Self {
        Self {
            trust,
            interlock,
            dispatcher,
            feed,
        }
    }

    /// Gate and dispatch one task.
    ///
    /// # Errors
    ///
    /// - [`KernelError::CommandForbidden`] – trust mode below the requirement.
    /// - [`KernelError::ActuationBlocked`] – actuating command while the
    ///   interlock is not `CLEAR`.
    /// - [`KernelError::InvalidCommand`] – parameters out of range.
    /// - Whatever the dispatcher or the emergency stop sequence reports.
    pub fn route(&self, task: &Task) -> Result<RouteOutcome, KernelError> {
        if let Command::EmergencyHalt { reason } = &task.command {
            info!(task = %task.id, reason, "EMERGENCY_HALT received");
            self.interlock.trigger_emergency_stop("router", reason)?;
            return Ok(RouteOutcome::Halted);
        }

        let result = self.check(task).and_then(|()| self.dispatcher.dispatch(task));
        match result {
            Ok(()) => {
                debug!(task = %task.id, kind = task.command.kind(), "Task dispatched");
                if let Command::Navigate { lat, lng } = &task.command {
                    self.feed.publish(TelemetryEvent::Spatial {
                        lat: *lat,
                        lng: *lng,
                    });
                }
                Ok(RouteOutcome::Dispatched)
            }
            Err(e) => {
                warn!(task = %task.id, kind = task.command.kind(), error = %e, "Task refused");
                self.feed.publish(TelemetryEvent::Denied {
                    subject: task.command.kind().to_string(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Parse a JSON envelope and route it.
    pub fn route_json(&self, raw: &str) -> Result<RouteOutcome, KernelError> {
        match Task::from_json(raw) {
            Ok(task) => self.route(&task),
            Err(e) => {
                self.feed.publish(TelemetryEvent::Denied {
                    subject: "task".to_string(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Route a batch, highest priority first.  Equal priorities keep their
    /// creation order.
    pub fn route_all(&self, mut tasks: Vec<Task>) -> Vec<(Task, Result<RouteOutcome, KernelError>)> {
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        tasks
            .into_iter()
            .map(|task| {
                let result = self.route(&task);
                (task, result)
            })
            .collect()
    }

    fn check(&self, task: &Task) -> Result<(), KernelError> {
        if let Some(required) = task.command.required_mode() {
            let trust = self.trust.load();
            Self::check_mode(&task.command, required, &trust)?;
        }
        if task.command.actuates() {
            self.interlock.check_actuation()?;
        }
        Self::validate(&task.command)
    }

    fn check_mode(
        command: &Command,
        required: OperationMode,
        trust: &TrustDescriptor,
    ) -> Result<(), KernelError> {
        if trust.permits(required) {
            Ok(())
        } else {
            Err(KernelError::CommandForbidden {
                command: command.kind().to_string(),
                required,
                mode: trust.operation_mode,
            })
        }
    }

    fn validate(command: &Command) -> Result<(), KernelError> {
        match command {
            Command::Navigate { lat, lng } => {
                if !(-90.0..=90.0).contains(lat) || !(-180.0..=180.0).contains(lng) {
                    return Err(KernelError::InvalidCommand(format!(
                        "coordinates out of range: lat={lat} lng={lng}"
                    )));
                }
            }
            Command::PerceptionScan { sensor } if sensor.trim().is_empty() => {
                return Err(KernelError::InvalidCommand("empty sensor id".to_string()));
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use trustgate_hal::sim::SimBus;
    use trustgate_types::{InterlockState, Q16};

    use crate::incident_log::IncidentLog;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl TaskDispatcher for Recorder {
        fn dispatch(&self, task: &Task) -> Result<(), KernelError> {
            self.0.lock().unwrap().push(task.command.kind().to_string());
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        bus: Arc<SimBus>,
        trust: Arc<TrustCell>,
        interlock: Arc<SafetyInterlock>,
        recorder: Arc<Recorder>,
        router: CommandRouter,
    }

    fn descriptor(mode: OperationMode) -> TrustDescriptor {
        TrustDescriptor {
            score: 0.95,
            raw_score_q16: Q16::from_float(0.95),
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
        let trust = Arc::new(TrustCell::new(descriptor(mode)));
        let recorder = Arc::new(Recorder::default());
        let router = CommandRouter::new(
            trust.clone(),
            interlock.clone(),
            recorder.clone(),
            TelemetryFeed::detached(),
        );
        Fixture {
            _dir: dir,
            bus,
            trust,
            interlock,
            recorder,
            router,
        }
    }

    fn navigate() -> Task {
        Task::new(Command::Navigate { lat: 48.1, lng: 11.6 }, 1)
    }

    #[test]
    fn autonomous_kernel_dispatches_navigation() {
        let f = fixture(OperationMode::Autonomous);
        assert_eq!(f.router.route(&navigate()).unwrap(), RouteOutcome::Dispatched);
        assert_eq!(*f.recorder.0.lock().unwrap(), vec!["NAVIGATE"]);
    }

    #[test]
    fn assisted_kernel_accepts_navigation_and_scan() {
        let f = fixture(OperationMode::Assisted);
        assert_eq!(f.router.route(&navigate()).unwrap(), RouteOutcome::Dispatched);
        let scan = Task::new(Command::PerceptionScan { sensor: "lidar0".into() }, 1);
        assert!(f.router.route(&scan).is_ok());
        assert_eq!(
            *f.recorder.0.lock().unwrap(),
            vec!["NAVIGATE", "PERCEPTION_SCAN"]
        );
    }

    #[test]
    fn manual_only_refuses_everything_but_halt() {
        let f = fixture(OperationMode::ManualOnly);
        assert!(f.router.route(&Task::new(Command::DataSync, 1)).is_err());
        let halt = Task::new(Command::EmergencyHalt { reason: "button".into() }, 1);
        assert_eq!(f.router.route(&halt).unwrap(), RouteOutcome::Halted);
        assert_eq!(f.interlock.state(), InterlockState::EStop);
        assert_eq!(f.bus.safe_state_count(), 1);
        assert!(f.recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn trust_is_checked_before_interlock() {
        let f = fixture(OperationMode::ManualOnly);
        f.interlock.escalate(InterlockState::Obstruction, "pallet");
        assert!(matches!(
            f.router.route(&navigate()),
            Err(KernelError::CommandForbidden { .. })
        ));
    }

    #[test]
    fn blocked_interlock_refuses_motion_only() {
        let f = fixture(OperationMode::Autonomous);
        f.interlock.escalate(InterlockState::Warning, "door open");
        assert!(matches!(
            f.router.route(&navigate()),
            Err(KernelError::ActuationBlocked { state: InterlockState::Warning })
        ));
        assert!(f.router.route(&Task::new(Command::DataSync, 1)).is_ok());
    }

    #[test]
    fn out_of_range_coordinates_are_invalid() {
        let f = fixture(OperationMode::Autonomous);
        let bad = Task::new(Command::Navigate { lat: 91.0, lng: 0.0 }, 1);
        assert!(matches!(f.router.route(&bad), Err(KernelError::InvalidCommand(_))));
        let nan = Task::new(Command::Navigate { lat: f64::NAN, lng: 0.0 }, 1);
        assert!(matches!(f.router.route(&nan), Err(KernelError::InvalidCommand(_))));
    }

    #[test]
    fn trust_replacement_takes_effect_on_next_route() {
        let f = fixture(OperationMode::ManualOnly);
        assert_eq!(
            f.router.route(&navigate()).unwrap_err(),
            KernelError::CommandForbidden {
                command: "NAVIGATE".into(),
                required: OperationMode::Assisted,
                mode: OperationMode::ManualOnly,
            }
        );
        f.trust.replace(descriptor(OperationMode::Assisted));
        assert!(f.router.route(&navigate()).is_ok());
    }

    #[test]
    fn json_ingress_reports_unknown_types() {
        let f = fixture(OperationMode::Autonomous);
        assert!(matches!(
            f.router.route_json(r#"{"type":"SELF_DESTRUCT"}"#),
            Err(KernelError::UnknownCommand(_))
        ));
        assert_eq!(
            f.router.route_json(r#"{"type":"EMERGENCY_HALT"}"#).unwrap(),
            RouteOutcome::Halted
        );
    }

    #[test]
    fn batch_runs_highest_priority_first() {
        let f = fixture(OperationMode::Autonomous);
        let low = Task::new(Command::DataSync, 1);
        let high = Task::new(Command::PerceptionScan { sensor: "cam".into() }, 7);
        let results = f.router.route_all(vec![low, high]);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(
            *f.recorder.0.lock().unwrap(),
            vec!["PERCEPTION_SCAN", "DATA_SYNC"]
        );
    }

    #[test]
    fn dispatched_goal_is_published() {
        let (feed, mut rx) = TelemetryFeed::new(8);
        let f = fixture(OperationMode::Assisted);
        let router = CommandRouter::new(
            f.trust.clone(),
            f.interlock.clone(),
            Arc::new(NullDispatcher),
            feed,
        );
        router.route(&navigate()).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            TelemetryEvent::Spatial { lat: 48.1, lng: 11.6 }
        );
        router.route(&Task::new(Command::DataSync, 1)).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn refusals_are_published() {
        let (feed, mut rx) = TelemetryFeed::new(8);
        let f = fixture(OperationMode::ManualOnly);
        let router = CommandRouter::new(
            f.trust.clone(),
            f.interlock.clone(),
            Arc::new(NullDispatcher),
            feed,
        );
        assert!(router.route(&navigate()).is_err());
        match rx.try_recv().unwrap() {
            TelemetryEvent::Denied { subject, .. } => assert_eq!(subject, "NAVIGATE"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
