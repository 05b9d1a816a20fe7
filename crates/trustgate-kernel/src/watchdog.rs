//! [`Watchdog`] – component health monitor.
//!
//! Every execution context (actuator loop, interlock poller, boot sequence)
//! registers with a deadline and beats through a [`Heartbeat`] handle.  A
//! beat is a single atomic store, so the real-time loop can call it every
//! tick without taking a lock.
//!
//! Call [`Watchdog::check_all`] from a supervisor to list frozen components,
//! or [`Watchdog::supervise`] to apply a [`FailurePolicy`] in one step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::interlock::SafetyInterlock;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Health state reported for a single component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentHealth {
    /// The component has sent a heartbeat within its deadline.
    Healthy,
    /// The component has not sent a heartbeat within its deadline.
    TimedOut,
}

/// What the supervisor does once a component freezes.  Every policy first
/// forces an emergency stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stay up with actuators latched safe.
    #[default]
    DegradeToSafeMode,
    /// Exit so a service manager restarts the process.
    Restart,
    /// Exit and stay down.
    Halt,
}

impl FailurePolicy {
    /// Process exit code for policies that terminate.
    pub fn exit_code(self) -> Option<i32> {
        match self {
            FailurePolicy::DegradeToSafeMode => None,
            // EX_TEMPFAIL: service managers treat this as restartable.
            FailurePolicy::Restart => Some(75),
            FailurePolicy::Halt => Some(3),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct ComponentEntry {
    /// Milliseconds since the watchdog's epoch.
    last_heartbeat_ms: AtomicU64,
    timeout: Duration,
}

/// Lock-free beat handle for one component.
#[derive(Clone)]
pub struct Heartbeat {
    epoch: Instant,
    entry: Arc<ComponentEntry>,
}

impl Heartbeat {
    pub fn beat(&self) {
        self.entry
            .last_heartbeat_ms
            .store(elapsed_ms(self.epoch), Ordering::Release);
    }
}

fn elapsed_ms(epoch: Instant) -> u64 {
    u64::try_from(epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

/// Tracks heartbeats from registered execution contexts.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use trustgate_kernel::watchdog::{ComponentHealth, Watchdog};
///
/// let wd = Watchdog::new();
/// let hb = wd.register("actuator_loop", Duration::from_secs(1));
/// hb.beat();
///
/// assert_eq!(wd.health("actuator_loop"), ComponentHealth::Healthy);
/// ```
pub struct Watchdog {
    epoch: Instant,
    components: RwLock<HashMap<String, Arc<ComponentEntry>>>,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            components: RwLock::new(HashMap::new()),
        }
    }

    /// Register `component_id` with a maximum heartbeat `timeout` and return
    /// its beat handle.  The component starts healthy.
    ///
    /// Re-registering an existing component resets its deadline.
    pub fn register(&self, component_id: &str, timeout: Duration) -> Heartbeat {
        let entry = Arc::new(ComponentEntry {
            last_heartbeat_ms: AtomicU64::new(elapsed_ms(self.epoch)),
            timeout,
        });
        if let Ok(mut map) = self.components.write() {
            map.insert(component_id.to_string(), entry.clone());
        }
        Heartbeat {
            epoch: self.epoch,
            entry,
        }
    }

    /// Stop tracking `component_id`, e.g. once the boot sequence is over.
    pub fn unregister(&self, component_id: &str) {
        if let Ok(mut map) = self.components.write() {
            map.remove(component_id);
        }
    }

    /// Record a heartbeat by name.  No-op for unregistered components.
    pub fn heartbeat(&self, component_id: &str) {
        if let Ok(map) = self.components.read()
            && let Some(entry) = map.get(component_id)
        {
            entry
                .last_heartbeat_ms
                .store(elapsed_ms(self.epoch), Ordering::Release);
        }
    }

    fn is_frozen(&self, entry: &ComponentEntry, now_ms: u64) -> bool {
        let last = entry.last_heartbeat_ms.load(Ordering::Acquire);
        now_ms.saturating_sub(last) > u64::try_from(entry.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Returns [`ComponentHealth::TimedOut`] for unknown components.
    pub fn health(&self, component_id: &str) -> ComponentHealth {
        let now = elapsed_ms(self.epoch);
        match self.components.read() {
            Ok(map) => match map.get(component_id) {
                Some(entry) if !self.is_frozen(entry, now) => ComponentHealth::Healthy,
                _ => ComponentHealth::TimedOut,
            },
            Err(_) => ComponentHealth::TimedOut,
        }
    }

    /// IDs of all components past their deadline, sorted.
    pub fn check_all(&self) -> Vec<String> {
        let now = elapsed_ms(self.epoch);
        let mut frozen: Vec<String> = match self.components.read() {
            Ok(map) => map
                .iter()
                .filter(|(_, entry)| self.is_frozen(entry, now))
                .map(|(id, _)| id.clone())
                .collect(),
            Err(_) => vec!["<watchdog poisoned>".to_string()],
        };
        frozen.sort();
        frozen
    }

    /// Check every component and, if any is frozen, latch an emergency stop
    /// and return the policy's exit code (if it has one).
    pub fn supervise(&self, interlock: &SafetyInterlock, policy: FailurePolicy) -> Option<i32> {
        let frozen = self.check_all();
        if frozen.is_empty() {
            return None;
        }
        let reason = format!("watchdog timeout: {}", frozen.join(", "));
        error!(components = ?frozen, policy = ?policy, "Frozen components detected");
        if let Err(e) = interlock.trigger_emergency_stop("watchdog", &reason) {
            error!(error = %e, "Emergency stop after watchdog timeout reported a failure");
        }
        policy.exit_code()
    }
}
