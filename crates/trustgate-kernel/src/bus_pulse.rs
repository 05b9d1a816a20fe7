//! [`PulseCheck`] – is the actuation bus still answering on time?
//!
//! The last successful write's latency and age are mapped to a health
//! multiplier for the `hardware_io` trust factor:
//!
//! | Last write | Health |
//! |---|---|
//! | under [`FAST_WINDOW`] | 1.0 |
//! | under [`SLOW_WINDOW`] | 0.5 |
//! | slower, or older than `stale_after` | 0.0 |
//!
//! A bus with no pulse yet carries no timing evidence and scores 1.0.

use std::time::Duration;

use tracing::{debug, warn};
use trustgate_hal::{BusPulse, HardwareBus};

pub const FAST_WINDOW: Duration = Duration::from_millis(5);
pub const SLOW_WINDOW: Duration = Duration::from_millis(50);
/// A bus silent for longer than this is stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseCheck {
    stale_after: Duration,
}

impl Default for PulseCheck {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

impl PulseCheck {
    pub fn new(stale_after: Duration) -> Self {
        Self { stale_after }
    }

    pub fn health(&self, pulse: Option<BusPulse>) -> f64 {
        let Some(pulse) = pulse else {
            return 1.0;
        };
        if pulse.age > self.stale_after {
            0.0
        } else if pulse.latency < FAST_WINDOW {
            1.0
        } else if pulse.latency < SLOW_WINDOW {
            0.5
        } else {
            0.0
        }
    }

    /// Read `bus`'s pulse and grade it.
    pub fn verify(&self, bus: &dyn HardwareBus) -> f64 {
        let pulse = bus.pulse();
        let health = self.health(pulse);
        match pulse {
            Some(p) if health < 1.0 => warn!(
                latency_ms = p.latency.as_secs_f64() * 1e3,
                age_ms = p.age.as_secs_f64() * 1e3,
                health,
                "Bus pulse degraded"
            ),
            Some(_) => {}
            None => debug!("No bus pulse yet"),
        }
        health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustgate_hal::sim::SimBus;

    fn pulse(latency_ms: u64, age_ms: u64) -> Option<BusPulse> {
        Some(BusPulse {
            latency: Duration::from_millis(latency_ms),
            age: Duration::from_millis(age_ms),
        })
    }

    #[test]
    fn latency_windows() {
        let check = PulseCheck::default();
        assert_eq!(check.health(pulse(2, 0)), 1.0);
        assert_eq!(check.health(pulse(5, 0)), 0.5);
        assert_eq!(check.health(pulse(49, 0)), 0.5);
        assert_eq!(check.health(pulse(50, 0)), 0.0);
    }

    #[test]
    fn stale_bus_is_unhealthy_however_fast() {
        let check = PulseCheck::new(Duration::from_millis(100));
        assert_eq!(check.health(pulse(1, 100)), 1.0);
        assert_eq!(check.health(pulse(1, 101)), 0.0);
    }

    #[test]
    fn silent_bus_is_not_evidence() {
        assert_eq!(PulseCheck::default().health(None), 1.0);
    }

    #[test]
    fn verify_reads_the_bus() {
        let bus = SimBus::new();
        let check = PulseCheck::default();
        assert_eq!(check.verify(&bus), 1.0);
        bus.set_pulse(pulse(20, 0));
        assert_eq!(check.verify(&bus), 0.5);
    }
}
