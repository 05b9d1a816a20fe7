//! [`TelemetryFeed`] – push-style, never-blocking telemetry sink.
//!
//! Producers (boot manager, interlock, actuator loop, router) call
//! [`TelemetryFeed::publish`]; the HMI or any other consumer drains the
//! paired receiver.  When the channel is full the event is dropped and
//! counted.  A producer never waits on a consumer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use trustgate_types::{
    InterlockState, OperationMode, PlatformClass, PowerState, Q16, TrustDescriptor, TrustLabel,
};

/// Default number of buffered events.
pub const DEFAULT_CAPACITY: usize = 64;

/// Everything the kernel reports to the outside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// Periodic or on-change trust snapshot.
    Trust {
        trust_score: f64,
        raw_score_q16: Q16,
        mode: OperationMode,
        label: TrustLabel,
        platform_class: PlatformClass,
    },
    /// Boot or long-running task progress in `[0, 1]`.
    Progress { stage: String, fraction: f32 },
    /// A navigation goal was handed to the dispatcher.
    Spatial { lat: f64, lng: f64 },
    /// The actuation path changed power state.
    Power { state: PowerState, mode: OperationMode },
    /// The interlock changed state.
    Interlock { state: InterlockState, reason: String },
    /// An actuation or command was refused.
    Denied { subject: String, reason: String },
}

impl TelemetryEvent {
    pub fn trust(descriptor: &TrustDescriptor, platform_class: PlatformClass) -> Self {
        TelemetryEvent::Trust {
            trust_score: descriptor.score,
            raw_score_q16: descriptor.raw_score_q16,
            mode: descriptor.operation_mode,
            label: descriptor.label,
            platform_class,
        }
    }

    pub fn progress(stage: &str, fraction: f32) -> Self {
        TelemetryEvent::Progress {
            stage: stage.to_string(),
            fraction: fraction.clamp(0.0, 1.0),
        }
    }
}

/// Cloneable producer handle.
#[derive(Clone, Debug)]
pub struct TelemetryFeed {
    sender: mpsc::Sender<TelemetryEvent>,
    dropped: Arc<AtomicU64>,
}

impl TelemetryFeed {
    /// Create a feed buffering up to `capacity` events (minimum 1).
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    /// A feed with no consumer.  Every event is counted as dropped.
    pub fn detached() -> Self {
        Self::new(1).0
    }

    /// Hand `event` to the consumer if there is room.  Returns `false` when
    /// it was dropped.
    pub fn publish(&self, event: TelemetryEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Number of events dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_feed_drops_instead_of_blocking() {
        let (feed, mut rx) = TelemetryFeed::new(2);
        assert!(feed.publish(TelemetryEvent::progress("probe", 0.1)));
        assert!(feed.publish(TelemetryEvent::progress("attest", 0.5)));
        assert!(!feed.publish(TelemetryEvent::progress("trust", 0.8)));
        assert_eq!(feed.dropped(), 1);

        let first = rx.try_recv().unwrap();
        assert_eq!(first, TelemetryEvent::progress("probe", 0.1));
        // Room again after a drain.
        assert!(feed.publish(TelemetryEvent::progress("ready", 1.0)));
    }

    #[test]
    fn detached_feed_counts_everything_as_dropped() {
        let feed = TelemetryFeed::detached();
        assert!(!feed.publish(TelemetryEvent::progress("x", 0.0)));
        assert_eq!(feed.dropped(), 1);
    }

    #[test]
    fn trust_event_carries_snapshot_fields() {
        let d = TrustDescriptor::untrusted();
        let ev = TelemetryEvent::trust(&d, PlatformClass::Robot);
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""kind":"trust""#));
        assert!(json.contains(r#""mode":"MANUAL_ONLY""#));
        assert!(json.contains(r#""platform_class":"robot""#));
    }

    #[test]
    fn power_event_serializes_wire_names() {
        let ev = TelemetryEvent::Power {
            state: PowerState::SensorsOnly,
            mode: OperationMode::Assisted,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert_eq!(
            json,
            r#"{"kind":"power","state":"SENSORS_ONLY","mode":"ASSISTED"}"#
        );
    }

    #[test]
    fn progress_fraction_is_clamped() {
        assert_eq!(
            TelemetryEvent::progress("x", 3.0),
            TelemetryEvent::Progress { stage: "x".into(), fraction: 1.0 }
        );
    }
}
