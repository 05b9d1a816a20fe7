//! Periodic hardware safety poll on its own thread.
//!
//! The poller only ever escalates the interlock; clearing is an operator
//! action.  It does not write to the bus on shutdown: the actuator loop owns
//! the final neutral write.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::info;
use trustgate_hal::SafetyInput;
use trustgate_kernel::{Heartbeat, SafetyInterlock};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct InterlockPoller {
    interlock: Arc<SafetyInterlock>,
    inputs: Vec<Arc<dyn SafetyInput>>,
    interval: Duration,
    heartbeat: Option<Heartbeat>,
}

impl InterlockPoller {
    pub fn new(interlock: Arc<SafetyInterlock>, interval: Duration) -> Self {
        Self {
            interlock,
            inputs: Vec::new(),
            interval: interval.max(Duration::from_millis(1)),
            heartbeat: None,
        }
    }

    pub fn with_input(mut self, input: Arc<dyn SafetyInput>) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Read every input once.
    pub fn poll_once(&self) {
        for input in &self.inputs {
            self.interlock.poll(input.as_ref());
        }
        if let Some(hb) = &self.heartbeat {
            hb.beat();
        }
    }

    /// Run on a dedicated thread named `interlock-poll` until `shutdown`.
    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("interlock-poll".to_string())
            .spawn(move || {
                info!(
                    inputs = self.inputs.len(),
                    interval_ms = self.interval.as_millis() as u64,
                    "Interlock poller started"
                );
                while !shutdown.load(Ordering::Acquire) {
                    self.poll_once();
                    thread::sleep(self.interval);
                }
                info!("Interlock poller stopped");
            })
    }
}
