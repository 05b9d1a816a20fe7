//! In-process simulation doubles for CI/CD testing without physical hardware.
//!
//! [`SimBus`] records every packet and safe-state call, [`SimHost`] builds a
//! [`SimProbe`] describing a synthetic machine, and [`SimSafetyInput`] is an
//! E-stop pin that tests can flip.  Together they let the full kernel run in
//! headless tests.
//!
//! # Example
//!
//! ```rust
//! use trustgate_hal::HardwareProbe;
//! use trustgate_hal::sim::SimHost;
//!
//! let probe = SimHost::new("rover-1")
//!     .with_i2c("i2c-1")
//!     .with_spi("spidev0.0")
//!     .with_battery()
//!     .build();
//!
//! let id = probe.passive_scan().expect("sim identity");
//! let snap = probe.active_scan(id).expect("sim discovery");
//! assert_eq!(snap.buses.len(), 2);
//! ```

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use trustgate_types::{
    BusCapability, BusSource, BusType, CapabilityDescriptor, HardwareSnapshot, InterlockState,
    KernelError, MachineIdentity, Processor, ProtocolProfile, Q16, RawCommand,
};

use crate::bus::{BusPulse, HardwareBus};
use crate::probe::HardwareProbe;
use crate::safety_input::SafetyInput;

// ────────────────────────────────────────────────────────────────────────────
// Stub bus
// ────────────────────────────────────────────────────────────────────────────

/// One call observed by a [`SimBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Write(RawCommand),
    SafeState,
}

/// A simulated actuation bus that records every call in order.
#[derive(Debug, Default)]
pub struct SimBus {
    events: Mutex<Vec<BusEvent>>,
    safe_states: AtomicUsize,
    fail_writes: AtomicBool,
    pulse: Mutex<Option<BusPulse>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent [`HardwareBus::write`] calls fail.  Safe-state writes
    /// always succeed.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Set the timing reported by [`HardwareBus::pulse`].
    pub fn set_pulse(&self, pulse: Option<BusPulse>) {
        if let Ok(mut p) = self.pulse.lock() {
            *p = pulse;
        }
    }

    /// Every call so far, oldest first.
    pub fn events(&self) -> Vec<BusEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Only the command packets.
    pub fn writes(&self) -> Vec<RawCommand> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BusEvent::Write(cmd) => Some(cmd),
                BusEvent::SafeState => None,
            })
            .collect()
    }

    pub fn last_write(&self) -> Option<RawCommand> {
        self.writes().pop()
    }

    pub fn safe_state_count(&self) -> usize {
        self.safe_states.load(Ordering::SeqCst)
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        if let Ok(mut e) = self.events.lock() {
            e.clear();
        }
        self.safe_states.store(0, Ordering::SeqCst);
    }

    fn record(&self, event: BusEvent) {
        if let Ok(mut e) = self.events.lock() {
            e.push(event);
        }
    }
}

impl HardwareBus for SimBus {
    fn write(&self, cmd: RawCommand) -> Result<(), KernelError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KernelError::HardwareFault {
                component: "sim_bus".to_string(),
                details: "injected write failure".to_string(),
            });
        }
        self.record(BusEvent::Write(cmd));
        Ok(())
    }

    fn write_safe_state(&self) -> Result<(), KernelError> {
        self.safe_states.fetch_add(1, Ordering::SeqCst);
        self.record(BusEvent::SafeState);
        Ok(())
    }

    fn pulse(&self) -> Option<BusPulse> {
        self.pulse.lock().ok().and_then(|p| *p)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Stub probe
// ────────────────────────────────────────────────────────────────────────────

/// A synthetic machine returned by [`SimHost::build`].
pub struct SimProbe {
    identity: MachineIdentity,
    snapshot: HardwareSnapshot,
    removed: Mutex<HashSet<String>>,
    fail_active: AtomicBool,
    active_scans: AtomicUsize,
}

impl SimProbe {
    /// Make the bus `id` disappear, as if unplugged.
    pub fn unplug(&self, id: &str) {
        if let Ok(mut r) = self.removed.lock() {
            r.insert(id.to_string());
        }
    }

    pub fn set_fail_active(&self, fail: bool) {
        self.fail_active.store(fail, Ordering::SeqCst);
    }

    /// How many full active discoveries have run.
    pub fn active_scan_count(&self) -> usize {
        self.active_scans.load(Ordering::SeqCst)
    }
}

impl HardwareProbe for SimProbe {
    fn passive_scan(&self) -> Result<MachineIdentity, KernelError> {
        Ok(self.identity.clone())
    }

    fn active_scan(&self, identity: MachineIdentity) -> Result<HardwareSnapshot, KernelError> {
        self.active_scans.fetch_add(1, Ordering::SeqCst);
        if self.fail_active.load(Ordering::SeqCst) {
            return Err(KernelError::ProbeFailure("injected discovery failure".to_string()));
        }
        let fresh = HardwareSnapshot::new(identity);
        Ok(HardwareSnapshot {
            generated_at: fresh.generated_at,
            identity: fresh.identity,
            ..self.snapshot.clone()
        })
    }

    fn bus_alive(&self, bus: &BusCapability) -> bool {
        let removed = self.removed.lock().map(|r| r.contains(&bus.id)).unwrap_or(false);
        !removed && self.snapshot.buses.iter().any(|b| b.id == bus.id)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimHost builder
// ────────────────────────────────────────────────────────────────────────────

/// Builder for a [`SimProbe`].
pub struct SimHost {
    snapshot: HardwareSnapshot,
    protocol: Option<ProtocolProfile>,
}

impl SimHost {
    /// A bare host called `machine_name` with four CPUs and no buses.
    pub fn new(machine_name: &str) -> Self {
        let identity = MachineIdentity {
            machine_name: machine_name.to_string(),
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            os_release: String::new(),
            industrial_node_id: None,
        };
        let mut snapshot = HardwareSnapshot::new(identity);
        snapshot.processors.push(Processor {
            kind: "CPU".to_string(),
            count: 4,
        });
        Self {
            snapshot,
            protocol: None,
        }
    }

    fn with_bus(mut self, id: &str, bus_type: BusType) -> Self {
        self.snapshot.buses.push(BusCapability {
            id: id.to_string(),
            bus_type,
            source: BusSource::Probed,
            confidence: Q16::MAX,
        });
        self
    }

    pub fn with_can(self, id: &str) -> Self {
        let mut host = self.with_bus(id, BusType::Can);
        host.snapshot.signal.bus_type = Some(BusType::Can);
        host.snapshot.signal.baud_rate = 500_000;
        host.snapshot.signal.stable_clock = true;
        host
    }

    pub fn with_i2c(self, id: &str) -> Self {
        self.with_bus(id, BusType::I2c)
    }

    pub fn with_spi(self, id: &str) -> Self {
        self.with_bus(id, BusType::Spi)
    }

    pub fn with_modbus(self, id: &str) -> Self {
        self.with_bus(id, BusType::Modbus)
    }

    /// Add an inferred bus with an explicit confidence.
    pub fn with_bus_confidence(mut self, id: &str, bus_type: BusType, confidence: Q16) -> Self {
        self.snapshot.buses.push(BusCapability {
            id: id.to_string(),
            bus_type,
            source: BusSource::Inferred,
            confidence,
        });
        self
    }

    pub fn with_battery(mut self) -> Self {
        self.snapshot.has_battery = true;
        self.snapshot.physical.base_voltage = 12.6;
        self
    }

    pub fn with_gpu(mut self) -> Self {
        self.snapshot.processors.push(Processor {
            kind: "GPU".to_string(),
            count: 1,
        });
        self
    }

    pub fn with_arch(mut self, arch: &str) -> Self {
        self.snapshot.identity.arch = arch.to_string();
        self
    }

    pub fn with_os_release(mut self, release: &str) -> Self {
        self.snapshot.identity.os_release = release.to_string();
        self
    }

    pub fn with_industrial_node_id(mut self, id: &str) -> Self {
        self.snapshot.identity.industrial_node_id = Some(id.to_string());
        self
    }

    /// Writable registers with watchdog and safe-stop: full goal control.
    pub fn with_actuation(mut self) -> Self {
        self.protocol = Some(ProtocolProfile {
            firmware_version: "sim-1.0".to_string(),
            writable_registers: 8,
            readable_registers: 16,
            supports_watchdog: true,
            supports_safe_stop: true,
        });
        self
    }

    /// Consume the builder and return the configured [`SimProbe`].
    pub fn build(mut self) -> SimProbe {
        let protocol = self.protocol.take().unwrap_or_else(|| ProtocolProfile {
            firmware_version: "sim-1.0".to_string(),
            readable_registers: self.snapshot.buses.len() as u32,
            ..ProtocolProfile::default()
        });
        self.snapshot.capabilities = CapabilityDescriptor::resolve(&protocol);
        self.snapshot.protocol = protocol;
        SimProbe {
            identity: self.snapshot.identity.clone(),
            snapshot: self.snapshot,
            removed: Mutex::new(HashSet::new()),
            fail_active: AtomicBool::new(false),
            active_scans: AtomicUsize::new(0),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Stub safety input
// ────────────────────────────────────────────────────────────────────────────

/// A simulated E-stop pin.  Starts clear.
#[derive(Debug)]
pub struct SimSafetyInput {
    id: String,
    state: AtomicU8,
    fail: AtomicBool,
}

impl SimSafetyInput {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: AtomicU8::new(InterlockState::Clear.as_u8()),
            fail: AtomicBool::new(false),
        }
    }

    /// Set the state the pin reports.
    pub fn set(&self, state: InterlockState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Make reads fail, as if the wire were cut.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl SafetyInput for SimSafetyInput {
    fn id(&self) -> &str {
        &self.id
    }

    fn read(&self) -> Result<InterlockState, KernelError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(KernelError::HardwareFault {
                component: self.id.clone(),
                details: "safety input read failed".to_string(),
            });
        }
        Ok(InterlockState::from_u8(self.state.load(Ordering::SeqCst)))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
