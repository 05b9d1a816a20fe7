//! [`HardwareSnapshot`] – the single canonical description of the host.
//!
//! Produced by the hardware probe during a cold boot, persisted in the vault
//! under `LastKnownEnv`, and reused read-only by fast boots until the next
//! cold reprobe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::q16::Q16;

/// Version of the snapshot schema written by this build.  A cached snapshot
/// carrying any other version forces a cold boot.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Who the machine says it is.  Gathered passively, without energising any
/// external hardware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineIdentity {
    pub machine_name: String,
    pub os: String,
    pub arch: String,
    /// Free-form OS release string, e.g. `/etc/os-release` `PRETTY_NAME`.
    #[serde(default)]
    pub os_release: String,
    /// Set when the site provisioning tooling tagged this node as part of an
    /// industrial cell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industrial_node_id: Option<String>,
}

impl MachineIdentity {
    /// Identity used when the passive scan itself fails.
    pub fn unknown() -> Self {
        Self {
            machine_name: "unknown-node".to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            os_release: String::new(),
            industrial_node_id: None,
        }
    }
}

/// Physical bus families the probe knows how to recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusType {
    Can,
    I2c,
    Spi,
    Usb,
    Modbus,
    EthernetSensor,
}

/// How a bus entry came to be in the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusSource {
    /// The interface was observed directly.
    Probed,
    /// The interface was guessed from indirect evidence.
    Inferred,
}

/// One discovered bus interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusCapability {
    /// Interface identifier, e.g. `"can0"` or `"i2c-1"`.
    pub id: String,
    #[serde(rename = "type")]
    pub bus_type: BusType,
    pub source: BusSource,
    pub confidence: Q16,
}

/// A processing unit (CPU, GPU, ECU, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Processor {
    /// `"CPU"`, `"GPU"`, `"ECU"`, `"TPU"`.
    pub kind: String,
    pub count: u32,
}

/// Layer 0: power.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhysicalProfile {
    pub power_present: bool,
    /// Battery voltage in volts, `0.0` when unknown.
    pub base_voltage: f64,
}

/// Layer 1: signal characteristics of the primary bus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalProfile {
    pub bus_type: Option<BusType>,
    pub baud_rate: u32,
    pub noise_level: f64,
    pub stable_clock: bool,
}

/// Layer 3: what the discovered controllers let us read and write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolProfile {
    pub firmware_version: String,
    pub writable_registers: u32,
    pub readable_registers: u32,
    pub supports_watchdog: bool,
    pub supports_safe_stop: bool,
}

/// Layer 4: what the AI is allowed to ask of the hardware.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// The AI may issue goals ("go 10 m") rather than raw register values.
    pub supports_goal_control: bool,
    pub supports_register_control: bool,
    pub sensor_only: bool,
    pub has_safety_envelope: bool,
}

impl CapabilityDescriptor {
    /// Derive capabilities from the protocol layer.
    ///
    /// A controller that can be read but not written is sensor-only.  Goal
    /// control additionally requires a hardware watchdog and a safe-stop
    /// primitive.
    pub fn resolve(protocol: &ProtocolProfile) -> Self {
        let writable = protocol.writable_registers > 0;
        let envelope = writable && protocol.supports_watchdog && protocol.supports_safe_stop;
        Self {
            supports_goal_control: envelope,
            supports_register_control: writable,
            sensor_only: protocol.readable_registers > 0 && !writable,
            has_safety_envelope: envelope,
        }
    }

    /// Capabilities of a host whose discovery failed.
    pub fn sensor_only() -> Self {
        Self {
            sensor_only: true,
            ..Self::default()
        }
    }
}

/// Full hardware/environment description of the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub identity: MachineIdentity,
    #[serde(default)]
    pub buses: Vec<BusCapability>,
    #[serde(default)]
    pub processors: Vec<Processor>,
    #[serde(default)]
    pub has_battery: bool,
    #[serde(default)]
    pub physical: PhysicalProfile,
    #[serde(default)]
    pub signal: SignalProfile,
    #[serde(default)]
    pub protocol: ProtocolProfile,
    #[serde(default)]
    pub capabilities: CapabilityDescriptor,
}

impl HardwareSnapshot {
    /// An empty snapshot for `identity` at the current schema version.
    pub fn new(identity: MachineIdentity) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            generated_at: Utc::now(),
            identity,
            buses: Vec::new(),
            processors: Vec::new(),
            has_battery: false,
            physical: PhysicalProfile::default(),
            signal: SignalProfile::default(),
            protocol: ProtocolProfile::default(),
            capabilities: CapabilityDescriptor::default(),
        }
    }

    /// Conservative fallback used when active discovery fails: no buses, no
    /// actuation capability.
    pub fn sensor_only_default(identity: MachineIdentity) -> Self {
        Self {
            capabilities: CapabilityDescriptor::sensor_only(),
            ..Self::new(identity)
        }
    }

    /// `true` when at least one bus of `bus_type` was discovered.
    pub fn has_bus(&self, bus_type: BusType) -> bool {
        self.buses.iter().any(|b| b.bus_type == bus_type)
    }

    /// `true` when a processor of `kind` (case-insensitive) is present.
    pub fn has_processor(&self, kind: &str) -> bool {
        self.processors
            .iter()
            .any(|p| p.kind.eq_ignore_ascii_case(kind) && p.count > 0)
    }

    /// Mean bus confidence, or `None` when no bus was discovered.
    pub fn mean_bus_confidence(&self) -> Option<f64> {
        if self.buses.is_empty() {
            return None;
        }
        let total: f64 = self.buses.iter().map(|b| b.confidence.to_float()).sum();
        Some(total / self.buses.len() as f64)
    }
}
