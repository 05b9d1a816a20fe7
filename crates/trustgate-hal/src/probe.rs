//! Hardware discovery.
//!
//! Discovery runs in two phases:
//!
//! 1. **Passive** ([`HardwareProbe::passive_scan`]) – reads identity only
//!    (hostname, OS, arch, release string).  Never energises hardware.
//! 2. **Active** ([`HardwareProbe::active_scan`]) – walks the layers
//!    physical → signal → bus enumeration → processors → protocol →
//!    capabilities and produces a full [`HardwareSnapshot`].
//!
//! Fast boots skip the active phase and call
//! [`HardwareProbe::sanity_check`] against the cached snapshot instead.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use trustgate_types::{
    BusCapability, BusSource, BusType, CapabilityDescriptor, HardwareSnapshot, KernelError,
    MachineIdentity, PhysicalProfile, Processor, ProtocolProfile, Q16, SignalProfile,
};

/// Confidence for a bus whose role is guessed rather than observed.
const INFERRED_CONFIDENCE: f64 = 0.6;

/// Hardware discovery surface used by the boot manager.
pub trait HardwareProbe: Send + Sync {
    /// Gather machine identity without energising any external hardware.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ProbeFailure`] when no identity can be read.
    fn passive_scan(&self) -> Result<MachineIdentity, KernelError>;

    /// Full layered discovery for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ProbeFailure`] on discovery I/O failure.
    /// Callers fall back to [`HardwareSnapshot::sensor_only_default`].
    fn active_scan(&self, identity: MachineIdentity) -> Result<HardwareSnapshot, KernelError>;

    /// `true` when `bus` is still present.
    fn bus_alive(&self, bus: &BusCapability) -> bool;

    /// Lightweight check that a cached snapshot still describes this host:
    /// same machine name and every directly probed bus still present.
    fn sanity_check(&self, cached: &HardwareSnapshot) -> bool {
        let identity = match self.passive_scan() {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Sanity check: passive scan failed");
                return false;
            }
        };
        if identity.machine_name != cached.identity.machine_name {
            warn!(
                cached = %cached.identity.machine_name,
                current = %identity.machine_name,
                "Sanity check: machine identity changed"
            );
            return false;
        }
        cached
            .buses
            .iter()
            .filter(|b| b.source == BusSource::Probed)
            .all(|b| {
                let alive = self.bus_alive(b);
                if !alive {
                    warn!(bus = %b.id, "Sanity check: bus disappeared");
                }
                alive
            })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SysfsProbe
// ────────────────────────────────────────────────────────────────────────────

/// Discovery over a Linux sysfs/devfs tree.
///
/// All paths are resolved below `root`, so tests can point it at a
/// temporary directory laid out like `/`.
///
/// # Example
///
/// ```
/// use trustgate_hal::{HardwareProbe, SysfsProbe};
///
/// let dir = std::env::temp_dir();
/// let probe = SysfsProbe::new(&dir);
/// // A tree without /sys cannot be actively scanned.
/// let id = probe.passive_scan().unwrap();
/// assert!(probe.active_scan(id).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    root: PathBuf,
    industrial_node_id: Option<String>,
    protocol: Option<ProtocolProfile>,
}

impl SysfsProbe {
    /// Probe rooted at `root` (normally `/`).
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            industrial_node_id: None,
            protocol: None,
        }
    }

    /// Record the site-provisioned industrial node id (`INDUSTRIAL_NODE_ID`).
    pub fn with_industrial_node_id(mut self, id: Option<String>) -> Self {
        self.industrial_node_id = id.filter(|s| !s.trim().is_empty());
        self
    }

    /// Use a provisioned protocol profile instead of the conservative
    /// read-only inference.
    pub fn with_protocol(mut self, protocol: ProtocolProfile) -> Self {
        self.protocol = Some(protocol);
        self
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn read_trimmed(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.path(rel))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn list(&self, rel: &str) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(self.path(rel)) {
            Ok(rd) => rd
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    // ---- layers ------------------------------------------------------------

    fn discover_physical(&self) -> (PhysicalProfile, bool) {
        let mut phy = PhysicalProfile::default();
        let mut has_battery = false;
        for supply in self.list("sys/class/power_supply") {
            let base = format!("sys/class/power_supply/{supply}");
            match self.read_trimmed(&format!("{base}/type")).as_deref() {
                Some("Battery") => {
                    has_battery = true;
                    if let Some(uv) = self
                        .read_trimmed(&format!("{base}/voltage_now"))
                        .and_then(|v| v.parse::<f64>().ok())
                    {
                        phy.base_voltage = uv / 1e6;
                    }
                }
                Some("Mains") => {
                    if self.read_trimmed(&format!("{base}/online")).as_deref() == Some("1") {
                        phy.power_present = true;
                    }
                }
                _ => {}
            }
        }
        (phy, has_battery)
    }

    fn discover_buses(&self) -> Vec<BusCapability> {
        let mut buses = Vec::new();
        for iface in self.list("sys/class/net") {
            if iface.starts_with("can") || iface.starts_with("vcan") {
                buses.push(probed(iface, BusType::Can));
            }
        }
        for node in self.list("dev") {
            if node.starts_with("i2c-") {
                buses.push(probed(node, BusType::I2c));
            } else if node.starts_with("spidev") {
                buses.push(probed(node, BusType::Spi));
            } else if node.starts_with("ttyUSB") {
                // USB serial adapters on industrial hosts are usually Modbus RTU.
                buses.push(BusCapability {
                    id: node,
                    bus_type: BusType::Modbus,
                    source: BusSource::Inferred,
                    confidence: Q16::from_float(INFERRED_CONFIDENCE),
                });
            }
        }
        buses
    }

    fn discover_signal(&self, buses: &[BusCapability]) -> SignalProfile {
        let Some(can) = buses.iter().find(|b| b.bus_type == BusType::Can) else {
            return SignalProfile::default();
        };
        let baud_rate = self
            .read_trimmed(&format!("sys/class/net/{}/can_bittiming/bitrate", can.id))
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        SignalProfile {
            bus_type: Some(BusType::Can),
            baud_rate,
            noise_level: 0.0,
            stable_clock: baud_rate > 0,
        }
    }

    fn discover_processors(&self) -> Vec<Processor> {
        let mut processors = Vec::new();
        let cpus = fs::read_to_string(self.path("proc/cpuinfo"))
            .map(|s| s.lines().filter(|l| l.starts_with("processor")).count() as u32)
            .unwrap_or(0);
        processors.push(Processor {
            kind: "CPU".to_string(),
            count: cpus.max(1),
        });
        let gpus = self
            .list("sys/class/drm")
            .iter()
            .filter(|n| n.starts_with("card") && !n.contains('-'))
            .count() as u32;
        if gpus > 0 {
            processors.push(Processor {
                kind: "GPU".to_string(),
                count: gpus,
            });
        }
        processors
    }

    fn discover_protocol(&self, buses: &[BusCapability]) -> ProtocolProfile {
        if let Some(p) = &self.protocol {
            return p.clone();
        }
        // Conservative: everything discovered is readable, nothing writable.
        ProtocolProfile {
            firmware_version: "unknown".to_string(),
            writable_registers: 0,
            readable_registers: buses.len() as u32,
            supports_watchdog: false,
            supports_safe_stop: false,
        }
    }
}

fn probed(id: String, bus_type: BusType) -> BusCapability {
    BusCapability {
        id,
        bus_type,
        source: BusSource::Probed,
        confidence: Q16::MAX,
    }
}

fn os_release_field(contents: &str, key: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.trim().trim_matches('"').to_string())
    })
}

impl HardwareProbe for SysfsProbe {
    fn passive_scan(&self) -> Result<MachineIdentity, KernelError> {
        let machine_name = self
            .read_trimmed("etc/hostname")
            .or_else(|| self.read_trimmed("proc/sys/kernel/hostname"))
            .unwrap_or_else(|| "unknown-node".to_string());
        let os_release = fs::read_to_string(self.path("etc/os-release"))
            .ok()
            .and_then(|s| os_release_field(&s, "PRETTY_NAME"))
            .unwrap_or_default();

        let identity = MachineIdentity {
            machine_name,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            os_release,
            industrial_node_id: self.industrial_node_id.clone(),
        };
        debug!(machine = %identity.machine_name, os = %identity.os, arch = %identity.arch, "Passive identity extracted");
        Ok(identity)
    }

    fn active_scan(&self, identity: MachineIdentity) -> Result<HardwareSnapshot, KernelError> {
        let sys = self.path("sys/class");
        if !sys.is_dir() {
            return Err(KernelError::ProbeFailure(format!(
                "{} is not readable",
                sys.display()
            )));
        }

        let mut snap = HardwareSnapshot::new(identity);
        let (physical, has_battery) = self.discover_physical();
        snap.physical = physical;
        snap.has_battery = has_battery;
        snap.buses = self.discover_buses();
        snap.signal = self.discover_signal(&snap.buses);
        snap.processors = self.discover_processors();
        snap.protocol = self.discover_protocol(&snap.buses);
        snap.capabilities = CapabilityDescriptor::resolve(&snap.protocol);

        debug!(
            buses = snap.buses.len(),
            battery = snap.has_battery,
            sensor_only = snap.capabilities.sensor_only,
            "Active discovery complete"
        );
        Ok(snap)
    }

    fn bus_alive(&self, bus: &BusCapability) -> bool {
        match bus.bus_type {
            BusType::Can | BusType::EthernetSensor => {
                self.path(&format!("sys/class/net/{}", bus.id)).exists()
            }
            _ => self.path(&format!("dev/{}", bus.id)).exists(),
        }
    }
}
