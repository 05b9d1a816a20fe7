//! Node configuration – reads/writes `~/.trustgate/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use trustgate_kernel::{BootConfig, FailurePolicy, TrustWeights};
use trustgate_types::ProtocolProfile;

/// Persisted node configuration stored in `~/.trustgate/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Where the sealed reference, cached environment and incident log live.
    #[serde(default = "default_vault_dir")]
    pub vault_dir: PathBuf,

    /// Actuator loop frequency.
    #[serde(default = "default_loop_hz")]
    pub loop_hz: u32,

    #[serde(default = "default_interlock_poll_ms")]
    pub interlock_poll_ms: u64,

    /// Scores at or above this run `AUTONOMOUS`.
    #[serde(default = "default_min_threshold")]
    pub min_threshold: f64,

    #[serde(default)]
    pub weights: TrustWeights,

    /// A component silent for longer than this is considered frozen.
    #[serde(default = "default_watchdog_timeout_ms")]
    pub watchdog_timeout_ms: u64,

    #[serde(default)]
    pub watchdog_policy: FailurePolicy,

    /// The whole bootstrap must finish within this long.
    #[serde(default = "default_boot_timeout_ms")]
    pub boot_timeout_ms: u64,

    /// Seconds between runtime re-attestations.  `0` disables them.
    #[serde(default = "default_reattest_secs")]
    pub reattest_secs: u64,

    #[serde(default = "default_telemetry_capacity")]
    pub telemetry_capacity: usize,

    /// Filesystem root the probe reads `/sys` and `/dev` under.
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    /// Skip the cached environment, cold boot, and re-provision the sealed
    /// reference.  Set it for the first boot after an upgrade, then clear it.
    #[serde(default)]
    pub reseal: bool,

    /// Binary to measure.  Defaults to the running executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<PathBuf>,

    /// Actuation device.  Without one the node runs dry against a
    /// simulated bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_device: Option<PathBuf>,

    /// GPIO `value` file of the hardware E-stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estop_gpio: Option<PathBuf>,

    #[serde(default)]
    pub estop_active_low: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industrial_node_id: Option<String>,

    /// Provisioned controller profile.  Without one the probe assumes a
    /// read-only controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<ProtocolProfile>,
}

fn default_vault_dir() -> PathBuf {
    trustgate_dir_for_home(&home_dir()).join("vault")
}
fn default_loop_hz() -> u32 {
    100
}
fn default_interlock_poll_ms() -> u64 {
    10
}
fn default_min_threshold() -> f64 {
    0.9
}
fn default_watchdog_timeout_ms() -> u64 {
    500
}
fn default_boot_timeout_ms() -> u64 {
    10_000
}
fn default_reattest_secs() -> u64 {
    60
}
fn default_telemetry_capacity() -> usize {
    64
}
fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vault_dir: default_vault_dir(),
            loop_hz: default_loop_hz(),
            interlock_poll_ms: default_interlock_poll_ms(),
            min_threshold: default_min_threshold(),
            weights: TrustWeights::default(),
            watchdog_timeout_ms: default_watchdog_timeout_ms(),
            watchdog_policy: FailurePolicy::default(),
            boot_timeout_ms: default_boot_timeout_ms(),
            reattest_secs: default_reattest_secs(),
            telemetry_capacity: default_telemetry_capacity(),
            sysfs_root: default_sysfs_root(),
            reseal: false,
            binary_path: None,
            bus_device: None,
            estop_gpio: None,
            estop_active_low: false,
            industrial_node_id: None,
            protocol: None,
        }
    }
}

impl Config {
    pub fn boot_config(&self) -> BootConfig {
        BootConfig {
            weights: self.weights,
            min_threshold: self.min_threshold,
            reseal: self.reseal,
        }
    }

    pub fn interlock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.interlock_poll_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }

    /// `None` when runtime re-attestation is disabled.
    pub fn reattest_interval(&self) -> Option<Duration> {
        (self.reattest_secs > 0).then(|| Duration::from_secs(self.reattest_secs))
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

/// Return the path to `~/.trustgate/config.toml`.
pub fn config_path() -> PathBuf {
    trustgate_dir_for_home(&home_dir()).join("config.toml")
}

pub(crate) fn trustgate_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".trustgate")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply environment overrides to `cfg`.  Unparseable values are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `TRUSTGATE_VAULT_DIR` | `vault_dir` |
/// | `TRUSTGATE_LOOP_HZ` | `loop_hz` |
/// | `TRUSTGATE_MIN_THRESHOLD` | `min_threshold` |
/// | `TRUSTGATE_SYSFS_ROOT` | `sysfs_root` |
/// | `TRUSTGATE_RESEAL` | `reseal` (`1`/`true`) |
/// | `TRUSTGATE_BUS_DEVICE` | `bus_device` |
/// | `INDUSTRIAL_NODE_ID` | `industrial_node_id` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TRUSTGATE_VAULT_DIR")
        && !v.trim().is_empty()
    {
        cfg.vault_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("TRUSTGATE_LOOP_HZ")
        && let Ok(hz) = v.trim().parse::<u32>()
        && hz > 0
    {
        cfg.loop_hz = hz;
    }
    if let Ok(v) = std::env::var("TRUSTGATE_MIN_THRESHOLD")
        && let Ok(t) = v.trim().parse::<f64>()
        && t > 0.0
        && t <= 1.0
    {
        cfg.min_threshold = t;
    }
    if let Ok(v) = std::env::var("TRUSTGATE_SYSFS_ROOT")
        && !v.trim().is_empty()
    {
        cfg.sysfs_root = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("TRUSTGATE_RESEAL") {
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => cfg.reseal = true,
            "0" | "false" | "no" => cfg.reseal = false,
            _ => {}
        }
    }
    if let Ok(v) = std::env::var("TRUSTGATE_BUS_DEVICE")
        && !v.trim().is_empty()
    {
        cfg.bus_device = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("INDUSTRIAL_NODE_ID")
        && !v.trim().is_empty()
    {
        cfg.industrial_node_id = Some(v);
    }
}

/// Save the config to disk, creating `~/.trustgate/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------).
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
