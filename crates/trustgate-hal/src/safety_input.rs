//! Physical safety inputs polled by the interlock.

use std::fs;
use std::path::{Path, PathBuf};

use trustgate_types::{InterlockState, KernelError};

/// A source of hardware safety state: an E-stop pin, a light curtain, a
/// safety CAN frame.
pub trait SafetyInput: Send + Sync {
    /// Stable identifier, e.g. `"estop_pin"`.
    fn id(&self) -> &str;

    /// Read the state the hardware currently demands.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::HardwareFault`] if the input cannot be read.
    /// Callers treat a read failure as at least a warning.
    fn read(&self) -> Result<InterlockState, KernelError>;
}

/// An E-stop button wired to a GPIO line exported through sysfs
/// (`/sys/class/gpio/gpioN/value`).
#[derive(Debug, Clone)]
pub struct GpioEstopInput {
    id: String,
    value_path: PathBuf,
    active_low: bool,
}

impl GpioEstopInput {
    /// A pressed button reads `1` unless [`Self::active_low`] is set.
    pub fn new(id: impl Into<String>, value_path: impl AsRef<Path>) -> Self {
        Self {
            id: id.into(),
            value_path: value_path.as_ref().to_path_buf(),
            active_low: false,
        }
    }

    /// Normally-closed wiring: `0` means pressed.
    pub fn active_low(mut self, active_low: bool) -> Self {
        self.active_low = active_low;
        self
    }
}

impl SafetyInput for GpioEstopInput {
    fn id(&self) -> &str {
        &self.id
    }

    fn read(&self) -> Result<InterlockState, KernelError> {
        let fault = |details: String| KernelError::HardwareFault {
            component: self.id.clone(),
            details,
        };
        let raw = fs::read_to_string(&self.value_path)
            .map_err(|e| fault(format!("{}: {e}", self.value_path.display())))?;
        let high = match raw.trim() {
            "1" => true,
            "0" => false,
            other => return Err(fault(format!("unexpected gpio value '{other}'"))),
        };
        if high != self.active_low {
            Ok(InterlockState::EStop)
        } else {
            Ok(InterlockState::Clear)
        }
    }
}
