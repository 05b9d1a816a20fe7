//! Generic `HardwareBus` trait for the actuation path.
//!
//! Drivers for CAN, serial or PWM controllers implement this trait.  The
//! actuator loop only ever talks to the trait, so drivers can be swapped
//! without touching gating logic.  [`DeviceBus`] is the stock driver: it
//! frames packets onto a character device.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;
use trustgate_types::{KernelError, RawCommand};

/// Timing of the most recent successful write on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusPulse {
    /// How long that write took to reach the device.
    pub latency: Duration,
    /// How long ago it completed.
    pub age: Duration,
}

/// A hardware-ready command sink.
///
/// Implementations must be callable from the actuator thread and the
/// interlock at the same time, hence `&self` and `Send + Sync`.
pub trait HardwareBus: Send + Sync {
    /// Write one command packet.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::HardwareFault`] if the packet cannot be put on
    /// the wire.
    fn write(&self, cmd: RawCommand) -> Result<(), KernelError>;

    /// Drive every actuator to its defined neutral/zero state.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::HardwareFault`] if the neutral command fails.
    fn write_safe_state(&self) -> Result<(), KernelError>;

    /// Timing of the last successful write.  `None` when nothing has been
    /// written yet or the driver does not measure it.
    fn pulse(&self) -> Option<BusPulse> {
        None
    }
}

// ────────────────────────────────────────────────────────────────────────────
// DeviceBus
// ────────────────────────────────────────────────────────────────────────────

/// First byte of every frame.
pub const FRAME_SYNC: u8 = 0xA5;
/// Command id the controller firmware treats as "all actuators neutral".
pub const SAFE_STATE_ID: u32 = 0x00;

/// Encode `cmd` as `SYNC | id (u32 BE) | len (u16 BE) | payload | xor`.
///
/// # Errors
///
/// [`KernelError::HardwareFault`] when the payload exceeds `u16::MAX` bytes.
pub fn encode_frame(cmd: &RawCommand) -> Result<Vec<u8>, KernelError> {
    let len = u16::try_from(cmd.payload.len()).map_err(|_| KernelError::HardwareFault {
        component: "bus".to_string(),
        details: format!("payload of {} bytes does not fit a frame", cmd.payload.len()),
    })?;
    let mut frame = Vec::with_capacity(cmd.payload.len() + 8);
    frame.push(FRAME_SYNC);
    frame.extend_from_slice(&cmd.id.to_be_bytes());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&cmd.payload);
    let checksum = frame.iter().fold(0u8, |acc, b| acc ^ b);
    frame.push(checksum);
    Ok(frame)
}

/// A bus backed by a character device (serial adapter, CAN gateway, or a
/// plain file for dry runs).  Frames are written with [`encode_frame`].
pub struct DeviceBus {
    path: PathBuf,
    file: Mutex<File>,
    /// Completion time and duration of the last good write.
    last_write: Mutex<Option<(Instant, Duration)>>,
}

impl DeviceBus {
    /// # Errors
    ///
    /// [`KernelError::HardwareFault`] when the device cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KernelError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| KernelError::HardwareFault {
                component: path.display().to_string(),
                details: format!("open failed: {e}"),
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            last_write: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn send(&self, frame: &[u8]) -> Result<(), KernelError> {
        let fault = |details: String| KernelError::HardwareFault {
            component: self.path.display().to_string(),
            details,
        };
        let mut file = self
            .file
            .lock()
            .map_err(|_| fault("device handle poisoned".to_string()))?;
        let started = Instant::now();
        file.write_all(frame)
            .and_then(|()| file.flush())
            .map_err(|e| fault(format!("write failed: {e}")))?;
        if let Ok(mut last) = self.last_write.lock() {
            *last = Some((Instant::now(), started.elapsed()));
        }
        Ok(())
    }
}

impl HardwareBus for DeviceBus {
    fn write(&self, cmd: RawCommand) -> Result<(), KernelError> {
        let frame = encode_frame(&cmd)?;
        self.send(&frame)
    }

    fn write_safe_state(&self) -> Result<(), KernelError> {
        debug!(device = %self.path.display(), "Writing safe state");
        let frame = encode_frame(&RawCommand {
            id: SAFE_STATE_ID,
            payload: Vec::new(),
        })?;
        self.send(&frame)
    }

    fn pulse(&self) -> Option<BusPulse> {
        let last = *self.last_write.lock().ok()?;
        last.map(|(at, latency)| BusPulse {
            latency,
            age: at.elapsed(),
        })
    }
}
