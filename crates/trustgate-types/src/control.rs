//! Motion intent, hardware packets and interlock state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Latest desired motion from the cognition layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// Expected in `[0, 1]`.
    pub throttle: f32,
    /// Expected in `[-1, 1]`, negative is left.
    pub steer: f32,
}

impl Intent {
    /// Zero throttle, wheels centred.
    pub const NEUTRAL: Intent = Intent {
        throttle: 0.0,
        steer: 0.0,
    };

    pub fn new(throttle: f32, steer: f32) -> Self {
        Self { throttle, steer }
    }

    /// Clamp both axes into range.  `NaN` becomes zero.
    pub fn clamped(self) -> Self {
        Self {
            throttle: sanitize(self.throttle).clamp(0.0, 1.0),
            steer: sanitize(self.steer).clamp(-1.0, 1.0),
        }
    }
}

fn sanitize(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v }
}

/// Hardware-ready packet.  Opaque below the HAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCommand {
    pub id: u32,
    pub payload: Vec<u8>,
}

/// Interlock state.  Higher values are more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum InterlockState {
    Clear = 0,
    Warning = 1,
    Obstruction = 2,
    EStop = 3,
}

impl InterlockState {
    /// Decode the atomic representation.  Unknown values are treated as
    /// `EStop`.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => InterlockState::Clear,
            1 => InterlockState::Warning,
            2 => InterlockState::Obstruction,
            _ => InterlockState::EStop,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_clear(self) -> bool {
        self == InterlockState::Clear
    }
}

impl fmt::Display for InterlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InterlockState::Clear => "CLEAR",
            InterlockState::Warning => "WARNING",
            InterlockState::Obstruction => "OBSTRUCTION",
            InterlockState::EStop => "E_STOP",
        })
    }
}
