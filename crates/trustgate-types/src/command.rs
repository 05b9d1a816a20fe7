//! Router tasks.
//!
//! Tasks arrive as JSON envelopes `{"type": ..., "params": {...}, "priority": n}`
//! and are parsed into a typed [`Command`] at the boundary, so nothing past
//! [`Task::from_json`] ever looks at untyped parameters.
//!
//! ```
//! use trustgate_types::{Command, Task};
//!
//! let task = Task::from_json(r#"{"type":"NAVIGATE","params":{"lat":48.1,"lng":11.6},"priority":3}"#)
//!     .unwrap();
//! assert!(matches!(task.command, Command::Navigate { .. }));
//! assert_eq!(task.priority, 3);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::KernelError;
use crate::trust::OperationMode;

/// A typed router command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Navigate { lat: f64, lng: f64 },
    PerceptionScan { sensor: String },
    EmergencyHalt { reason: String },
    DataSync,
}

impl Command {
    /// Wire name of the command type.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Navigate { .. } => "NAVIGATE",
            Command::PerceptionScan { .. } => "PERCEPTION_SCAN",
            Command::EmergencyHalt { .. } => "EMERGENCY_HALT",
            Command::DataSync => "DATA_SYNC",
        }
    }

    /// Minimum trust mode needed to run this command.  `None` means the
    /// command bypasses the trust gate.
    ///
    /// Only `MANUAL_ONLY` refuses work.  Whether a routed `NAVIGATE` ever
    /// moves anything is decided by the mode's
    /// [`PowerState`](crate::trust::PowerState) at the actuator.
    pub fn required_mode(&self) -> Option<OperationMode> {
        match self {
            Command::EmergencyHalt { .. } => None,
            Command::Navigate { .. } | Command::PerceptionScan { .. } | Command::DataSync => {
                Some(OperationMode::Assisted)
            }
        }
    }

    /// `true` for commands that move the platform.
    pub fn actuates(&self) -> bool {
        matches!(self, Command::Navigate { .. })
    }
}

/// A prioritised unit of work for the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub command: Command,
    /// Higher runs first.
    pub priority: u8,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    params: Option<serde_json::Value>,
    #[serde(default)]
    priority: u8,
}

#[derive(Deserialize)]
struct NavigateParams {
    lat: f64,
    lng: f64,
}

#[derive(Deserialize)]
struct ScanParams {
    sensor: String,
}

#[derive(Deserialize)]
struct HaltParams {
    #[serde(default = "default_halt_reason")]
    reason: String,
}

fn default_halt_reason() -> String {
    "operator halt".to_string()
}

impl Task {
    pub fn new(command: Command, priority: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            command,
            priority,
            created_at: Utc::now(),
        }
    }

    /// Parse a JSON task envelope.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidCommand`] – malformed JSON or parameters.
    /// - [`KernelError::UnknownCommand`] – the `type` is not recognised.
    pub fn from_json(raw: &str) -> Result<Self, KernelError> {
        let env: Envelope = serde_json::from_str(raw)
            .map_err(|e| KernelError::InvalidCommand(format!("malformed task: {e}")))?;
        let params = env.params.unwrap_or(serde_json::Value::Null);

        let command = match env.kind.to_ascii_uppercase().as_str() {
            "NAVIGATE" => {
                let p: NavigateParams = parse_params(&env.kind, params)?;
                Command::Navigate { lat: p.lat, lng: p.lng }
            }
            "PERCEPTION_SCAN" => {
                let p: ScanParams = parse_params(&env.kind, params)?;
                Command::PerceptionScan { sensor: p.sensor }
            }
            "EMERGENCY_HALT" => {
                // A halt must never be refused for a bad payload.
                let reason = serde_json::from_value::<HaltParams>(params)
                    .map(|p| p.reason)
                    .unwrap_or_else(|_| default_halt_reason());
                Command::EmergencyHalt { reason }
            }
            "DATA_SYNC" => Command::DataSync,
            _ => return Err(KernelError::UnknownCommand(env.kind)),
        };

        Ok(Task::new(command, env.priority))
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(
    kind: &str,
    params: serde_json::Value,
) -> Result<T, KernelError> {
    serde_json::from_value(params)
        .map_err(|e| KernelError::InvalidCommand(format!("{kind}: {e}")))
}
