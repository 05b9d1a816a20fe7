//! [`IncidentLog`] – durable, append-only record of emergency stops.
//!
//! Each incident is one JSON line.  [`IncidentLog::record`] does not return
//! until the line has been handed to the OS *and* `fsync`ed, so a post-mortem
//! always finds the reason even if power is cut right after the stop.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trustgate_types::KernelError;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    /// Subsystem that raised the stop, e.g. `"router"` or `"interlock_poll"`.
    pub source: String,
    pub reason: String,
}

pub struct IncidentLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl IncidentLog {
    /// Open `path` for appending, creating it `0600` if absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KernelError> {
        let path = path.as_ref().to_path_buf();
        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let file = opts.open(&path).map_err(|e| {
            KernelError::Vault(format!("Failed to open incident log {}: {e}", path.display()))
        })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append and flush one incident.
    pub fn record(&self, source: &str, reason: &str) -> Result<Incident, KernelError> {
        let incident = Incident {
            id: Uuid::new_v4(),
            at: Utc::now(),
            source: source.to_string(),
            reason: reason.to_string(),
        };
        let mut line = serde_json::to_string(&incident)
            .map_err(|e| KernelError::Vault(format!("Failed to encode incident: {e}")))?;
        line.push('\n');

        let mut file = self
            .file
            .lock()
            .map_err(|_| KernelError::Vault("incident log lock poisoned".to_string()))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| KernelError::Vault(format!("Failed to flush incident: {e}")))?;
        Ok(incident)
    }

    /// Read every incident recorded at `path`.  Malformed lines are skipped.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<Incident>, KernelError> {
        let file = match fs::File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(KernelError::Vault(format!("Failed to read incidents: {e}"))),
        };
        Ok(BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter_map(|l| serde_json::from_str(&l).ok())
            .collect())
    }
}
