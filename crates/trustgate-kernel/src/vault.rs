//! [`Vault`] – owner-only persistent store for boot state.
//!
//! Layout under the vault directory (mode `0700`, files `0600`):
//!
//! | File | Contents |
//! |---|---|
//! | `FirstBootMarker` | Presence gates cold vs. fast boot |
//! | `LastKnownEnv.json` | [`StoredEnv`]: schema version, snapshot, platform |
//! | `SealedReference.json` | Measured-boot reference (see [`crate::attestor`]) |
//! | `incidents.jsonl` | Append-only E-stop incident log |
//!
//! Documents are written to a temporary file and renamed into place, so a
//! crash mid-write never leaves a truncated document behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use trustgate_types::{CURRENT_SCHEMA_VERSION, HardwareSnapshot, KernelError, PlatformResolution};

pub const FIRST_BOOT_MARKER: &str = "FirstBootMarker";
pub const LAST_KNOWN_ENV: &str = "LastKnownEnv";
pub const INCIDENT_LOG: &str = "incidents.jsonl";

/// The document persisted under [`LAST_KNOWN_ENV`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEnv {
    pub schema_version: u32,
    pub snapshot: HardwareSnapshot,
    pub platform: PlatformResolution,
}

impl StoredEnv {
    pub fn new(snapshot: HardwareSnapshot, platform: PlatformResolution) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            snapshot,
            platform,
        }
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    schema_version: u32,
}

/// Owner-only directory of JSON documents.
#[derive(Debug, Clone)]
pub struct Vault {
    dir: PathBuf,
}

impl Vault {
    /// Open (creating if needed) the vault at `dir`, restricting it to the
    /// owner.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Vault`] when the directory cannot be created or
    /// its permissions cannot be set.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, KernelError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            KernelError::Vault(format!("Failed to create vault {}: {e}", dir.display()))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).map_err(|e| {
                KernelError::Vault(format!("Failed to set vault permissions: {e}"))
            })?;
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the JSON document stored under `key`.
    pub fn document_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub fn incident_log_path(&self) -> PathBuf {
        self.dir.join(INCIDENT_LOG)
    }

    // ---- first-boot marker -------------------------------------------------

    pub fn has_first_boot_marker(&self) -> bool {
        self.dir.join(FIRST_BOOT_MARKER).is_file()
    }

    pub fn write_first_boot_marker(&self) -> Result<(), KernelError> {
        write_private(
            &self.dir.join(FIRST_BOOT_MARKER),
            Utc::now().to_rfc3339().as_bytes(),
        )
    }

    /// Remove the first-boot marker so the next bootstrap takes the cold path.
    pub fn invalidate(&self) -> Result<(), KernelError> {
        match fs::remove_file(self.dir.join(FIRST_BOOT_MARKER)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KernelError::Vault(format!("Failed to remove marker: {e}"))),
        }
    }

    // ---- generic documents -------------------------------------------------

    /// Load the document stored under `key`.  `Ok(None)` when it does not
    /// exist.
    ///
    /// # Errors
    ///
    /// - [`KernelError::Vault`] – the file exists but cannot be read.
    /// - [`KernelError::ConfigCorrupt`] – the file does not parse.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KernelError> {
        let Some(raw) = self.read_raw(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| KernelError::ConfigCorrupt(format!("{key}: {e}")))
    }

    /// Persist `value` under `key` with owner-only permissions.
    pub fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<(), KernelError> {
        let raw = serde_json::to_vec_pretty(value)
            .map_err(|e| KernelError::Vault(format!("Failed to serialize {key}: {e}")))?;
        write_private(&self.document_path(key), &raw)
    }

    fn read_raw(&self, key: &str) -> Result<Option<String>, KernelError> {
        let path = self.document_path(key);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KernelError::Vault(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    // ---- last known environment ---------------------------------------------

    /// Load the cached environment, checking the schema version before
    /// anything else is parsed.
    ///
    /// # Errors
    ///
    /// - [`KernelError::SchemaMismatch`] – cached version differs from
    ///   [`CURRENT_SCHEMA_VERSION`].
    /// - [`KernelError::ConfigCorrupt`] – the document is unreadable JSON.
    pub fn load_env(&self) -> Result<Option<StoredEnv>, KernelError> {
        let Some(raw) = self.read_raw(LAST_KNOWN_ENV)? else {
            return Ok(None);
        };
        let probe: VersionProbe = serde_json::from_str(&raw)
            .map_err(|e| KernelError::ConfigCorrupt(format!("{LAST_KNOWN_ENV}: {e}")))?;
        if probe.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(KernelError::SchemaMismatch {
                cached: probe.schema_version,
                current: CURRENT_SCHEMA_VERSION,
            });
        }
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| KernelError::ConfigCorrupt(format!("{LAST_KNOWN_ENV}: {e}")))
    }

    pub fn store_env(&self, env: &StoredEnv) -> Result<(), KernelError> {
        self.store(LAST_KNOWN_ENV, env)
    }
}

/// Write `bytes` to `path` as `0600`, via a temporary file and rename.
fn write_private(path: &Path, bytes: &[u8]) -> Result<(), KernelError> {
    let tmp = path.with_extension("tmp");
    let fail = |e: std::io::Error| {
        KernelError::Vault(format!("Failed to write {}: {e}", path.display()))
    };

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(&tmp).map_err(fail)?;
    file.write_all(bytes).map_err(fail)?;
    file.sync_all().map_err(fail)?;
    fs::rename(&tmp, path).map_err(fail)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustgate_types::MachineIdentity;

    fn stored() -> StoredEnv {
        StoredEnv::new(
            HardwareSnapshot::new(MachineIdentity::unknown()),
            PlatformResolution::pending(),
        )
    }

    #[cfg(unix)]
    #[test]
    fn vault_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let vault = Vault::open(dir.path().join("vault")).unwrap();
        vault.store_env(&stored()).unwrap();

        let dir_mode = fs::metadata(vault.dir()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        let file_mode = fs::metadata(vault.document_path(LAST_KNOWN_ENV))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o600);
    }

    #[test]
    fn marker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        assert!(!vault.has_first_boot_marker());
        vault.write_first_boot_marker().unwrap();
        assert!(vault.has_first_boot_marker());
        vault.invalidate().unwrap();
        assert!(!vault.has_first_boot_marker());
        // Invalidating twice is fine.
        vault.invalidate().unwrap();
    }

    #[test]
    fn env_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        assert!(vault.load_env().unwrap().is_none());
        let env = stored();
        vault.store_env(&env).unwrap();
        assert_eq!(vault.load_env().unwrap(), Some(env));
    }

    #[test]
    fn old_schema_is_reported_before_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        // A v2 document with a shape this build no longer understands.
        fs::write(
            vault.document_path(LAST_KNOWN_ENV),
            r#"{"schema_version":2,"hardware":{"legacy":true}}"#,
        )
        .unwrap();
        assert_eq!(
            vault.load_env().unwrap_err(),
            KernelError::SchemaMismatch { cached: 2, current: CURRENT_SCHEMA_VERSION }
        );
    }

    #[test]
    fn garbage_is_config_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        fs::write(vault.document_path(LAST_KNOWN_ENV), "{not json").unwrap();
        assert!(matches!(vault.load_env(), Err(KernelError::ConfigCorrupt(_))));

        fs::write(
            vault.document_path(LAST_KNOWN_ENV),
            format!(r#"{{"schema_version":{CURRENT_SCHEMA_VERSION}}}"#),
        )
        .unwrap();
        assert!(matches!(vault.load_env(), Err(KernelError::ConfigCorrupt(_))));
    }
}
