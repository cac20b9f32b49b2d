use std::path::{Path, PathBuf};

use stowage_common::{read_json, write_json_atomic, StowageError, StowageResult};

pub const CONFIG_FILE: &str = "stowage.cfg";

/// Daemon settings persisted under the root on first start. Later starts use the stored record
/// even when the environment changed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DaemonConfig {
    pub root: PathBuf,
    pub drivers: Vec<String>,
    pub default_driver: String,
}

impl DaemonConfig {
    pub fn path(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE)
    }

    pub fn load(root: &Path) -> StowageResult<Option<Self>> {
        read_json(&Self::path(root))
    }

    /// Load the stored record, or create it from `drivers` when there is none.
    /// The first listed driver becomes the default.
    pub fn load_or_init(root: &Path, drivers: &[String]) -> StowageResult<Self> {
        if let Some(config) = Self::load(root)? {
            if config.drivers != drivers {
                tracing::warn!(
                    stored = ?config.drivers,
                    requested = ?drivers,
                    "Ignoring driver list from the environment, using the stored configuration"
                );
            }
            return Ok(config);
        }

        let default_driver = drivers.first().cloned().ok_or_else(|| {
            StowageError::InvalidState("At least one driver must be configured".to_string())
        })?;
        std::fs::create_dir_all(root)?;
        let config = Self {
            root: root.to_path_buf(),
            drivers: drivers.to_vec(),
            default_driver,
        };
        write_json_atomic(&Self::path(root), &config)?;
        tracing::info!(root = %root.display(), drivers = ?config.drivers, "Initialized daemon configuration");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use stowage_common::ErrorKind;

    use super::*;

    #[test]
    fn first_start_persists_the_environment() {
        let dir = tempfile::tempdir().unwrap();
        let drivers = vec!["loopback".to_string(), "devmapper".to_string()];

        let created = DaemonConfig::load_or_init(dir.path(), &drivers).unwrap();
        assert_eq!(created.default_driver, "loopback");
        assert!(dir.path().join(CONFIG_FILE).exists());

        let later = DaemonConfig::load_or_init(dir.path(), &["devmapper".to_string()]).unwrap();
        assert_eq!(later, created);
    }

    #[test]
    fn empty_driver_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaemonConfig::load_or_init(dir.path(), &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(DaemonConfig::load(dir.path()).unwrap().is_none());
    }
}
