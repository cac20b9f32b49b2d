//! Storage driver SPI.
//!
//! A driver advertises a [`Capabilities`] set and hands out the operation bundles it implements.
//! Callers never downcast: they ask `dyn Driver` for a bundle and receive
//! [`StowageError::UnsupportedCapability`] when the driver does not provide it.

use std::{collections::BTreeMap, fmt::Display, path::PathBuf};

use crate::{
    error::{StowageError, StowageResult},
    mapping::BlockMapping,
    model::{Snapshot, Volume},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Volume,
    Snapshot,
    Backup,
}

impl Capability {
    const fn bit(self) -> u8 {
        match self {
            Capability::Volume => 0b001,
            Capability::Snapshot => 0b010,
            Capability::Backup => 0b100,
        }
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Volume => write!(f, "volume"),
            Capability::Snapshot => write!(f, "snapshot"),
            Capability::Backup => write!(f, "backup"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);

    pub const fn with(self, capability: Capability) -> Self {
        Capabilities(self.0 | capability.bit())
    }

    pub const fn supports(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn list(&self) -> Vec<Capability> {
        [Capability::Volume, Capability::Snapshot, Capability::Backup]
            .into_iter()
            .filter(|c| self.supports(*c))
            .collect()
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        iter.into_iter().fold(Capabilities::NONE, Capabilities::with)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct CreateVolumeOptions {
    /// Size in bytes, the driver default is used when absent.
    #[serde(default)]
    pub size: Option<u64>,
    /// Backup to restore into the new volume.
    #[serde(default)]
    pub backup_url: Option<String>,
    #[serde(default)]
    pub filesystem: Option<String>,
    /// Driver specific options.
    #[serde(default)]
    pub driver_opts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct BackupOptions {
    /// Labels stored with the backup manifest.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[async_trait::async_trait]
pub trait Driver: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn info(&self) -> StowageResult<BTreeMap<String, String>>;

    fn as_volume_ops(&self) -> Option<&dyn VolumeOperations> {
        None
    }

    fn as_snapshot_ops(&self) -> Option<&dyn SnapshotOperations> {
        None
    }

    fn as_backup_ops(&self) -> Option<&dyn BackupOperations> {
        None
    }
}

impl<'a> dyn Driver + 'a {
    fn unsupported(&self, capability: Capability) -> StowageError {
        StowageError::UnsupportedCapability {
            driver: self.name().to_string(),
            capability: capability.to_string(),
        }
    }

    pub fn volume_ops(&self) -> StowageResult<&dyn VolumeOperations> {
        match self.as_volume_ops() {
            Some(ops) if self.capabilities().supports(Capability::Volume) => Ok(ops),
            _ => Err(self.unsupported(Capability::Volume)),
        }
    }

    pub fn snapshot_ops(&self) -> StowageResult<&dyn SnapshotOperations> {
        match self.as_snapshot_ops() {
            Some(ops) if self.capabilities().supports(Capability::Snapshot) => Ok(ops),
            _ => Err(self.unsupported(Capability::Snapshot)),
        }
    }

    pub fn backup_ops(&self) -> StowageResult<&dyn BackupOperations> {
        match self.as_backup_ops() {
            Some(ops) if self.capabilities().supports(Capability::Backup) => Ok(ops),
            _ => Err(self.unsupported(Capability::Backup)),
        }
    }
}

#[async_trait::async_trait]
pub trait VolumeOperations: Send + Sync {
    /// Size used when a create request does not carry one.
    fn default_volume_size(&self) -> u64;

    /// Allocate backing storage for `volume` and fill in its driver fields.
    /// The caller persists the record.
    async fn create_volume(
        &self,
        volume: &mut Volume,
        opts: &CreateVolumeOptions,
    ) -> StowageResult<()>;

    async fn delete_volume(&self, volume: &Volume) -> StowageResult<()>;

    /// Location the volume's data is exposed at (device node or image file).
    async fn mount_path(&self, volume: &Volume) -> StowageResult<PathBuf>;
}

#[async_trait::async_trait]
pub trait SnapshotOperations: Send + Sync {
    /// Capture `volume` into `snapshot` and fill in its driver fields.
    /// The caller adds the snapshot to the volume record and persists it.
    async fn create_snapshot(&self, snapshot: &mut Snapshot, volume: &Volume) -> StowageResult<()>;

    async fn delete_snapshot(&self, snapshot: &Snapshot, volume: &Volume) -> StowageResult<()>;

    /// Expose the snapshot for block reads. Persists the activated flag itself.
    /// Activating an activated snapshot is a no-op.
    async fn activate_snapshot(&self, snapshot_id: &str, volume_id: &str)
        -> StowageResult<PathBuf>;

    /// Withdraw the snapshot's device. Persists the flag itself.
    /// Deactivating a deactivated snapshot is a no-op.
    async fn deactivate_snapshot(&self, snapshot_id: &str, volume_id: &str) -> StowageResult<()>;
}

/// Callbacks a backup destination uses to pull snapshot data out of a driver.
#[async_trait::async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn has_snapshot(&self, snapshot_id: &str, volume_id: &str) -> bool;

    /// Extents of `snapshot_id` that differ from `compare_id`. Without a distinct
    /// `compare_id` every allocated extent is returned with `include_same` set.
    async fn compare_snapshot(
        &self,
        snapshot_id: &str,
        compare_id: Option<&str>,
        volume_id: &str,
    ) -> StowageResult<BlockMapping>;

    async fn open_snapshot(&self, snapshot_id: &str, volume_id: &str) -> StowageResult<()>;

    async fn close_snapshot(&self, snapshot_id: &str, volume_id: &str) -> StowageResult<()>;

    /// Fill `buf` from `offset` of an opened snapshot.
    async fn read_snapshot(
        &self,
        snapshot_id: &str,
        volume_id: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> StowageResult<()>;
}

#[async_trait::async_trait]
pub trait BackupOperations: SnapshotSource {
    /// Upload `snapshot_id` to `dest_url`, returning the URL of the new backup.
    async fn create_backup(
        &self,
        snapshot_id: &str,
        volume_id: &str,
        dest_url: &str,
        opts: &BackupOptions,
    ) -> StowageResult<String>;
}
