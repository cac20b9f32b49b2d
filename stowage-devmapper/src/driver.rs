use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use stowage_common::{
    read_json, write_json_atomic, Capabilities, Capability, CreateVolumeOptions, Driver,
    MetadataStore, Snapshot, SnapshotOperations, StowageError, StowageResult, Volume,
    VolumeOperations,
};
use stowage_config::SECTOR_SIZE;
use stowage_object_storage::BackupStore;

use crate::{dmsetup::DmsetupThinPool, pool::ThinPool};

pub const DRIVER_NAME: &str = "devmapper";

const STATE_FILE: &str = "devmapper.json";

/// Pool bookkeeping that has to survive restarts.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct DeviceState {
    pool_name: String,
    block_size_sectors: u64,
    next_dev_id: u32,
}

/// Thin-provisioning driver. Volumes and snapshots are thin devices in one pool; the volume
/// device is kept active under the volume id, snapshot devices are only active between
/// activate and deactivate.
#[derive(Debug)]
pub struct ThinDriver {
    state_path: PathBuf,
    pub(crate) metadata: Arc<MetadataStore>,
    pub(crate) pool: Arc<dyn ThinPool>,
    pub(crate) backups: Arc<BackupStore>,
    default_volume_size: u64,
    state: parking_lot::Mutex<DeviceState>,
}

impl ThinDriver {
    pub fn new(
        root: &Path,
        metadata: Arc<MetadataStore>,
        pool: Arc<dyn ThinPool>,
        backups: Arc<BackupStore>,
        default_volume_size: u64,
    ) -> StowageResult<Self> {
        let state_path = root.join(STATE_FILE);
        let state = match read_json::<DeviceState>(&state_path)? {
            Some(state) => {
                if state.pool_name != pool.name()
                    || state.block_size_sectors != pool.block_size_sectors()
                {
                    return Err(StowageError::InvalidState(format!(
                        "Driver state {} belongs to pool {} with block size {}, not {} with {}",
                        state_path.display(),
                        state.pool_name,
                        state.block_size_sectors,
                        pool.name(),
                        pool.block_size_sectors()
                    )));
                }
                state
            }
            None => {
                let state = DeviceState {
                    pool_name: pool.name().to_string(),
                    block_size_sectors: pool.block_size_sectors(),
                    next_dev_id: 1,
                };
                write_json_atomic(&state_path, &state)?;
                tracing::info!(pool = %state.pool_name, "Initialized devmapper driver state");
                state
            }
        };

        Ok(Self {
            state_path,
            metadata,
            pool,
            backups,
            default_volume_size,
            state: parking_lot::Mutex::new(state),
        })
    }

    /// Build the driver over the kernel pool described by `config`.
    pub async fn from_config(
        config: &stowage_config::Config,
        root: &Path,
        metadata: Arc<MetadataStore>,
        backups: Arc<BackupStore>,
    ) -> StowageResult<Self> {
        let (Some(data), Some(meta)) = (&config.dm_data_device, &config.dm_metadata_device) else {
            return Err(StowageError::InvalidState(
                "STOWAGE_DM_DATA_DEVICE and STOWAGE_DM_METADATA_DEVICE are required for the devmapper driver"
                    .to_string(),
            ));
        };
        let pool =
            DmsetupThinPool::open_or_create(&config.dm_pool_name, data, meta, config.dm_block_size)
                .await?;
        Self::new(
            root,
            metadata,
            Arc::new(pool),
            backups,
            config.dm_default_volume_size,
        )
    }

    pub(crate) fn block_size(&self) -> u64 {
        self.pool.block_size_sectors() * SECTOR_SIZE
    }

    fn allocate_dev_id(&self) -> StowageResult<u32> {
        let mut state = self.state.lock();
        let dev_id = state.next_dev_id;
        let mut next = state.clone();
        next.next_dev_id += 1;
        write_json_atomic(&self.state_path, &next)?;
        *state = next;
        Ok(dev_id)
    }

    pub(crate) fn load_snapshot(
        &self,
        snapshot_id: &str,
        volume_id: &str,
    ) -> StowageResult<(Volume, Snapshot)> {
        let volume = self.metadata.load(volume_id)?;
        let snapshot = volume.snapshot(snapshot_id).cloned().ok_or_else(|| {
            StowageError::NotFound(format!("Snapshot {snapshot_id} of volume {volume_id}"))
        })?;
        Ok((volume, snapshot))
    }

    fn dev_id_of(kind: &str, id: &str, dev_id: Option<u32>) -> StowageResult<u32> {
        dev_id.ok_or_else(|| {
            StowageError::InvalidState(format!("{kind} {id} has no thin device assigned"))
        })
    }

    async fn remove_if_active(&self, name: &str) -> StowageResult<()> {
        if self.pool.is_active(name).await? {
            self.pool.remove(name).await?;
        }
        Ok(())
    }

    async fn discard_thin(&self, name: &str, dev_id: u32) {
        if let Err(e) = self.remove_if_active(name).await {
            tracing::warn!(device = %name, error = %e, "Failed to remove device during cleanup");
        }
        if let Err(e) = self.pool.delete_thin(dev_id).await {
            tracing::warn!(dev_id, error = %e, "Failed to delete thin device during cleanup");
        }
    }
}

#[async_trait::async_trait]
impl Driver for ThinDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
            .with(Capability::Volume)
            .with(Capability::Snapshot)
            .with(Capability::Backup)
    }

    async fn info(&self) -> StowageResult<BTreeMap<String, String>> {
        let mut info = self.pool.status().await?;
        let state = self.state.lock().clone();
        info.insert("block_size".to_string(), self.block_size().to_string());
        info.insert(
            "default_volume_size".to_string(),
            self.default_volume_size.to_string(),
        );
        info.insert("next_dev_id".to_string(), state.next_dev_id.to_string());
        Ok(info)
    }

    fn as_volume_ops(&self) -> Option<&dyn VolumeOperations> {
        Some(self)
    }

    fn as_snapshot_ops(&self) -> Option<&dyn SnapshotOperations> {
        Some(self)
    }

    fn as_backup_ops(&self) -> Option<&dyn stowage_common::BackupOperations> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl VolumeOperations for ThinDriver {
    fn default_volume_size(&self) -> u64 {
        self.default_volume_size
    }

    async fn create_volume(
        &self,
        volume: &mut Volume,
        opts: &CreateVolumeOptions,
    ) -> StowageResult<()> {
        if let Some(backup_url) = &opts.backup_url {
            let backup = self.backups.inspect(backup_url).await?;
            volume.size = backup.volume_size;
            if volume.filesystem.is_none() {
                volume.filesystem = backup.filesystem;
            }
        }
        let block_size = self.block_size();
        if volume.size == 0 || volume.size % block_size != 0 {
            return Err(StowageError::InvalidState(format!(
                "Volume size {} is not a positive multiple of the pool block size {block_size}",
                volume.size
            )));
        }

        let dev_id = self.allocate_dev_id()?;
        self.pool.create_thin(dev_id).await?;
        let path = match self.pool.activate(&volume.id, dev_id, volume.size).await {
            Ok(path) => path,
            Err(e) => {
                self.discard_thin(&volume.id, dev_id).await;
                return Err(e);
            }
        };

        if let Some(backup_url) = &opts.backup_url {
            if let Err(e) = self.backups.restore_to_path(backup_url, &path).await {
                self.discard_thin(&volume.id, dev_id).await;
                return Err(e);
            }
        }

        volume.dev_id = Some(dev_id);
        volume.path = Some(path);
        tracing::info!(
            volume = %volume.id,
            dev_id,
            size = volume.size,
            restored = opts.backup_url.is_some(),
            "Created thin volume"
        );
        Ok(())
    }

    async fn delete_volume(&self, volume: &Volume) -> StowageResult<()> {
        let active = volume.activated_snapshots();
        if !active.is_empty() {
            return Err(StowageError::InvalidState(format!(
                "Volume {} still has activated snapshots: {}",
                volume.id,
                active.join(", ")
            )));
        }

        for snapshot in volume.snapshots.values() {
            self.remove_if_active(&snapshot.id).await?;
            if let Some(dev_id) = snapshot.dev_id {
                self.pool.delete_thin(dev_id).await?;
            }
        }

        let dev_id = Self::dev_id_of("Volume", &volume.id, volume.dev_id)?;
        self.remove_if_active(&volume.id).await?;
        self.pool.delete_thin(dev_id).await?;
        tracing::info!(volume = %volume.id, dev_id, "Deleted thin volume");
        Ok(())
    }

    async fn mount_path(&self, volume: &Volume) -> StowageResult<PathBuf> {
        if self.pool.is_active(&volume.id).await? {
            return Ok(self.pool.device_path(&volume.id));
        }
        let dev_id = Self::dev_id_of("Volume", &volume.id, volume.dev_id)?;
        self.pool.activate(&volume.id, dev_id, volume.size).await
    }
}

#[async_trait::async_trait]
impl SnapshotOperations for ThinDriver {
    async fn create_snapshot(&self, snapshot: &mut Snapshot, volume: &Volume) -> StowageResult<()> {
        let origin = Self::dev_id_of("Volume", &volume.id, volume.dev_id)?;
        let origin_name = if self.pool.is_active(&volume.id).await? {
            Some(volume.id.as_str())
        } else {
            None
        };

        let dev_id = self.allocate_dev_id()?;
        self.pool
            .create_snapshot(dev_id, origin, origin_name)
            .await?;
        snapshot.dev_id = Some(dev_id);
        tracing::info!(
            volume = %volume.id,
            snapshot = %snapshot.id,
            dev_id,
            origin,
            "Created thin snapshot"
        );
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot: &Snapshot, volume: &Volume) -> StowageResult<()> {
        if snapshot.activated || self.pool.is_active(&snapshot.id).await? {
            return Err(StowageError::InvalidState(format!(
                "Snapshot {} of volume {} is activated",
                snapshot.id, volume.id
            )));
        }
        let dev_id = Self::dev_id_of("Snapshot", &snapshot.id, snapshot.dev_id)?;
        self.pool.delete_thin(dev_id).await?;
        tracing::info!(volume = %volume.id, snapshot = %snapshot.id, dev_id, "Deleted thin snapshot");
        Ok(())
    }

    async fn activate_snapshot(
        &self,
        snapshot_id: &str,
        volume_id: &str,
    ) -> StowageResult<PathBuf> {
        let (mut volume, snapshot) = self.load_snapshot(snapshot_id, volume_id)?;
        let was_active = self.pool.is_active(snapshot_id).await?;
        let path = if was_active {
            self.pool.device_path(snapshot_id)
        } else {
            let dev_id = Self::dev_id_of("Snapshot", snapshot_id, snapshot.dev_id)?;
            self.pool.activate(snapshot_id, dev_id, volume.size).await?
        };

        if !snapshot.activated || snapshot.path.as_deref() != Some(path.as_path()) {
            if let Some(record) = volume.snapshot_mut(snapshot_id) {
                record.activated = true;
                record.path = Some(path.clone());
            }
            if let Err(e) = self.metadata.save(&volume) {
                if !was_active {
                    if let Err(remove_err) = self.remove_if_active(snapshot_id).await {
                        tracing::error!(
                            snapshot = %snapshot_id,
                            error = %remove_err,
                            "Failed to remove snapshot device after failed activation"
                        );
                    }
                }
                return Err(e.context(format!("activate snapshot {snapshot_id}")));
            }
        }
        tracing::debug!(volume = %volume_id, snapshot = %snapshot_id, path = %path.display(), "Snapshot activated");
        Ok(path)
    }

    async fn deactivate_snapshot(&self, snapshot_id: &str, volume_id: &str) -> StowageResult<()> {
        let (mut volume, snapshot) = self.load_snapshot(snapshot_id, volume_id)?;
        self.remove_if_active(snapshot_id).await?;

        if snapshot.activated || snapshot.path.is_some() {
            if let Some(record) = volume.snapshot_mut(snapshot_id) {
                record.activated = false;
                record.path = None;
            }
            self.metadata.save(&volume)?;
        }
        tracing::debug!(volume = %volume_id, snapshot = %snapshot_id, "Snapshot deactivated");
        Ok(())
    }
}
