//! Daemon operations.
//!
//! Every operation resolves names and identifier prefixes through the index, reads or mutates
//! the metadata store and hands device work to the volume's driver. Mutations hold the
//! coordinator's write guard for their whole duration.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use stowage_common::{
    generate_id, BackupOptions, CreateVolumeOptions, Driver, MetadataStore, Snapshot,
    SnapshotOperations, StowageError, StowageResult, Volume,
};
use stowage_config::Config;
use stowage_devmapper::ThinDriver;
use stowage_loopback::LoopbackDriver;
use stowage_object_storage::{BackupStore, BackupSummary};

use crate::{
    coordinator::Coordinator,
    daemon_config::DaemonConfig,
    index::{Category, IdentifierIndex},
    registry::DriverRegistry,
    sys::{DriverInfo, SystemInfo},
};

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct CreateVolumeRequest {
    #[serde(default)]
    pub name: Option<String>,
    /// Registered driver name, the default driver is used when absent.
    #[serde(default)]
    pub driver: Option<String>,
    /// Size in bytes
    #[serde(default)]
    pub size: Option<u64>,
    /// Backup URL to create the volume from.
    #[serde(default)]
    pub backup: Option<String>,
    #[serde(default)]
    pub filesystem: Option<String>,
    #[serde(default)]
    pub driver_opts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct CreateSnapshotRequest {
    /// Name, identifier or identifier prefix of the volume.
    pub volume: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct CreateBackupRequest {
    /// Name, identifier or identifier prefix of the snapshot.
    pub snapshot: String,
    /// Destination URL, for example `s3://bucket/prefix`.
    pub dest: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct Runtime {
    root: PathBuf,
    metadata: Arc<MetadataStore>,
    registry: DriverRegistry,
    backups: Arc<BackupStore>,
    coordinator: Coordinator<IdentifierIndex>,
}

/// Instantiate the drivers named in `config`, in order. The configured default driver is
/// selected when it is one of them.
pub async fn build_drivers(
    config: &Config,
    daemon: &DaemonConfig,
    metadata: Arc<MetadataStore>,
    backups: Arc<BackupStore>,
) -> StowageResult<DriverRegistry> {
    let mut registry = DriverRegistry::new();
    for name in &daemon.drivers {
        let driver: Arc<dyn Driver> = match name.as_str() {
            stowage_devmapper::DRIVER_NAME => Arc::new(
                ThinDriver::from_config(config, &daemon.root, metadata.clone(), backups.clone())
                    .await?,
            ),
            stowage_loopback::DRIVER_NAME => Arc::new(LoopbackDriver::new(
                &daemon.root,
                metadata.clone(),
                config.loopback_default_volume_size,
            )?),
            other => return Err(StowageError::NotFound(format!("Driver {other}"))),
        };
        registry.register(name, driver)?;
    }
    registry.set_default(&daemon.default_driver)?;
    Ok(registry)
}

impl Runtime {
    /// Build the runtime and its identifier index from the persisted records.
    pub fn open(
        root: &Path,
        metadata: Arc<MetadataStore>,
        registry: DriverRegistry,
        backups: Arc<BackupStore>,
    ) -> StowageResult<Self> {
        let index = IdentifierIndex::rebuild_from_store(&metadata)
            .map_err(|e| e.context("rebuild identifier index"))?;
        Ok(Self {
            root: root.to_path_buf(),
            metadata,
            registry,
            backups,
            coordinator: Coordinator::new(index),
        })
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    pub fn backups(&self) -> &Arc<BackupStore> {
        &self.backups
    }

    fn driver_of(&self, volume: &Volume) -> StowageResult<Arc<dyn Driver>> {
        self.registry.get(&volume.driver)
    }

    fn load_snapshot(
        &self,
        index: &IdentifierIndex,
        reference: &str,
    ) -> StowageResult<(Volume, Snapshot)> {
        let snapshot_id = index.lookup(Category::Snapshot, reference)?;
        let volume_id = index.parent_of(&snapshot_id)?;
        let volume = self.metadata.load(&volume_id)?;
        let snapshot = volume.snapshot(&snapshot_id).cloned().ok_or_else(|| {
            StowageError::NotFound(format!("Snapshot {snapshot_id} of volume {volume_id}"))
        })?;
        Ok((volume, snapshot))
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn info(&self) -> StowageResult<SystemInfo> {
        let index = self.coordinator.read().await?;
        let mut drivers = Vec::new();
        for (name, driver) in self.registry.iter() {
            drivers.push(DriverInfo {
                name: name.to_string(),
                capabilities: driver.capabilities().list(),
                info: driver.info().await?,
            });
        }
        Ok(SystemInfo {
            stowage_version: env!("CARGO_PKG_VERSION").to_string(),
            root: self.root.clone(),
            default_driver: self.registry.default_name().map(str::to_string),
            drivers,
            volumes: index.count(Category::Volume),
            snapshots: index.count(Category::Snapshot),
        })
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn create_volume(&self, request: CreateVolumeRequest) -> StowageResult<Volume> {
        let mut index = self.coordinator.write().await?;
        if let Some(name) = &request.name {
            if let Ok(id) = index.resolve_name(Category::Volume, name) {
                return Err(StowageError::Conflict(format!(
                    "Volume name {name} is already used by {id}"
                )));
            }
        }

        let driver = self.registry.get_or_default(request.driver.as_deref())?;
        let ops = driver.volume_ops()?;
        let size = request.size.unwrap_or_else(|| ops.default_volume_size());
        let mut volume = Volume::new(generate_id(), request.name.clone(), size, driver.name());
        volume.filesystem = request.filesystem.clone();
        let opts = CreateVolumeOptions {
            size: request.size,
            backup_url: request.backup.clone(),
            filesystem: request.filesystem.clone(),
            driver_opts: request.driver_opts.clone(),
        };
        ops.create_volume(&mut volume, &opts).await?;

        if let Err(e) = index.add_volume(&volume) {
            Self::rollback_volume(driver.as_ref(), &volume).await;
            return Err(e);
        }
        if let Err(e) = self.metadata.save(&volume) {
            index.remove_volume(&volume);
            Self::rollback_volume(driver.as_ref(), &volume).await;
            return Err(e);
        }

        tracing::info!(volume = %volume.id, name = volume.display_name(), driver = %volume.driver, "Created volume");
        Ok(volume)
    }

    async fn rollback_volume(driver: &dyn Driver, volume: &Volume) {
        let result = match driver.volume_ops() {
            Ok(ops) => ops.delete_volume(volume).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(volume = %volume.id, error = %e, "Failed to roll back volume");
        }
    }

    /// Delete a volume and its snapshots. With `reference_only` the driver is not called and the
    /// backing storage is left in place.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn delete_volume(&self, reference: &str, reference_only: bool) -> StowageResult<()> {
        let mut index = self.coordinator.write().await?;
        let id = index.lookup(Category::Volume, reference)?;
        let volume = self.metadata.load(&id)?;

        let active = volume.activated_snapshots();
        if !active.is_empty() {
            return Err(StowageError::InvalidState(format!(
                "Volume {id} still has activated snapshots: {}",
                active.join(", ")
            )));
        }
        if let Some(mount_point) = &volume.mount_point {
            return Err(StowageError::InvalidState(format!(
                "Volume {id} is mounted at {}",
                mount_point.display()
            )));
        }

        if !reference_only {
            self.driver_of(&volume)?
                .volume_ops()?
                .delete_volume(&volume)
                .await?;
        }
        self.metadata.remove(&id)?;
        index.remove_volume(&volume);
        tracing::info!(volume = %id, reference_only, "Deleted volume");
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn list_volumes(&self) -> StowageResult<Vec<Volume>> {
        let _index = self.coordinator.read().await?;
        let mut volumes = self.metadata.load_all()?;
        volumes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(volumes)
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn inspect_volume(&self, reference: &str) -> StowageResult<Volume> {
        let index = self.coordinator.read().await?;
        let id = index.lookup(Category::Volume, reference)?;
        self.metadata.load(&id)
    }

    /// Expose the volume and record where it is exposed.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn mount_volume(&self, reference: &str) -> StowageResult<PathBuf> {
        let index = self.coordinator.write().await?;
        let id = index.lookup(Category::Volume, reference)?;
        let mut volume = self.metadata.load(&id)?;
        let path = self
            .driver_of(&volume)?
            .volume_ops()?
            .mount_path(&volume)
            .await?;
        if volume.mount_point.as_ref() != Some(&path) {
            volume.mount_point = Some(path.clone());
            self.metadata.save(&volume)?;
        }
        tracing::info!(volume = %id, path = %path.display(), "Mounted volume");
        Ok(path)
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn umount_volume(&self, reference: &str) -> StowageResult<()> {
        let index = self.coordinator.write().await?;
        let id = index.lookup(Category::Volume, reference)?;
        let mut volume = self.metadata.load(&id)?;
        if volume.mount_point.take().is_some() {
            self.metadata.save(&volume)?;
            tracing::info!(volume = %id, "Unmounted volume");
        }
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn create_snapshot(&self, request: CreateSnapshotRequest) -> StowageResult<Snapshot> {
        let mut index = self.coordinator.write().await?;
        let volume_id = index.lookup(Category::Volume, &request.volume)?;
        if let Some(name) = &request.name {
            if let Ok(id) = index.resolve_name(Category::Snapshot, name) {
                return Err(StowageError::Conflict(format!(
                    "Snapshot name {name} is already used by {id}"
                )));
            }
        }

        let mut volume = self.metadata.load(&volume_id)?;
        let driver = self.driver_of(&volume)?;
        let ops = driver.snapshot_ops()?;
        let mut snapshot = Snapshot::new(generate_id(), request.name.clone(), &volume_id);
        ops.create_snapshot(&mut snapshot, &volume).await?;

        if let Err(e) = index.add_snapshot(&snapshot, &volume_id) {
            Self::rollback_snapshot(ops, &snapshot, &volume).await;
            return Err(e);
        }
        volume.snapshots.insert(snapshot.id.clone(), snapshot.clone());
        if let Err(e) = self.metadata.save(&volume) {
            index.remove_snapshot(&snapshot);
            Self::rollback_snapshot(ops, &snapshot, &volume).await;
            return Err(e);
        }

        tracing::info!(volume = %volume_id, snapshot = %snapshot.id, "Created snapshot");
        Ok(snapshot)
    }

    async fn rollback_snapshot(
        ops: &dyn SnapshotOperations,
        snapshot: &Snapshot,
        volume: &Volume,
    ) {
        if let Err(e) = ops.delete_snapshot(snapshot, volume).await {
            tracing::warn!(snapshot = %snapshot.id, error = %e, "Failed to roll back snapshot");
        }
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn delete_snapshot(&self, reference: &str) -> StowageResult<()> {
        let mut index = self.coordinator.write().await?;
        let (mut volume, snapshot) = self.load_snapshot(&index, reference)?;
        if snapshot.activated {
            return Err(StowageError::InvalidState(format!(
                "Snapshot {} is activated",
                snapshot.id
            )));
        }

        self.driver_of(&volume)?
            .snapshot_ops()?
            .delete_snapshot(&snapshot, &volume)
            .await?;
        volume.snapshots.shift_remove(&snapshot.id);
        self.metadata.save(&volume)?;
        index.remove_snapshot(&snapshot);
        tracing::info!(volume = %volume.id, snapshot = %snapshot.id, "Deleted snapshot");
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn inspect_snapshot(&self, reference: &str) -> StowageResult<Snapshot> {
        let index = self.coordinator.read().await?;
        let (_, snapshot) = self.load_snapshot(&index, reference)?;
        Ok(snapshot)
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn activate_snapshot(&self, reference: &str) -> StowageResult<PathBuf> {
        let index = self.coordinator.write().await?;
        let (volume, snapshot) = self.load_snapshot(&index, reference)?;
        self.driver_of(&volume)?
            .snapshot_ops()?
            .activate_snapshot(&snapshot.id, &volume.id)
            .await
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn deactivate_snapshot(&self, reference: &str) -> StowageResult<()> {
        let index = self.coordinator.write().await?;
        let (volume, snapshot) = self.load_snapshot(&index, reference)?;
        self.driver_of(&volume)?
            .snapshot_ops()?
            .deactivate_snapshot(&snapshot.id, &volume.id)
            .await
    }

    /// Back up a snapshot to `request.dest` and return the backup URL.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn create_backup(&self, request: CreateBackupRequest) -> StowageResult<String> {
        let index = self.coordinator.write().await?;
        let (volume, snapshot) = self.load_snapshot(&index, &request.snapshot)?;
        let opts = BackupOptions {
            labels: request.labels.clone(),
        };
        let url = self
            .driver_of(&volume)?
            .backup_ops()?
            .create_backup(&snapshot.id, &volume.id, &request.dest, &opts)
            .await?;
        tracing::info!(volume = %volume.id, snapshot = %snapshot.id, backup = %url, "Created backup");
        Ok(url)
    }

    /// Backups at `dest`. A volume reference that is not known locally is used as a raw volume
    /// identifier, so backups of deleted volumes stay listable.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn list_backups(
        &self,
        dest: &str,
        volume: Option<&str>,
    ) -> StowageResult<Vec<BackupSummary>> {
        let index = self.coordinator.read().await?;
        let volume_id = match volume {
            Some(reference) => match index.lookup(Category::Volume, reference) {
                Ok(id) => Some(id),
                Err(StowageError::NotFound(_)) => Some(reference.to_string()),
                Err(e) => return Err(e),
            },
            None => None,
        };
        self.backups.list(dest, volume_id.as_deref()).await
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn inspect_backup(&self, url: &str) -> StowageResult<BackupSummary> {
        let _index = self.coordinator.read().await?;
        self.backups.inspect(url).await
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn delete_backup(&self, url: &str) -> StowageResult<()> {
        let _index = self.coordinator.write().await?;
        self.backups.delete(url).await?;
        tracing::info!(backup = %url, "Deleted backup");
        Ok(())
    }

    /// Wait for the in-flight mutation and refuse every later operation.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }
}
