//! Loopback driver: volumes are sparse image files, snapshots are full copies of them.
//!
//! It has no block-level change tracking, so it offers volume and snapshot operations only.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use stowage_common::{
    Capabilities, Capability, CreateVolumeOptions, Driver, MetadataStore, ResultExt, Snapshot,
    SnapshotOperations, StowageError, StowageResult, Volume, VolumeOperations,
};

pub const DRIVER_NAME: &str = "loopback";

const LOOPBACK_DIR: &str = "loopback";
const IMAGE_SUFFIX: &str = ".img";

#[derive(Debug)]
pub struct LoopbackDriver {
    dir: PathBuf,
    metadata: Arc<MetadataStore>,
    default_volume_size: u64,
}

impl LoopbackDriver {
    pub fn new(
        root: &Path,
        metadata: Arc<MetadataStore>,
        default_volume_size: u64,
    ) -> StowageResult<Self> {
        let dir = root.join(LOOPBACK_DIR);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create image directory {}", dir.display()))?;
        Ok(Self {
            dir,
            metadata,
            default_volume_size,
        })
    }

    fn image_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}{IMAGE_SUFFIX}"))
    }

    fn load_snapshot(&self, snapshot_id: &str, volume_id: &str) -> StowageResult<(Volume, Snapshot)> {
        let volume = self.metadata.load(volume_id)?;
        let snapshot = volume.snapshot(snapshot_id).cloned().ok_or_else(|| {
            StowageError::NotFound(format!("Snapshot {snapshot_id} of volume {volume_id}"))
        })?;
        Ok((volume, snapshot))
    }

    async fn set_activated(&self, snapshot_id: &str, volume_id: &str, activated: bool) -> StowageResult<PathBuf> {
        let (mut volume, snapshot) = self.load_snapshot(snapshot_id, volume_id)?;
        let image = self.image_path(snapshot_id);
        if !tokio::fs::try_exists(&image).await.unwrap_or(false) {
            return Err(StowageError::Driver(format!(
                "Image {} of snapshot {snapshot_id} is missing",
                image.display()
            )));
        }

        if snapshot.activated != activated {
            if let Some(record) = volume.snapshot_mut(snapshot_id) {
                record.activated = activated;
                record.path = activated.then(|| image.clone());
            }
            self.metadata.save(&volume)?;
        }
        Ok(image)
    }
}

async fn remove_image(path: &Path) -> StowageResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StowageError::Io(e).context(format!("remove {}", path.display()))),
    }
}

#[async_trait::async_trait]
impl Driver for LoopbackDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
            .with(Capability::Volume)
            .with(Capability::Snapshot)
    }

    async fn info(&self) -> StowageResult<BTreeMap<String, String>> {
        Ok(BTreeMap::from([
            ("image_dir".to_string(), self.dir.display().to_string()),
            (
                "default_volume_size".to_string(),
                self.default_volume_size.to_string(),
            ),
        ]))
    }

    fn as_volume_ops(&self) -> Option<&dyn VolumeOperations> {
        Some(self)
    }

    fn as_snapshot_ops(&self) -> Option<&dyn SnapshotOperations> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl VolumeOperations for LoopbackDriver {
    fn default_volume_size(&self) -> u64 {
        self.default_volume_size
    }

    async fn create_volume(
        &self,
        volume: &mut Volume,
        opts: &CreateVolumeOptions,
    ) -> StowageResult<()> {
        if opts.backup_url.is_some() {
            return Err(StowageError::UnsupportedCapability {
                driver: DRIVER_NAME.to_string(),
                capability: Capability::Backup.to_string(),
            });
        }
        if volume.size == 0 {
            return Err(StowageError::InvalidState(format!(
                "Volume {} needs a positive size",
                volume.id
            )));
        }

        let path = self.image_path(&volume.id);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .with_context(|| format!("create image {}", path.display()))?;
        if let Err(e) = file.set_len(volume.size).await {
            drop(file);
            remove_image(&path).await?;
            return Err(StowageError::Io(e).context(format!("size image {}", path.display())));
        }

        volume.path = Some(path);
        tracing::info!(volume = %volume.id, size = volume.size, "Created loopback image");
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
        for snapshot in volume.snapshots.keys() {
            remove_image(&self.image_path(snapshot)).await?;
        }
        remove_image(&self.image_path(&volume.id)).await?;
        tracing::info!(volume = %volume.id, "Deleted loopback image");
        Ok(())
    }

    async fn mount_path(&self, volume: &Volume) -> StowageResult<PathBuf> {
        Ok(self.image_path(&volume.id))
    }
}

#[async_trait::async_trait]
impl SnapshotOperations for LoopbackDriver {
    async fn create_snapshot(&self, snapshot: &mut Snapshot, volume: &Volume) -> StowageResult<()> {
        let source = self.image_path(&volume.id);
        let target = self.image_path(&snapshot.id);
        tokio::fs::copy(&source, &target)
            .await
            .with_context(|| format!("copy {} to {}", source.display(), target.display()))?;
        tracing::info!(volume = %volume.id, snapshot = %snapshot.id, "Copied loopback snapshot");
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot: &Snapshot, volume: &Volume) -> StowageResult<()> {
        if snapshot.activated {
            return Err(StowageError::InvalidState(format!(
                "Snapshot {} of volume {} is activated",
                snapshot.id, volume.id
            )));
        }
        remove_image(&self.image_path(&snapshot.id)).await
    }

    async fn activate_snapshot(&self, snapshot_id: &str, volume_id: &str) -> StowageResult<PathBuf> {
        self.set_activated(snapshot_id, volume_id, true).await
    }

    async fn deactivate_snapshot(&self, snapshot_id: &str, volume_id: &str) -> StowageResult<()> {
        self.set_activated(snapshot_id, volume_id, false).await?;
        Ok(())
    }
}
