//! Differential backup engine.
//!
//! Snapshots are uploaded to any `object_store` destination as content addressed chunks. Each
//! backup writes a manifest listing its chunks, and a per-volume chain record remembers the
//! newest backup so the next one only carries the extents that changed since.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use stowage_common::{
    ResultExt, SnapshotDescriptor, SnapshotSource, StowageResult, VolumeDescriptor,
};
use tokio::io::{AsyncSeek, AsyncWrite};

mod catalog;
pub mod destination;
pub mod manifest;
mod restore;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod upload;

pub use destination::{BackupLocator, BackupTargets, Destination};
pub use manifest::{BackupManifest, BackupSummary, BlockRef, ChainRecord};

#[derive(Debug)]
pub struct BackupStore {
    targets: Arc<BackupTargets>,
    chunk_size: u64,
}

impl BackupStore {
    pub fn new(targets: Arc<BackupTargets>, chunk_size: u64) -> Self {
        Self {
            targets,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn targets(&self) -> &Arc<BackupTargets> {
        &self.targets
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Back up `snapshot` of `volume` to `dest_url`, incrementally when the destination already
    /// holds a backup of a snapshot the source still has. Returns the new backup's URL.
    pub async fn create_backup(
        &self,
        volume: &VolumeDescriptor,
        snapshot: &SnapshotDescriptor,
        dest_url: &str,
        source: &dyn SnapshotSource,
        labels: &BTreeMap<String, String>,
    ) -> StowageResult<String> {
        let destination = self.targets.resolve(dest_url)?;
        upload::create_backup(
            &destination,
            upload::UploadRequest {
                volume,
                snapshot,
                source,
                chunk_size: self.chunk_size,
                labels,
            },
        )
        .await
    }

    /// Backups stored at `dest_url`, optionally limited to one volume.
    pub async fn list(
        &self,
        dest_url: &str,
        volume_id: Option<&str>,
    ) -> StowageResult<Vec<BackupSummary>> {
        let destination = self.targets.resolve(dest_url)?;
        let volume_ids = match volume_id {
            Some(id) => vec![id.to_string()],
            None => catalog::volume_ids(&destination).await?,
        };

        let mut summaries = Vec::new();
        for volume_id in &volume_ids {
            for manifest in catalog::manifests(&destination, volume_id).await? {
                let url = destination.locator(&manifest.id, volume_id).url();
                summaries.push(BackupSummary::new(url, &manifest));
            }
        }
        Ok(summaries)
    }

    pub async fn inspect(&self, backup_url: &str) -> StowageResult<BackupSummary> {
        let locator = BackupLocator::parse(backup_url)?;
        let destination = self.targets.resolve(&locator.destination)?;
        let manifest = destination
            .load_manifest(&locator.volume_id, &locator.backup_id)
            .await?;
        Ok(BackupSummary::new(locator.url(), &manifest))
    }

    pub async fn delete(&self, backup_url: &str) -> StowageResult<()> {
        let locator = BackupLocator::parse(backup_url)?;
        let destination = self.targets.resolve(&locator.destination)?;
        catalog::delete(&destination, &locator.volume_id, &locator.backup_id).await
    }

    /// Replay the backup at `backup_url` and its ancestors into `writer`. Returns the volume size.
    pub async fn restore<W>(&self, backup_url: &str, writer: &mut W) -> StowageResult<u64>
    where
        W: AsyncWrite + AsyncSeek + Unpin + Send,
    {
        let locator = BackupLocator::parse(backup_url)?;
        let destination = self.targets.resolve(&locator.destination)?;
        restore::restore(
            &destination,
            &locator.volume_id,
            &locator.backup_id,
            writer,
        )
        .await
    }

    /// Restore into a device node or image file, sizing regular files to the volume first.
    pub async fn restore_to_path(&self, backup_url: &str, path: &Path) -> StowageResult<u64> {
        let size = self.inspect(backup_url).await?.volume_size;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await
            .with_context(|| format!("open restore target {}", path.display()))?;

        let is_file = file
            .metadata()
            .await
            .with_context(|| format!("stat restore target {}", path.display()))?
            .is_file();
        if is_file {
            file.set_len(size)
                .await
                .with_context(|| format!("size restore target {}", path.display()))?;
        }

        self.restore(backup_url, &mut file).await?;
        file.sync_all()
            .await
            .with_context(|| format!("sync restore target {}", path.display()))?;
        Ok(size)
    }
}
