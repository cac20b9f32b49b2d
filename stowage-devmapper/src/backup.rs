use std::io::SeekFrom;

use stowage_common::{
    BackupOperations, BackupOptions, BlockMapping, ResultExt, SnapshotDescriptor, SnapshotOperations,
    SnapshotSource, StowageError, StowageResult, VolumeDescriptor,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{delta::parse_thin_delta, driver::ThinDriver};

#[async_trait::async_trait]
impl SnapshotSource for ThinDriver {
    async fn has_snapshot(&self, snapshot_id: &str, volume_id: &str) -> bool {
        self.load_snapshot(snapshot_id, volume_id).is_ok()
    }

    async fn compare_snapshot(
        &self,
        snapshot_id: &str,
        compare_id: Option<&str>,
        volume_id: &str,
    ) -> StowageResult<BlockMapping> {
        let compare_id = compare_id
            .filter(|c| !c.is_empty() && *c != snapshot_id)
            .unwrap_or(snapshot_id);
        let include_same = compare_id == snapshot_id;

        let (_, snapshot) = self.load_snapshot(snapshot_id, volume_id)?;
        let (_, compare) = self.load_snapshot(compare_id, volume_id)?;
        let (Some(snap1), Some(snap2)) = (snapshot.dev_id, compare.dev_id) else {
            return Err(StowageError::InvalidState(format!(
                "Snapshots {snapshot_id} and {compare_id} need thin devices to be compared"
            )));
        };

        let xml = self.pool.thin_delta(snap1, snap2).await?;
        let mapping = parse_thin_delta(&xml, self.block_size(), include_same)?;
        tracing::debug!(
            volume = %volume_id,
            snapshot = %snapshot_id,
            compare = %compare_id,
            include_same,
            extents = mapping.extents.len(),
            bytes = mapping.mapped_bytes(),
            "Computed snapshot delta"
        );
        Ok(mapping)
    }

    async fn open_snapshot(&self, snapshot_id: &str, volume_id: &str) -> StowageResult<()> {
        self.activate_snapshot(snapshot_id, volume_id).await?;
        Ok(())
    }

    async fn close_snapshot(&self, snapshot_id: &str, volume_id: &str) -> StowageResult<()> {
        self.deactivate_snapshot(snapshot_id, volume_id).await
    }

    async fn read_snapshot(
        &self,
        snapshot_id: &str,
        volume_id: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> StowageResult<()> {
        self.load_snapshot(snapshot_id, volume_id)?;
        // The persisted flag can disagree with the kernel after a crash.
        if !self.pool.is_active(snapshot_id).await? {
            return Err(StowageError::InvalidState(format!(
                "Snapshot {snapshot_id} of volume {volume_id} is not activated"
            )));
        }

        let path = self.pool.device_path(snapshot_id);
        let mut device = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("open {}", path.display()))?;
        device
            .seek(SeekFrom::Start(offset))
            .await
            .with_context(|| format!("seek {} to {offset}", path.display()))?;
        let len = buf.len();
        device
            .read_exact(buf)
            .await
            .with_context(|| format!("read {len} bytes at {offset} from {}", path.display()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BackupOperations for ThinDriver {
    async fn create_backup(
        &self,
        snapshot_id: &str,
        volume_id: &str,
        dest_url: &str,
        opts: &BackupOptions,
    ) -> StowageResult<String> {
        let (volume, snapshot) = self.load_snapshot(snapshot_id, volume_id)?;
        let volume_desc = VolumeDescriptor::from(&volume);
        let snapshot_desc = SnapshotDescriptor::from(&snapshot);
        self.backups
            .create_backup(&volume_desc, &snapshot_desc, dest_url, self, &opts.labels)
            .await
    }
}
