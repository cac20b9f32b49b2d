use std::collections::BTreeMap;

use chrono::Utc;
use object_store::PutPayload;
use stowage_common::{
    BlockMapping, ResultExt, SnapshotDescriptor, SnapshotSource, StowageError, StowageResult,
    VolumeDescriptor,
};

use crate::{
    destination::Destination,
    manifest::{BackupManifest, BlockRef, ChainRecord},
};

pub(crate) struct UploadRequest<'a> {
    pub volume: &'a VolumeDescriptor,
    pub snapshot: &'a SnapshotDescriptor,
    pub source: &'a dyn SnapshotSource,
    pub chunk_size: u64,
    pub labels: &'a BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct UploadStats {
    uploaded: usize,
    deduplicated: usize,
}

/// Upload a snapshot and append it to the volume's chain at `destination`.
///
/// The manifest and chain record are only written once every chunk is stored, and the manifest
/// is removed again when the chain record cannot be updated. A failure part way leaves at most
/// unreferenced chunks behind.
pub(crate) async fn create_backup(
    destination: &Destination,
    request: UploadRequest<'_>,
) -> StowageResult<String> {
    let UploadRequest {
        volume,
        snapshot,
        source,
        chunk_size,
        labels,
    } = request;

    let chain = destination.load_chain(&volume.id).await?;
    let (since_snapshot, parent) = match &chain {
        Some(ChainRecord {
            last_snapshot_id: Some(last_snapshot),
            last_backup_id,
            ..
        }) => {
            if last_snapshot == &snapshot.id {
                return Err(StowageError::Conflict(format!(
                    "Snapshot {} is already the latest backup of volume {} at {}",
                    snapshot.id,
                    volume.id,
                    destination.url()
                )));
            }
            if source.has_snapshot(last_snapshot, &volume.id).await {
                (Some(last_snapshot.clone()), last_backup_id.clone())
            } else {
                tracing::info!(
                    volume = %volume.id,
                    snapshot = %last_snapshot,
                    "Previously backed up snapshot is gone, creating a full backup"
                );
                (None, None)
            }
        }
        _ => (None, None),
    };

    tracing::info!(
        volume = %volume.id,
        snapshot = %snapshot.id,
        since = ?since_snapshot,
        destination = %destination.url(),
        "Creating backup"
    );

    let mapping = source
        .compare_snapshot(&snapshot.id, since_snapshot.as_deref(), &volume.id)
        .await
        .with_context(|| format!("compare snapshot {} of volume {}", snapshot.id, volume.id))?;

    source
        .open_snapshot(&snapshot.id, &volume.id)
        .await
        .with_context(|| format!("open snapshot {}", snapshot.id))?;

    let uploaded = upload_blocks(destination, &volume.id, &snapshot.id, source, &mapping, chunk_size).await;
    let closed = source.close_snapshot(&snapshot.id, &volume.id).await;

    let blocks = match (uploaded, closed) {
        (Ok(blocks), Ok(())) => blocks,
        (Err(e), closed) => {
            if let Err(close_err) = closed {
                tracing::error!(
                    snapshot = %snapshot.id,
                    error = %close_err,
                    "Failed to close snapshot after failed upload"
                );
            }
            return Err(e.context(format!("upload snapshot {}", snapshot.id)));
        }
        (Ok(_), Err(e)) => return Err(e.context(format!("close snapshot {}", snapshot.id))),
    };

    let backup_id = stowage_common::generate_id();
    let manifest = BackupManifest {
        id: backup_id.clone(),
        volume: volume.clone(),
        snapshot: snapshot.clone(),
        created_at: Utc::now(),
        parent: parent.clone(),
        since_snapshot,
        block_size: mapping.block_size,
        blocks,
        labels: labels.clone(),
    };
    let manifest_path = destination.manifest_path(&volume.id, &backup_id);
    destination.write_json(&manifest_path, &manifest).await?;

    let record = ChainRecord {
        volume: volume.clone(),
        last_backup_id: Some(backup_id.clone()),
        last_snapshot_id: Some(snapshot.id.clone()),
    };
    if let Err(e) = destination
        .write_json(&destination.chain_record_path(&volume.id), &record)
        .await
    {
        // A manifest the chain record does not point at would be listed and restorable.
        if let Err(cleanup) = destination.store().delete(&manifest_path).await {
            tracing::error!(
                volume = %volume.id,
                backup = %backup_id,
                error = %cleanup,
                "Failed to remove manifest of unrecorded backup"
            );
        }
        return Err(e.context(format!("record backup {backup_id} of volume {}", volume.id)));
    }

    let url = destination.locator(&backup_id, &volume.id).url();
    tracing::info!(
        volume = %volume.id,
        snapshot = %snapshot.id,
        backup = %backup_id,
        parent = ?parent,
        blocks = manifest.blocks.len(),
        "Backup created"
    );
    Ok(url)
}

async fn upload_blocks(
    destination: &Destination,
    volume_id: &str,
    snapshot_id: &str,
    source: &dyn SnapshotSource,
    mapping: &BlockMapping,
    chunk_size: u64,
) -> StowageResult<Vec<BlockRef>> {
    let mut stats = UploadStats::default();
    let mut blocks = Vec::new();

    for (offset, length) in mapping.chunks(chunk_size) {
        let mut buf = vec![0u8; length as usize];
        source
            .read_snapshot(snapshot_id, volume_id, offset, &mut buf)
            .await
            .with_context(|| format!("read {length} bytes at offset {offset}"))?;

        let checksum = blake3::hash(&buf).to_hex().to_string();
        let path = destination.block_path(volume_id, &checksum);

        match destination.store().head(&path).await {
            Ok(_) => stats.deduplicated += 1,
            Err(object_store::Error::NotFound { .. }) => {
                destination
                    .store()
                    .put(&path, PutPayload::from(buf))
                    .await
                    .with_context(|| format!("upload block {checksum}"))?;
                stats.uploaded += 1;
            }
            Err(e) => return Err(StowageError::from(e).context(format!("check block {checksum}"))),
        }

        blocks.push(BlockRef {
            offset,
            length,
            checksum,
        });
    }

    tracing::debug!(
        volume = %volume_id,
        snapshot = %snapshot_id,
        uploaded = stats.uploaded,
        deduplicated = stats.deduplicated,
        "Uploaded snapshot blocks"
    );
    Ok(blocks)
}
