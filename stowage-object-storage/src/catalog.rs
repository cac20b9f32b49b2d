use std::collections::HashSet;

use stowage_common::{ResultExt, StowageError, StowageResult};

use crate::{
    destination::{Destination, BACKUP_FILE_PREFIX, JSON_SUFFIX},
    manifest::{BackupManifest, ChainRecord},
};

/// Volume identifiers that have a chain at `destination`.
pub(crate) async fn volume_ids(destination: &Destination) -> StowageResult<Vec<String>> {
    let listing = destination
        .store()
        .list_with_delimiter(Some(&destination.volumes_path()))
        .await
        .with_context(|| format!("list volumes at {}", destination.url()))?;

    let mut ids: Vec<String> = listing
        .common_prefixes
        .iter()
        .filter_map(|p| p.filename().map(str::to_string))
        .collect();
    ids.sort();
    Ok(ids)
}

/// Every manifest of `volume_id`, oldest first.
pub(crate) async fn manifests(
    destination: &Destination,
    volume_id: &str,
) -> StowageResult<Vec<BackupManifest>> {
    let listing = destination
        .store()
        .list_with_delimiter(Some(&destination.backups_path(volume_id)))
        .await
        .with_context(|| format!("list backups of volume {volume_id}"))?;

    let mut manifests = Vec::with_capacity(listing.objects.len());
    for object in &listing.objects {
        let Some(backup_id) = object
            .location
            .filename()
            .and_then(|f| f.strip_prefix(BACKUP_FILE_PREFIX))
            .and_then(|f| f.strip_suffix(JSON_SUFFIX))
        else {
            continue;
        };
        manifests.push(destination.load_manifest(volume_id, backup_id).await?);
    }
    manifests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(manifests)
}

/// Remove a backup that no other backup builds on, rewinding the chain head when needed and
/// collecting blocks nothing references any more.
pub(crate) async fn delete(
    destination: &Destination,
    volume_id: &str,
    backup_id: &str,
) -> StowageResult<()> {
    let all = manifests(destination, volume_id).await?;
    let Some(target) = all.iter().find(|m| m.id == backup_id) else {
        return Err(StowageError::NotFound(format!(
            "Backup {backup_id} of volume {volume_id}"
        )));
    };

    if let Some(child) = all
        .iter()
        .find(|m| m.parent.as_deref() == Some(backup_id))
    {
        return Err(StowageError::InvalidState(format!(
            "Backup {backup_id} is the parent of backup {child}, delete the newer backup first",
            child = child.id
        )));
    }

    let chain = destination.load_chain(volume_id).await?;
    if let Some(chain) = chain.filter(|c| c.last_backup_id.as_deref() == Some(backup_id)) {
        rewind_chain(destination, volume_id, chain, target, &all).await?;
    }

    destination
        .store()
        .delete(&destination.manifest_path(volume_id, backup_id))
        .await
        .with_context(|| format!("delete backup {backup_id}"))?;

    let referenced: HashSet<&str> = all
        .iter()
        .filter(|m| m.id != backup_id)
        .flat_map(|m| m.blocks.iter().map(|b| b.checksum.as_str()))
        .collect();
    let mut released = HashSet::new();
    for block in &target.blocks {
        if referenced.contains(block.checksum.as_str()) || !released.insert(&block.checksum) {
            continue;
        }
        destination
            .store()
            .delete(&destination.block_path(volume_id, &block.checksum))
            .await
            .with_context(|| format!("delete block {}", block.checksum))?;
    }

    tracing::info!(
        volume = %volume_id,
        backup = %backup_id,
        released_blocks = released.len(),
        "Backup deleted"
    );
    Ok(())
}

async fn rewind_chain(
    destination: &Destination,
    volume_id: &str,
    mut chain: ChainRecord,
    target: &BackupManifest,
    all: &[BackupManifest],
) -> StowageResult<()> {
    let record_path = destination.chain_record_path(volume_id);
    match target
        .parent
        .as_deref()
        .and_then(|parent| all.iter().find(|m| m.id == parent))
    {
        Some(parent) => {
            chain.last_backup_id = Some(parent.id.clone());
            chain.last_snapshot_id = Some(parent.snapshot.id.clone());
            destination.write_json(&record_path, &chain).await
        }
        None if all.len() > 1 => {
            chain.last_backup_id = None;
            chain.last_snapshot_id = None;
            destination.write_json(&record_path, &chain).await
        }
        None => {
            destination
                .store()
                .delete(&record_path)
                .await
                .with_context(|| format!("delete chain record of volume {volume_id}"))?;
            Ok(())
        }
    }
}
