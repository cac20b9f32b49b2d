use std::{collections::HashSet, io::SeekFrom};

use stowage_common::{ResultExt, StowageError, StowageResult};
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt, AsyncSeek};

use crate::{destination::Destination, manifest::BackupManifest};

/// Manifests from the full backup up to and including `backup_id`, oldest first.
pub(crate) async fn load_chain(
    destination: &Destination,
    volume_id: &str,
    backup_id: &str,
) -> StowageResult<Vec<BackupManifest>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut next = Some(backup_id.to_string());

    while let Some(id) = next {
        if !seen.insert(id.clone()) {
            return Err(StowageError::RemoteStore(format!(
                "Backup chain of volume {volume_id} loops at {id}"
            )));
        }
        let manifest = destination.load_manifest(volume_id, &id).await?;
        next = manifest.parent.clone();
        chain.push(manifest);
    }

    chain.reverse();
    Ok(chain)
}

/// Replay the chain ending at `backup_id` into `writer`. Returns the volume size recorded in
/// the newest link. Regions never written by any link are left untouched.
pub(crate) async fn restore<W>(
    destination: &Destination,
    volume_id: &str,
    backup_id: &str,
    writer: &mut W,
) -> StowageResult<u64>
where
    W: AsyncWrite + AsyncSeek + Unpin + Send,
{
    let chain = load_chain(destination, volume_id, backup_id).await?;
    let size = chain.last().map(|m| m.volume.size).unwrap_or_default();

    for manifest in &chain {
        tracing::debug!(
            volume = %volume_id,
            backup = %manifest.id,
            blocks = manifest.blocks.len(),
            "Applying backup link"
        );
        for block in &manifest.blocks {
            let path = destination.block_path(volume_id, &block.checksum);
            let data = destination
                .store()
                .get(&path)
                .await
                .with_context(|| format!("fetch block {}", block.checksum))?
                .bytes()
                .await
                .with_context(|| format!("fetch block {}", block.checksum))?;

            if data.len() as u64 != block.length
                || blake3::hash(&data).to_hex().as_str() != block.checksum
            {
                return Err(StowageError::RemoteStore(format!(
                    "Block {} of backup {} is corrupted",
                    block.checksum, manifest.id
                )));
            }

            writer
                .seek(SeekFrom::Start(block.offset))
                .await
                .context("seek restore target")?;
            writer.write_all(&data).await.context("write restore target")?;
        }
    }
    writer.flush().await.context("flush restore target")?;

    tracing::info!(volume = %volume_id, backup = %backup_id, links = chain.len(), "Backup restored");
    Ok(size)
}
