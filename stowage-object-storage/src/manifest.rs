use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use stowage_common::{SnapshotDescriptor, VolumeDescriptor};

/// A chunk of snapshot data stored content addressed under the volume's `blocks/` prefix.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockRef {
    pub offset: u64,
    pub length: u64,
    /// Hex encoded BLAKE3 hash of the chunk
    pub checksum: String,
}

/// One link of a backup chain. A manifest without a parent is a full backup; an incremental
/// manifest only lists the chunks that changed since its parent's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BackupManifest {
    pub id: String,
    pub volume: VolumeDescriptor,
    pub snapshot: SnapshotDescriptor,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub parent: Option<String>,
    /// Snapshot the delta was computed against
    #[serde(default)]
    pub since_snapshot: Option<String>,
    /// Allocation unit of the source pool in bytes
    pub block_size: u64,
    pub blocks: Vec<BlockRef>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl BackupManifest {
    pub fn is_incremental(&self) -> bool {
        self.parent.is_some()
    }

    pub fn stored_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.length).sum()
    }
}

/// Per-volume bookkeeping at a destination: the head of the backup chain.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChainRecord {
    pub volume: VolumeDescriptor,
    #[serde(default)]
    pub last_backup_id: Option<String>,
    #[serde(default)]
    pub last_snapshot_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct BackupSummary {
    pub url: String,
    pub backup_id: String,
    pub volume_id: String,
    pub volume_name: Option<String>,
    pub volume_size: u64,
    pub filesystem: Option<String>,
    pub snapshot_id: String,
    pub snapshot_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub parent: Option<String>,
    pub incremental: bool,
    pub blocks: usize,
    pub stored_bytes: u64,
    pub labels: BTreeMap<String, String>,
}

impl BackupSummary {
    pub fn new(url: String, manifest: &BackupManifest) -> Self {
        Self {
            url,
            backup_id: manifest.id.clone(),
            volume_id: manifest.volume.id.clone(),
            volume_name: manifest.volume.name.clone(),
            volume_size: manifest.volume.size,
            filesystem: manifest.volume.filesystem.clone(),
            snapshot_id: manifest.snapshot.id.clone(),
            snapshot_name: manifest.snapshot.name.clone(),
            created_at: manifest.created_at,
            parent: manifest.parent.clone(),
            incremental: manifest.is_incremental(),
            blocks: manifest.blocks.len(),
            stored_bytes: manifest.stored_bytes(),
            labels: manifest.labels.clone(),
        }
    }
}
