//! Persisted volume and snapshot records plus the descriptors handed to backup destinations.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

/// Generate a new globally unique identifier for a volume or snapshot.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct Volume {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Size in bytes
    pub size: u64,
    pub driver: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<String>,
    /// Thin pool device id backing the volume, when the driver uses one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_id: Option<u32>,
    /// Driver owned location of the volume data (image file, device node).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub mount_point: Option<PathBuf>,
    /// Snapshots keyed by identifier, in creation order.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub snapshots: IndexMap<String, Snapshot>,
}

impl Volume {
    pub fn new(id: String, name: Option<String>, size: u64, driver: impl Into<String>) -> Self {
        Self {
            id,
            name,
            size,
            driver: driver.into(),
            created_at: Utc::now(),
            filesystem: None,
            dev_id: None,
            path: None,
            mount_point: None,
            snapshots: IndexMap::new(),
        }
    }

    pub fn snapshot(&self, id: &str) -> Option<&Snapshot> {
        self.snapshots.get(id)
    }

    pub fn snapshot_mut(&mut self, id: &str) -> Option<&mut Snapshot> {
        self.snapshots.get_mut(id)
    }

    /// Identifiers of snapshots whose device is currently exposed.
    pub fn activated_snapshots(&self) -> Vec<&str> {
        self.snapshots
            .values()
            .filter(|s| s.activated)
            .map(|s| s.id.as_str())
            .collect()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct Snapshot {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub volume_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub activated: bool,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(id: String, name: Option<String>, volume_id: impl Into<String>) -> Self {
        Self {
            id,
            name,
            volume_id: volume_id.into(),
            dev_id: None,
            path: None,
            activated: false,
            created_at: Utc::now(),
        }
    }
}

/// Volume projection recorded alongside a backup.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct VolumeDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub driver: String,
    pub size: u64,
    #[serde(default)]
    pub filesystem: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Volume> for VolumeDescriptor {
    fn from(volume: &Volume) -> Self {
        Self {
            id: volume.id.clone(),
            name: volume.name.clone(),
            driver: volume.driver.clone(),
            size: volume.size,
            filesystem: volume.filesystem.clone(),
            created_at: volume.created_at,
        }
    }
}

/// Snapshot projection recorded alongside a backup.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct SnapshotDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Snapshot> for SnapshotDescriptor {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            name: snapshot.name.clone(),
            created_at: snapshot.created_at,
        }
    }
}
