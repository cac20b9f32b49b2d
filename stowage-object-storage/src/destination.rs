//! Backup destinations and backup URLs.
//!
//! A destination is any URL `object_store` understands (`file://`, `s3://`, `memory://`, ...).
//! A backup URL is its destination plus `backup` and `volume` query parameters.

use std::{collections::HashMap, fmt::Display, sync::Arc};

use object_store::{
    aws::AmazonS3Builder, memory::InMemory, path::Path, ObjectStore, PutPayload,
};
use stowage_common::{ResultExt, StowageError, StowageResult};
use url::Url;

use crate::manifest::{BackupManifest, ChainRecord};

const BACKUP_PARAM: &str = "backup";
const VOLUME_PARAM: &str = "volume";

const VOLUMES_PREFIX: &str = "volumes";
const BACKUPS_DIR: &str = "backups";
const BLOCKS_DIR: &str = "blocks";
const CHAIN_RECORD: &str = "volume.json";
pub(crate) const BACKUP_FILE_PREFIX: &str = "backup_";
pub(crate) const JSON_SUFFIX: &str = ".json";
const BLOCK_SUFFIX: &str = ".blk";

/// Parsed backup URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupLocator {
    pub destination: String,
    pub backup_id: String,
    pub volume_id: String,
}

impl BackupLocator {
    pub fn new(destination: &str, backup_id: &str, volume_id: &str) -> StowageResult<Self> {
        let url = parse_url(destination)?;
        Ok(Self {
            destination: strip_query(url).to_string(),
            backup_id: backup_id.to_string(),
            volume_id: volume_id.to_string(),
        })
    }

    pub fn parse(backup_url: &str) -> StowageResult<Self> {
        let url = parse_url(backup_url)?;
        let mut backup_id = None;
        let mut volume_id = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                BACKUP_PARAM => backup_id = Some(value.to_string()),
                VOLUME_PARAM => volume_id = Some(value.to_string()),
                _ => {}
            }
        }
        match (backup_id, volume_id) {
            (Some(backup_id), Some(volume_id)) => Ok(Self {
                destination: strip_query(url).to_string(),
                backup_id,
                volume_id,
            }),
            _ => Err(StowageError::NotFound(format!(
                "Backup reference in URL {backup_url}"
            ))),
        }
    }

    pub fn url(&self) -> String {
        let mut url = match Url::parse(&self.destination) {
            Ok(url) => url,
            Err(_) => return self.destination.clone(),
        };
        url.query_pairs_mut()
            .append_pair(BACKUP_PARAM, &self.backup_id)
            .append_pair(VOLUME_PARAM, &self.volume_id);
        url.to_string()
    }
}

impl Display for BackupLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url())
    }
}

fn parse_url(raw: &str) -> StowageResult<Url> {
    Url::parse(raw).map_err(|e| StowageError::RemoteStore(format!("Invalid URL {raw}: {e}")))
}

fn strip_query(mut url: Url) -> Url {
    url.set_query(None);
    url.set_fragment(None);
    url
}

/// Caches one object store per `scheme://authority`, so repeated requests against the same
/// destination share a client (and `memory://` destinations keep their contents).
#[derive(Debug, Default)]
pub struct BackupTargets {
    stores: parking_lot::Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl BackupTargets {
    pub fn new() -> Self {
        Self::default()
    }

    fn store_key(url: &Url) -> String {
        format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default())
    }

    /// Serve every destination under `base` (e.g. `memory://` or `s3://bucket`) from `store`.
    pub fn register(&self, base: &str, store: Arc<dyn ObjectStore>) -> StowageResult<()> {
        let url = parse_url(base)?;
        self.stores.lock().insert(Self::store_key(&url), store);
        Ok(())
    }

    /// S3 credentials and endpoint come from the usual `AWS_*` environment variables.
    fn build_store(url: &Url) -> Result<Arc<dyn ObjectStore>, object_store::Error> {
        match url.scheme() {
            "s3" => {
                let store = AmazonS3Builder::from_env()
                    .with_allow_http(true)
                    .with_bucket_name(url.host_str().unwrap_or_default())
                    .build()?;
                Ok(Arc::new(store))
            }
            "memory" => Ok(Arc::new(InMemory::new())),
            _ => {
                let (store, _) = object_store::parse_url(url)?;
                Ok(Arc::from(store))
            }
        }
    }

    pub fn resolve(&self, destination: &str) -> StowageResult<Destination> {
        let url = strip_query(parse_url(destination)?);
        let key = Self::store_key(&url);

        let store = {
            let mut stores = self.stores.lock();
            match stores.get(&key) {
                Some(store) => store.clone(),
                None => {
                    let store = Self::build_store(&url).map_err(|e| {
                        StowageError::RemoteStore(format!(
                            "Unsupported backup destination {destination}: {e}"
                        ))
                    })?;
                    tracing::debug!(destination = %key, "Initialized backup destination store");
                    stores.insert(key, store.clone());
                    store
                }
            }
        };

        let prefix = Path::from_url_path(url.path()).map_err(|e| {
            StowageError::RemoteStore(format!("Invalid destination path {}: {e}", url.path()))
        })?;

        Ok(Destination { url, store, prefix })
    }
}

/// A resolved destination: the object store and the key prefix backups live under.
#[derive(Debug, Clone)]
pub struct Destination {
    url: Url,
    store: Arc<dyn ObjectStore>,
    prefix: Path,
}

impl Destination {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn locator(&self, backup_id: &str, volume_id: &str) -> BackupLocator {
        BackupLocator {
            destination: self.url.to_string(),
            backup_id: backup_id.to_string(),
            volume_id: volume_id.to_string(),
        }
    }

    pub(crate) fn volumes_path(&self) -> Path {
        self.prefix.child(VOLUMES_PREFIX)
    }

    pub(crate) fn volume_path(&self, volume_id: &str) -> Path {
        self.volumes_path().child(volume_id)
    }

    pub(crate) fn chain_record_path(&self, volume_id: &str) -> Path {
        self.volume_path(volume_id).child(CHAIN_RECORD)
    }

    pub(crate) fn backups_path(&self, volume_id: &str) -> Path {
        self.volume_path(volume_id).child(BACKUPS_DIR)
    }

    pub(crate) fn manifest_path(&self, volume_id: &str, backup_id: &str) -> Path {
        self.backups_path(volume_id)
            .child(format!("{BACKUP_FILE_PREFIX}{backup_id}{JSON_SUFFIX}"))
    }

    pub(crate) fn blocks_path(&self, volume_id: &str) -> Path {
        self.volume_path(volume_id).child(BLOCKS_DIR)
    }

    /// Content addressed location of a block, fanned out by the first hash bytes.
    pub(crate) fn block_path(&self, volume_id: &str, checksum: &str) -> Path {
        let fan_a = checksum.get(0..2).unwrap_or("00");
        let fan_b = checksum.get(2..4).unwrap_or("00");
        self.blocks_path(volume_id)
            .child(fan_a)
            .child(fan_b)
            .child(format!("{checksum}{BLOCK_SUFFIX}"))
    }

    pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &Path,
    ) -> StowageResult<T> {
        let bytes = self
            .store
            .get(path)
            .await
            .with_context(|| format!("read {path}"))?
            .bytes()
            .await
            .with_context(|| format!("read {path}"))?;
        let value = serde_json::from_slice(&bytes).with_context(|| format!("parse {path}"))?;
        Ok(value)
    }

    pub(crate) async fn write_json<T: serde::Serialize>(
        &self,
        path: &Path,
        value: &T,
    ) -> StowageResult<()> {
        let json = serde_json::to_vec_pretty(value)?;
        self.store
            .put(path, PutPayload::from(json))
            .await
            .with_context(|| format!("write {path}"))?;
        Ok(())
    }

    pub(crate) async fn load_chain(&self, volume_id: &str) -> StowageResult<Option<ChainRecord>> {
        match self.read_json(&self.chain_record_path(volume_id)).await {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.kind() == stowage_common::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn load_manifest(
        &self,
        volume_id: &str,
        backup_id: &str,
    ) -> StowageResult<BackupManifest> {
        self.read_json(&self.manifest_path(volume_id, backup_id))
            .await
            .map_err(|e| match e.kind() {
                stowage_common::ErrorKind::NotFound => {
                    StowageError::NotFound(format!("Backup {backup_id} of volume {volume_id}"))
                }
                _ => e,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_url_round_trips_through_locator() {
        let locator = BackupLocator::new("s3://bucket/prefix", "b1", "v1").unwrap();
        let url = locator.url();
        assert_eq!(url, "s3://bucket/prefix?backup=b1&volume=v1");
        assert_eq!(BackupLocator::parse(&url).unwrap(), locator);
    }

    #[test]
    fn url_without_backup_is_not_found() {
        let err = BackupLocator::parse("file:///tmp/backups?volume=v1").unwrap_err();
        assert_eq!(err.kind(), stowage_common::ErrorKind::NotFound);
    }

    #[test]
    fn block_paths_fan_out_by_checksum() {
        let targets = BackupTargets::new();
        let destination = targets.resolve("memory:///backups").unwrap();
        assert_eq!(
            destination.block_path("v1", "abcdef").to_string(),
            "backups/volumes/v1/blocks/ab/cd/abcdef.blk"
        );
        assert_eq!(
            destination.manifest_path("v1", "b1").to_string(),
            "backups/volumes/v1/backups/backup_b1.json"
        );
    }

    #[test]
    fn memory_destinations_share_a_store() {
        let targets = BackupTargets::new();
        let a = targets.resolve("memory:///one").unwrap();
        let b = targets.resolve("memory:///two?backup=x&volume=y").unwrap();
        assert!(Arc::ptr_eq(a.store(), b.store()));
        assert_eq!(b.url().as_str(), "memory:///two");
    }
}
