use std::{
    collections::BTreeMap,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use stowage_common::{
    BackupOperations, BackupOptions, CreateVolumeOptions, Driver, ErrorKind, ExtentKind,
    MetadataStore, Snapshot, SnapshotOperations, SnapshotSource, StowageError, Volume,
    VolumeOperations,
};
use stowage_devmapper::{InMemoryThinPool, ThinDriver, ThinPool};
use stowage_object_storage::{BackupStore, BackupTargets};
use tempfile::TempDir;
use tracing_test::traced_test;

const BLOCK_SECTORS: u64 = 128;
const BLOCK: u64 = BLOCK_SECTORS * 512;
const VOLUME_SIZE: u64 = 8 * 1024 * 1024;
const DEST: &str = "memory:///backups";

struct Fixture {
    _dir: TempDir,
    metadata: Arc<MetadataStore>,
    backups: Arc<BackupStore>,
    driver: ThinDriver,
}

impl Fixture {
    fn new() -> Self {
        Self::with_pool(|pool, _| pool)
    }

    /// Build the driver over a pool derived from the in-memory one, given the metadata directory.
    fn with_pool<F>(wrap: F) -> Self
    where
        F: FnOnce(Arc<InMemoryThinPool>, &Path) -> Arc<dyn ThinPool>,
    {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::open(dir.path()).unwrap());
        let pool = InMemoryThinPool::new("test-pool", BLOCK_SECTORS, dir.path().join("dev")).unwrap();
        let pool = wrap(Arc::new(pool), metadata.dir());
        let backups = Arc::new(BackupStore::new(Arc::new(BackupTargets::new()), BLOCK));
        let driver = ThinDriver::new(
            dir.path(),
            metadata.clone(),
            pool,
            backups.clone(),
            VOLUME_SIZE,
        )
        .unwrap();
        Self {
            _dir: dir,
            metadata,
            backups,
            driver,
        }
    }

    fn ops(&self) -> &dyn Driver {
        &self.driver
    }

    async fn create_volume(&self, id: &str, opts: CreateVolumeOptions) -> Result<Volume, StowageError> {
        let mut volume = Volume::new(
            id.to_string(),
            None,
            opts.size.unwrap_or(VOLUME_SIZE),
            "devmapper",
        );
        self.ops()
            .volume_ops()?
            .create_volume(&mut volume, &opts)
            .await?;
        self.metadata.save(&volume)?;
        Ok(volume)
    }

    async fn snapshot(&self, volume_id: &str, snapshot_id: &str) -> Snapshot {
        let mut volume = self.metadata.load(volume_id).unwrap();
        let mut snapshot = Snapshot::new(snapshot_id.to_string(), None, volume_id);
        self.ops()
            .snapshot_ops()
            .unwrap()
            .create_snapshot(&mut snapshot, &volume)
            .await
            .unwrap();
        volume
            .snapshots
            .insert(snapshot.id.clone(), snapshot.clone());
        self.metadata.save(&volume).unwrap();
        snapshot
    }
}

fn write_at(path: &Path, offset: u64, data: &[u8]) {
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.write_all_at(data, offset).unwrap();
    file.sync_all().unwrap();
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[tokio::test]
#[traced_test]
async fn full_and_incremental_backup_restore_end_to_end() {
    let fx = Fixture::new();
    let volume = fx.create_volume("vol-a", CreateVolumeOptions::default()).await.unwrap();
    let device = volume.path.clone().unwrap();

    write_at(&device, 0, &pattern(3 * BLOCK as usize, 1));
    write_at(&device, 40 * BLOCK, &pattern(BLOCK as usize, 2));
    fx.snapshot("vol-a", "snap-1").await;

    let backup_ops = fx.ops().backup_ops().unwrap();
    let opts = BackupOptions::default();
    let first = backup_ops
        .create_backup("snap-1", "vol-a", DEST, &opts)
        .await
        .unwrap();

    write_at(&device, 0, &[0xAB; 4096]);
    fx.snapshot("vol-a", "snap-2").await;

    let mapping = backup_ops
        .compare_snapshot("snap-2", Some("snap-1"), "vol-a")
        .await
        .unwrap();
    assert_eq!(mapping.ranges(), vec![(0, BLOCK)]);
    assert_eq!(mapping.extents[0].kind, ExtentKind::Different);

    let second = backup_ops
        .create_backup("snap-2", "vol-a", DEST, &opts)
        .await
        .unwrap();
    let summary = fx.backups.inspect(&second).await.unwrap();
    assert!(summary.incremental);
    assert_eq!(summary.stored_bytes, BLOCK);
    assert!(!fx.backups.inspect(&first).await.unwrap().incremental);

    // Both snapshots were closed again by the uploads.
    let record = fx.metadata.load("vol-a").unwrap();
    assert!(record.activated_snapshots().is_empty());

    let restored = fx
        .create_volume(
            "vol-b",
            CreateVolumeOptions {
                backup_url: Some(second.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(restored.size, VOLUME_SIZE);
    let expected = std::fs::read(&device).unwrap();
    let actual = std::fs::read(restored.path.as_ref().unwrap()).unwrap();
    assert_eq!(actual.len(), expected.len());
    assert!(actual == expected, "restored volume differs from source");
}

#[tokio::test]
async fn full_mapping_is_the_same_for_self_and_empty_compare() {
    let fx = Fixture::new();
    let volume = fx.create_volume("vol", CreateVolumeOptions::default()).await.unwrap();
    write_at(volume.path.as_ref().unwrap(), 5 * BLOCK, &[1u8; 10]);
    fx.snapshot("vol", "s").await;

    let ops = fx.ops().backup_ops().unwrap();
    let against_self = ops.compare_snapshot("s", Some("s"), "vol").await.unwrap();
    let against_none = ops.compare_snapshot("s", None, "vol").await.unwrap();
    let against_empty = ops.compare_snapshot("s", Some(""), "vol").await.unwrap();
    assert!(against_self.include_same);
    assert_eq!(against_self, against_none);
    assert_eq!(against_self, against_empty);
    assert_eq!(against_self.ranges(), vec![(5 * BLOCK, BLOCK)]);
}

#[tokio::test]
async fn identical_snapshots_have_empty_delta() {
    let fx = Fixture::new();
    let volume = fx.create_volume("vol", CreateVolumeOptions::default()).await.unwrap();
    write_at(volume.path.as_ref().unwrap(), 0, &[7u8; 100]);
    fx.snapshot("vol", "s1").await;
    fx.snapshot("vol", "s2").await;

    let mapping = fx
        .ops()
        .backup_ops()
        .unwrap()
        .compare_snapshot("s2", Some("s1"), "vol")
        .await
        .unwrap();
    assert!(mapping.is_empty());
    assert!(!mapping.include_same);
}

#[tokio::test]
async fn reading_requires_an_activated_snapshot() {
    let fx = Fixture::new();
    let volume = fx.create_volume("vol", CreateVolumeOptions::default()).await.unwrap();
    write_at(volume.path.as_ref().unwrap(), 0, b"payload");
    fx.snapshot("vol", "s").await;
    let ops = fx.ops().backup_ops().unwrap();

    let mut buf = [0u8; 7];
    let err = ops.read_snapshot("s", "vol", 0, &mut buf).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(buf, [0u8; 7]);

    ops.open_snapshot("s", "vol").await.unwrap();
    ops.read_snapshot("s", "vol", 0, &mut buf).await.unwrap();
    assert_eq!(&buf, b"payload");
    ops.close_snapshot("s", "vol").await.unwrap();

    let err = ops.read_snapshot("s", "vol", 0, &mut buf).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn activation_is_idempotent_and_persisted() {
    let fx = Fixture::new();
    fx.create_volume("vol", CreateVolumeOptions::default()).await.unwrap();
    fx.snapshot("vol", "s").await;
    let ops = fx.ops().snapshot_ops().unwrap();

    let path = ops.activate_snapshot("s", "vol").await.unwrap();
    assert_eq!(ops.activate_snapshot("s", "vol").await.unwrap(), path);
    let record = fx.metadata.load("vol").unwrap();
    assert!(record.snapshot("s").unwrap().activated);
    assert_eq!(record.snapshot("s").unwrap().path.as_ref(), Some(&path));

    ops.deactivate_snapshot("s", "vol").await.unwrap();
    ops.deactivate_snapshot("s", "vol").await.unwrap();
    let record = fx.metadata.load("vol").unwrap();
    assert!(!record.snapshot("s").unwrap().activated);
    assert!(!path.exists());

    let err = ops.activate_snapshot("missing", "vol").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

/// Pool that moves the metadata directory aside once `device` is activated, so recording the
/// activation fails.
#[derive(Debug)]
struct RecordLosingPool {
    inner: Arc<InMemoryThinPool>,
    metadata_dir: PathBuf,
    device: &'static str,
}

impl RecordLosingPool {
    fn moved_dir(&self) -> PathBuf {
        self.metadata_dir.with_extension("moved")
    }
}

#[async_trait::async_trait]
impl ThinPool for RecordLosingPool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn block_size_sectors(&self) -> u64 {
        self.inner.block_size_sectors()
    }

    async fn create_thin(&self, dev_id: u32) -> Result<(), StowageError> {
        self.inner.create_thin(dev_id).await
    }

    async fn create_snapshot(
        &self,
        dev_id: u32,
        origin_dev_id: u32,
        origin_name: Option<&str>,
    ) -> Result<(), StowageError> {
        self.inner.create_snapshot(dev_id, origin_dev_id, origin_name).await
    }

    async fn delete_thin(&self, dev_id: u32) -> Result<(), StowageError> {
        self.inner.delete_thin(dev_id).await
    }

    async fn activate(&self, name: &str, dev_id: u32, size: u64) -> Result<PathBuf, StowageError> {
        let path = self.inner.activate(name, dev_id, size).await?;
        if name == self.device {
            std::fs::rename(&self.metadata_dir, self.moved_dir()).unwrap();
        }
        Ok(path)
    }

    async fn remove(&self, name: &str) -> Result<(), StowageError> {
        self.inner.remove(name).await
    }

    async fn is_active(&self, name: &str) -> Result<bool, StowageError> {
        self.inner.is_active(name).await
    }

    fn device_path(&self, name: &str) -> PathBuf {
        self.inner.device_path(name)
    }

    async fn thin_delta(&self, snap1: u32, snap2: u32) -> Result<String, StowageError> {
        self.inner.thin_delta(snap1, snap2).await
    }

    async fn status(&self) -> Result<BTreeMap<String, String>, StowageError> {
        self.inner.status().await
    }
}

#[tokio::test]
#[traced_test]
async fn unrecorded_activation_removes_the_device() {
    let mut pool = None;
    let fx = Fixture::with_pool(|inner, metadata_dir| {
        let wrapped = Arc::new(RecordLosingPool {
            inner,
            metadata_dir: metadata_dir.to_path_buf(),
            device: "s",
        });
        pool = Some(wrapped.clone());
        wrapped
    });
    let pool = pool.unwrap();
    fx.create_volume("vol", CreateVolumeOptions::default()).await.unwrap();
    fx.snapshot("vol", "s").await;

    let err = fx
        .ops()
        .snapshot_ops()
        .unwrap()
        .activate_snapshot("s", "vol")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoError);
    assert!(!pool.is_active("s").await.unwrap());
    assert!(!pool.device_path("s").exists());

    std::fs::rename(pool.moved_dir(), &pool.metadata_dir).unwrap();
    let record = fx.metadata.load("vol").unwrap();
    assert!(!record.snapshot("s").unwrap().activated);
    assert!(record.snapshot("s").unwrap().path.is_none());
}

#[tokio::test]
async fn volume_delete_waits_for_snapshot_deactivation() {
    let fx = Fixture::new();
    fx.create_volume("vol", CreateVolumeOptions::default()).await.unwrap();
    fx.snapshot("vol", "s").await;
    fx.ops()
        .snapshot_ops()
        .unwrap()
        .activate_snapshot("s", "vol")
        .await
        .unwrap();

    let volume = fx.metadata.load("vol").unwrap();
    let ops = fx.ops().volume_ops().unwrap();
    let err = ops.delete_volume(&volume).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let snapshot = volume.snapshot("s").unwrap().clone();
    let err = fx
        .ops()
        .snapshot_ops()
        .unwrap()
        .delete_snapshot(&snapshot, &volume)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    fx.ops()
        .snapshot_ops()
        .unwrap()
        .deactivate_snapshot("s", "vol")
        .await
        .unwrap();
    let volume = fx.metadata.load("vol").unwrap();
    ops.delete_volume(&volume).await.unwrap();
    assert!(!volume.path.as_ref().unwrap().exists());
}

#[tokio::test]
async fn unaligned_volume_size_is_rejected() {
    let fx = Fixture::new();
    let err = fx
        .create_volume(
            "vol",
            CreateVolumeOptions {
                size: Some(BLOCK + 1),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn device_ids_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = Arc::new(MetadataStore::open(dir.path()).unwrap());
    let backups = Arc::new(BackupStore::new(Arc::new(BackupTargets::new()), BLOCK));
    let new_driver = || {
        let pool = InMemoryThinPool::new("p", BLOCK_SECTORS, dir.path().join("dev")).unwrap();
        ThinDriver::new(dir.path(), metadata.clone(), Arc::new(pool), backups.clone(), VOLUME_SIZE)
            .unwrap()
    };

    let first = new_driver();
    let mut volume = Volume::new("v1".to_string(), None, VOLUME_SIZE, "devmapper");
    first
        .create_volume(&mut volume, &CreateVolumeOptions::default())
        .await
        .unwrap();
    assert_eq!(volume.dev_id, Some(1));
    drop(first);

    let second = new_driver();
    let info: BTreeMap<String, String> = second.info().await.unwrap();
    assert_eq!(info.get("next_dev_id").map(String::as_str), Some("2"));

    let other = InMemoryThinPool::new("other", BLOCK_SECTORS, dir.path().join("dev2")).unwrap();
    let err = ThinDriver::new(dir.path(), metadata.clone(), Arc::new(other), backups.clone(), VOLUME_SIZE)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}
