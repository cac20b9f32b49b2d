use std::{os::unix::fs::FileExt, path::Path, sync::Arc, time::Duration};

use stowage_common::{Driver, ErrorKind, MetadataStore};
use stowage_core::{
    CreateBackupRequest, CreateSnapshotRequest, CreateVolumeRequest, DriverRegistry, Runtime,
};
use stowage_devmapper::{InMemoryThinPool, ThinDriver};
use stowage_loopback::LoopbackDriver;
use stowage_object_storage::{testing::FaultyStore, BackupStore, BackupTargets};
use tracing_test::traced_test;

const BLOCK_SECTORS: u64 = 128;
const BLOCK: u64 = BLOCK_SECTORS * 512;
const VOLUME_SIZE: u64 = 4 * 1024 * 1024;
const DEST: &str = "memory:///backups";

fn open_runtime(root: &Path, backups: Arc<BackupStore>) -> Runtime {
    let metadata = Arc::new(MetadataStore::open(root).unwrap());
    let pool = InMemoryThinPool::new("test-pool", BLOCK_SECTORS, root.join("dev")).unwrap();
    let thin: Arc<dyn Driver> = Arc::new(
        ThinDriver::new(root, metadata.clone(), Arc::new(pool), backups.clone(), VOLUME_SIZE)
            .unwrap(),
    );
    let loopback: Arc<dyn Driver> =
        Arc::new(LoopbackDriver::new(root, metadata.clone(), 1024 * 1024).unwrap());

    let mut registry = DriverRegistry::new();
    registry.register("devmapper", thin).unwrap();
    registry.register("loopback", loopback).unwrap();
    Runtime::open(root, metadata, registry, backups).unwrap()
}

fn backup_store() -> Arc<BackupStore> {
    Arc::new(BackupStore::new(Arc::new(BackupTargets::new()), BLOCK))
}

fn volume_request(name: &str, driver: &str) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: Some(name.to_string()),
        driver: Some(driver.to_string()),
        ..Default::default()
    }
}

fn snapshot_request(volume: &str, name: &str) -> CreateSnapshotRequest {
    CreateSnapshotRequest {
        volume: volume.to_string(),
        name: Some(name.to_string()),
    }
}

fn backup_request(snapshot: &str) -> CreateBackupRequest {
    CreateBackupRequest {
        snapshot: snapshot.to_string(),
        dest: DEST.to_string(),
        ..Default::default()
    }
}

fn write_at(path: &Path, offset: u64, data: &[u8]) {
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.write_all_at(data, offset).unwrap();
    file.sync_all().unwrap();
}

#[tokio::test]
#[traced_test]
async fn backup_and_restore_through_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = open_runtime(dir.path(), backup_store());

    let volume = runtime
        .create_volume(volume_request("data", "devmapper"))
        .await
        .unwrap();
    assert_eq!(volume.size, VOLUME_SIZE);
    let device = volume.path.clone().unwrap();
    write_at(&device, 0, &vec![0x5A; 2 * BLOCK as usize]);
    write_at(&device, 10 * BLOCK, b"tail of the volume");

    runtime.create_snapshot(snapshot_request("data", "first")).await.unwrap();
    let full = runtime.create_backup(backup_request("first")).await.unwrap();

    write_at(&device, 0, &[0x11; 4096]);
    runtime.create_snapshot(snapshot_request("data", "second")).await.unwrap();
    let incremental = runtime.create_backup(backup_request("second")).await.unwrap();

    let listed = runtime.list_backups(DEST, Some("data")).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].url, full);
    assert_eq!(listed[1].url, incremental);
    let summary = runtime.inspect_backup(&incremental).await.unwrap();
    assert!(summary.incremental);
    assert_eq!(summary.stored_bytes, BLOCK);
    assert_eq!(summary.volume_id, volume.id);

    let restored = runtime
        .create_volume(CreateVolumeRequest {
            name: Some("copy".to_string()),
            backup: Some(incremental.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(restored.driver, "devmapper");
    let expected = std::fs::read(&device).unwrap();
    let actual = std::fs::read(restored.path.as_ref().unwrap()).unwrap();
    assert!(actual == expected, "restored volume differs from source");

    let err = runtime.delete_backup(&full).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    runtime.delete_backup(&incremental).await.unwrap();
    runtime.delete_backup(&full).await.unwrap();
    assert!(runtime.list_backups(DEST, Some(&volume.id)).await.unwrap().is_empty());
}

#[tokio::test]
async fn backup_listing_holds_off_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let targets = Arc::new(BackupTargets::new());
    let slow = FaultyStore::in_memory().delay_reads_of("/backups/backup_", Duration::from_millis(300));
    targets.register("memory://", Arc::new(slow)).unwrap();
    let runtime = Arc::new(open_runtime(
        dir.path(),
        Arc::new(BackupStore::new(targets, BLOCK)),
    ));

    let volume = runtime
        .create_volume(volume_request("data", "devmapper"))
        .await
        .unwrap();
    write_at(volume.path.as_ref().unwrap(), 0, b"listed while deleting");
    runtime.create_snapshot(snapshot_request("data", "first")).await.unwrap();
    let url = runtime.create_backup(backup_request("first")).await.unwrap();

    let listing = tokio::spawn({
        let runtime = runtime.clone();
        async move { runtime.list_backups(DEST, Some("data")).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    runtime.delete_backup(&url).await.unwrap();

    let listed = listing.await.unwrap().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].url, url);
    assert!(runtime.list_backups(DEST, Some("data")).await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_refused_while_snapshot_activated() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = open_runtime(dir.path(), backup_store());
    let volume = runtime
        .create_volume(volume_request("vol", "devmapper"))
        .await
        .unwrap();
    let snapshot = runtime.create_snapshot(snapshot_request("vol", "snap")).await.unwrap();

    runtime.activate_snapshot("snap").await.unwrap();
    assert!(runtime.inspect_snapshot("snap").await.unwrap().activated);
    let err = runtime.delete_volume("vol", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = runtime.delete_snapshot(&snapshot.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    runtime.deactivate_snapshot("snap").await.unwrap();
    runtime.delete_volume("vol", false).await.unwrap();
    assert_eq!(
        runtime.inspect_volume(&volume.id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        runtime.inspect_snapshot(&snapshot.id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    let info = runtime.info().await.unwrap();
    assert_eq!((info.volumes, info.snapshots), (0, 0));
}

#[tokio::test]
async fn references_resolve_by_name_and_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = open_runtime(dir.path(), backup_store());
    let volume = runtime
        .create_volume(volume_request("shared", "loopback"))
        .await
        .unwrap();
    let snapshot = runtime
        .create_snapshot(snapshot_request(&volume.id[..13], "shared"))
        .await
        .unwrap();

    assert_eq!(runtime.inspect_volume("shared").await.unwrap().id, volume.id);
    assert_eq!(runtime.inspect_snapshot("shared").await.unwrap().id, snapshot.id);
    assert_eq!(runtime.inspect_volume(&volume.id[..13]).await.unwrap().id, volume.id);
    assert_eq!(
        runtime.inspect_volume(&snapshot.id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );

    let err = runtime
        .create_volume(volume_request("shared", "loopback"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = runtime
        .create_snapshot(snapshot_request("shared", "shared"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(runtime.list_volumes().await.unwrap().len(), 1);
}

#[tokio::test]
async fn index_is_rebuilt_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let backups = backup_store();
    let (volume, snapshot) = {
        let runtime = open_runtime(dir.path(), backups.clone());
        let volume = runtime
            .create_volume(volume_request("kept", "loopback"))
            .await
            .unwrap();
        let snapshot = runtime
            .create_snapshot(snapshot_request("kept", "nightly"))
            .await
            .unwrap();
        runtime.shutdown().await;
        assert_eq!(
            runtime.inspect_volume("kept").await.unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        (volume, snapshot)
    };

    let runtime = open_runtime(dir.path(), backups);
    assert_eq!(runtime.inspect_volume("kept").await.unwrap().id, volume.id);
    let reloaded = runtime.inspect_snapshot("nightly").await.unwrap();
    assert_eq!(reloaded.id, snapshot.id);
    assert_eq!(reloaded.volume_id, volume.id);
    runtime.delete_snapshot("nightly").await.unwrap();
    assert!(runtime.inspect_volume("kept").await.unwrap().snapshots.is_empty());
}

#[tokio::test]
async fn reference_only_delete_keeps_the_image() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = open_runtime(dir.path(), backup_store());
    let volume = runtime
        .create_volume(volume_request("img", "loopback"))
        .await
        .unwrap();
    let image = volume.path.clone().unwrap();

    runtime.delete_volume("img", true).await.unwrap();
    assert!(image.exists());
    assert_eq!(
        runtime.inspect_volume("img").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );

    // The name is free again, but the image file of the old volume is left alone.
    let again = runtime
        .create_volume(volume_request("img", "loopback"))
        .await
        .unwrap();
    assert_ne!(again.id, volume.id);
    assert!(image.exists());
}

#[tokio::test]
async fn mounted_volume_cannot_be_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = open_runtime(dir.path(), backup_store());
    let volume = runtime
        .create_volume(volume_request("mnt", "loopback"))
        .await
        .unwrap();

    let path = runtime.mount_volume("mnt").await.unwrap();
    assert_eq!(Some(&path), volume.path.as_ref());
    assert_eq!(runtime.inspect_volume("mnt").await.unwrap().mount_point, Some(path));

    let err = runtime.delete_volume("mnt", true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    runtime.umount_volume("mnt").await.unwrap();
    runtime.umount_volume("mnt").await.unwrap();
    runtime.delete_volume("mnt", false).await.unwrap();
    assert!(!volume.path.unwrap().exists());
}

#[tokio::test]
async fn loopback_has_no_backup_capability() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = open_runtime(dir.path(), backup_store());
    runtime
        .create_volume(volume_request("plain", "loopback"))
        .await
        .unwrap();
    runtime
        .create_snapshot(snapshot_request("plain", "plain-snap"))
        .await
        .unwrap();

    let err = runtime.create_backup(backup_request("plain-snap")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedCapability);

    let err = runtime
        .create_volume(CreateVolumeRequest {
            driver: Some("loopback".to_string()),
            backup: Some(format!("{DEST}?backup=b&volume=v")),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedCapability);

    let err = runtime
        .create_volume(volume_request("ghost", "zfs"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let info = runtime.info().await.unwrap();
    assert_eq!(info.default_driver.as_deref(), Some("devmapper"));
    assert_eq!(info.drivers.len(), 2);
    assert_eq!(info.volumes, 1);
}
