//! Kernel thin pool driven through `dmsetup` and `thin_delta`.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Stdio,
};

use stowage_common::{StowageError, StowageResult};
use stowage_config::SECTOR_SIZE;
use tokio::process::Command;

use crate::pool::ThinPool;

const DMSETUP: &str = "dmsetup";
const THIN_DELTA: &str = "thin_delta";
const BLOCKDEV: &str = "blockdev";
const DM_DIR: &str = "/dev/mapper";

/// Blocks the pool keeps free before it stops serving writes.
const LOW_WATER_MARK: u64 = 32768;

#[derive(Debug)]
pub struct DmsetupThinPool {
    name: String,
    metadata_device: PathBuf,
    block_size_sectors: u64,
}

async fn run(program: &str, args: &[&str]) -> StowageResult<String> {
    tracing::debug!(program, args = ?args, "Running device-mapper tool");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| StowageError::Driver(format!("Failed to execute {program}: {e}")))?;

    if !output.status.success() {
        return Err(StowageError::Driver(format!(
            "{program} {} failed with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl DmsetupThinPool {
    /// Use the pool called `name`, creating it over the given devices when it does not exist yet.
    pub async fn open_or_create(
        name: &str,
        data_device: &Path,
        metadata_device: &Path,
        block_size_sectors: u64,
    ) -> StowageResult<Self> {
        let pool = Self {
            name: name.to_string(),
            metadata_device: metadata_device.to_path_buf(),
            block_size_sectors,
        };
        if pool.is_active(name).await? {
            tracing::info!(pool = %name, "Using existing thin pool");
            return Ok(pool);
        }

        let data_sectors = run(BLOCKDEV, &["--getsz", &data_device.to_string_lossy()]).await?;
        let data_sectors: u64 = data_sectors.trim().parse().map_err(|e| {
            StowageError::Driver(format!(
                "Unexpected size {data_sectors:?} of {}: {e}",
                data_device.display()
            ))
        })?;

        let table = format!(
            "0 {data_sectors} thin-pool {} {} {block_size_sectors} {LOW_WATER_MARK} 1 skip_block_zeroing",
            metadata_device.display(),
            data_device.display()
        );
        run(DMSETUP, &["create", name, "--table", &table]).await?;
        tracing::info!(
            pool = %name,
            data = %data_device.display(),
            metadata = %metadata_device.display(),
            block_size = block_size_sectors,
            "Created thin pool"
        );
        Ok(pool)
    }

    fn pool_device(&self) -> String {
        format!("{DM_DIR}/{}", self.name)
    }

    async fn message(&self, message: &str) -> StowageResult<()> {
        run(DMSETUP, &["message", &self.name, "0", message]).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ThinPool for DmsetupThinPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_size_sectors(&self) -> u64 {
        self.block_size_sectors
    }

    async fn create_thin(&self, dev_id: u32) -> StowageResult<()> {
        self.message(&format!("create_thin {dev_id}")).await
    }

    async fn create_snapshot(
        &self,
        dev_id: u32,
        origin_dev_id: u32,
        origin_name: Option<&str>,
    ) -> StowageResult<()> {
        let message = format!("create_snap {dev_id} {origin_dev_id}");
        let Some(origin) = origin_name else {
            return self.message(&message).await;
        };

        run(DMSETUP, &["suspend", origin]).await?;
        let created = self.message(&message).await;
        let resumed = run(DMSETUP, &["resume", origin]).await;
        created?;
        resumed?;
        Ok(())
    }

    async fn delete_thin(&self, dev_id: u32) -> StowageResult<()> {
        self.message(&format!("delete {dev_id}")).await
    }

    async fn activate(&self, name: &str, dev_id: u32, size: u64) -> StowageResult<PathBuf> {
        let table = format!(
            "0 {} thin {} {dev_id}",
            size / SECTOR_SIZE,
            self.pool_device()
        );
        run(DMSETUP, &["create", name, "--table", &table]).await?;
        Ok(self.device_path(name))
    }

    async fn remove(&self, name: &str) -> StowageResult<()> {
        run(DMSETUP, &["remove", name]).await?;
        Ok(())
    }

    async fn is_active(&self, name: &str) -> StowageResult<bool> {
        let status = Command::new(DMSETUP)
            .args(["info", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| StowageError::Driver(format!("Failed to execute {DMSETUP}: {e}")))?;
        Ok(status.success())
    }

    fn device_path(&self, name: &str) -> PathBuf {
        Path::new(DM_DIR).join(name)
    }

    async fn thin_delta(&self, snap1: u32, snap2: u32) -> StowageResult<String> {
        self.message("reserve_metadata_snap").await?;
        let snap1 = snap1.to_string();
        let snap2 = snap2.to_string();
        let metadata = self.metadata_device.to_string_lossy();
        let delta = run(
            THIN_DELTA,
            &["-m", "--snap1", &snap1, "--snap2", &snap2, &metadata],
        )
        .await;
        if let Err(e) = self.message("release_metadata_snap").await {
            tracing::warn!(pool = %self.name, error = %e, "Failed to release metadata snapshot");
        }
        delta
    }

    async fn status(&self) -> StowageResult<BTreeMap<String, String>> {
        let status = run(DMSETUP, &["status", &self.name]).await?;
        Ok(BTreeMap::from([
            ("pool".to_string(), self.name.clone()),
            ("metadata_device".to_string(), self.metadata_device.display().to_string()),
            ("status".to_string(), status.trim().to_string()),
        ]))
    }
}
