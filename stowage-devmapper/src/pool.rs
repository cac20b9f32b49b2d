use std::{collections::BTreeMap, fmt::Debug, path::PathBuf};

use stowage_common::StowageResult;

/// Operations on a device-mapper thin pool.
///
/// Thin devices are addressed by their 24 bit pool device id, activated devices by name.
#[async_trait::async_trait]
pub trait ThinPool: Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Allocation unit in 512 byte sectors.
    fn block_size_sectors(&self) -> u64;

    async fn create_thin(&self, dev_id: u32) -> StowageResult<()>;

    /// Snapshot `origin_dev_id` into `dev_id`. `origin_name` is the origin's active device, which
    /// has to be quiesced while the snapshot is taken.
    async fn create_snapshot(
        &self,
        dev_id: u32,
        origin_dev_id: u32,
        origin_name: Option<&str>,
    ) -> StowageResult<()>;

    async fn delete_thin(&self, dev_id: u32) -> StowageResult<()>;

    /// Expose `dev_id` as a block device of `size` bytes called `name`.
    async fn activate(&self, name: &str, dev_id: u32, size: u64) -> StowageResult<PathBuf>;

    async fn remove(&self, name: &str) -> StowageResult<()>;

    async fn is_active(&self, name: &str) -> StowageResult<bool>;

    fn device_path(&self, name: &str) -> PathBuf;

    /// `thin_delta` XML describing how `snap1` differs from `snap2`.
    async fn thin_delta(&self, snap1: u32, snap2: u32) -> StowageResult<String>;

    async fn status(&self) -> StowageResult<BTreeMap<String, String>>;
}
