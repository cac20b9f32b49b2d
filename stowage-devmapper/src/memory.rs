//! Thin pool kept in process memory, for tests.
//!
//! The daemon always drives the kernel pool through [`crate::DmsetupThinPool`]. This pool stands in
//! for it wherever the driver is exercised without device-mapper.
//!
//! Every thin device is a sparse map of pool blocks. Snapshots share blocks with their origin
//! until either side is rewritten, so block identity tells `thin_delta` what is shared exactly the
//! way the kernel's mapping tree does. Activated devices are materialized as files in a device
//! directory. Their contents are folded back into the block map whenever the pool needs a
//! consistent view (snapshotting, diffing or removal).

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Write as _,
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
};

use stowage_common::{ResultExt, StowageError, StowageResult};
use stowage_config::SECTOR_SIZE;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::pool::ThinPool;

type BlockData = Arc<[u8]>;

#[derive(Debug, Default, Clone)]
struct ThinDevice {
    blocks: BTreeMap<u64, BlockData>,
}

#[derive(Debug, Clone, Copy)]
struct ActiveDevice {
    dev_id: u32,
    size: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    devices: HashMap<u32, ThinDevice>,
    active: HashMap<String, ActiveDevice>,
    transaction: u64,
}

/// Test stand-in for the kernel thin pool.
#[derive(Debug)]
pub struct InMemoryThinPool {
    name: String,
    block_size_sectors: u64,
    dev_dir: PathBuf,
    state: parking_lot::Mutex<PoolState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeltaKind {
    Same,
    Different,
    LeftOnly,
    RightOnly,
}

impl DeltaKind {
    fn tag(self) -> &'static str {
        match self {
            DeltaKind::Same => "same",
            DeltaKind::Different => "different",
            DeltaKind::LeftOnly => "left_only",
            DeltaKind::RightOnly => "right_only",
        }
    }
}

impl InMemoryThinPool {
    /// Create a pool whose activated devices appear as files under `dev_dir`.
    pub fn new(
        name: impl Into<String>,
        block_size_sectors: u64,
        dev_dir: impl Into<PathBuf>,
    ) -> StowageResult<Self> {
        let dev_dir = dev_dir.into();
        std::fs::create_dir_all(&dev_dir)
            .with_context(|| format!("create device directory {}", dev_dir.display()))?;
        Ok(Self {
            name: name.into(),
            block_size_sectors: block_size_sectors.max(1),
            dev_dir,
            state: parking_lot::Mutex::new(PoolState::default()),
        })
    }

    fn block_size(&self) -> u64 {
        self.block_size_sectors * SECTOR_SIZE
    }

    /// Number of pool blocks mapped by `dev_id`.
    pub fn mapped_blocks(&self, dev_id: u32) -> Option<usize> {
        self.state
            .lock()
            .devices
            .get(&dev_id)
            .map(|d| d.blocks.len())
    }

    fn name_of(state: &PoolState, dev_id: u32) -> Option<String> {
        state
            .active
            .iter()
            .find(|(_, active)| active.dev_id == dev_id)
            .map(|(name, _)| name.clone())
    }

    /// Fold the file of active device `name` back into its block map.
    async fn sync_back(&self, name: &str) -> StowageResult<()> {
        let Some(active) = self.state.lock().active.get(name).copied() else {
            return Ok(());
        };
        let path = self.device_path(name);
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("read device {}", path.display()))?;

        let data = &data[..data.len().min(active.size as usize)];
        let block_size = self.block_size() as usize;
        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(&active.dev_id)
            .ok_or_else(|| StowageError::Driver(format!("Thin device {} vanished", active.dev_id)))?;

        let mut written = 0usize;
        for (index, chunk) in data.chunks(block_size).enumerate() {
            let index = index as u64;
            let unchanged = match device.blocks.get(&index) {
                Some(current) => current[..chunk.len()] == *chunk,
                None => chunk.iter().all(|b| *b == 0),
            };
            if unchanged {
                continue;
            }
            let mut block = vec![0u8; block_size];
            block[..chunk.len()].copy_from_slice(chunk);
            device.blocks.insert(index, Arc::from(block));
            written += 1;
        }

        if written > 0 {
            tracing::trace!(device = %name, dev_id = active.dev_id, blocks = written, "Provisioned blocks");
        }
        Ok(())
    }

    async fn sync_dev(&self, dev_id: u32) -> StowageResult<()> {
        let name = Self::name_of(&self.state.lock(), dev_id);
        match name {
            Some(name) => self.sync_back(&name).await,
            None => Ok(()),
        }
    }

    fn render_delta(&self, state: &PoolState, snap1: u32, snap2: u32) -> StowageResult<String> {
        let missing = |id: u32| StowageError::Driver(format!("Thin device {id} does not exist"));
        let left = state.devices.get(&snap1).ok_or_else(|| missing(snap1))?;
        let right = state.devices.get(&snap2).ok_or_else(|| missing(snap2))?;

        let mut indices: Vec<u64> = left.blocks.keys().chain(right.blocks.keys()).copied().collect();
        indices.sort_unstable();
        indices.dedup();

        let mut runs: Vec<(DeltaKind, u64, u64)> = Vec::new();
        for index in indices {
            let kind = match (left.blocks.get(&index), right.blocks.get(&index)) {
                (Some(l), Some(r)) if Arc::ptr_eq(l, r) => DeltaKind::Same,
                (Some(_), Some(_)) => DeltaKind::Different,
                (Some(_), None) => DeltaKind::LeftOnly,
                (None, Some(_)) => DeltaKind::RightOnly,
                (None, None) => continue,
            };
            match runs.last_mut() {
                Some((last, begin, length)) if *last == kind && *begin + *length == index => {
                    *length += 1
                }
                _ => runs.push((kind, index, 1)),
            }
        }

        let mut xml = String::new();
        let _ = writeln!(
            xml,
            r#"<superblock uuid="" time="0" transaction="{}" data_block_size="{}" nr_data_blocks="0">"#,
            state.transaction, self.block_size_sectors
        );
        let _ = writeln!(xml, r#"  <diff left="{snap1}" right="{snap2}">"#);
        for (kind, begin, length) in runs {
            let _ = writeln!(xml, r#"    <{} begin="{begin}" length="{length}"/>"#, kind.tag());
        }
        let _ = writeln!(xml, "  </diff>");
        let _ = writeln!(xml, "</superblock>");
        Ok(xml)
    }
}

async fn materialize(
    path: &Path,
    size: u64,
    block_size: u64,
    blocks: Vec<(u64, BlockData)>,
) -> StowageResult<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("create device {}", path.display()))?;
    file.set_len(size)
        .await
        .with_context(|| format!("size device {}", path.display()))?;

    for (index, data) in blocks {
        let offset = index * block_size;
        if offset >= size {
            break;
        }
        let len = data.len().min((size - offset) as usize);
        file.seek(SeekFrom::Start(offset))
            .await
            .with_context(|| format!("seek device {}", path.display()))?;
        file.write_all(&data[..len])
            .await
            .with_context(|| format!("write device {}", path.display()))?;
    }
    file.sync_all()
        .await
        .with_context(|| format!("sync device {}", path.display()))?;
    Ok(())
}

#[async_trait::async_trait]
impl ThinPool for InMemoryThinPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_size_sectors(&self) -> u64 {
        self.block_size_sectors
    }

    async fn create_thin(&self, dev_id: u32) -> StowageResult<()> {
        let mut state = self.state.lock();
        if state.devices.contains_key(&dev_id) {
            return Err(StowageError::Driver(format!("Thin device {dev_id} already exists")));
        }
        state.devices.insert(dev_id, ThinDevice::default());
        state.transaction += 1;
        Ok(())
    }

    async fn create_snapshot(
        &self,
        dev_id: u32,
        origin_dev_id: u32,
        _origin_name: Option<&str>,
    ) -> StowageResult<()> {
        self.sync_dev(origin_dev_id).await?;

        let mut state = self.state.lock();
        if state.devices.contains_key(&dev_id) {
            return Err(StowageError::Driver(format!("Thin device {dev_id} already exists")));
        }
        let origin = state
            .devices
            .get(&origin_dev_id)
            .cloned()
            .ok_or_else(|| StowageError::Driver(format!("Thin device {origin_dev_id} does not exist")))?;
        state.devices.insert(dev_id, origin);
        state.transaction += 1;
        Ok(())
    }

    async fn delete_thin(&self, dev_id: u32) -> StowageResult<()> {
        let mut state = self.state.lock();
        if let Some(name) = Self::name_of(&state, dev_id) {
            return Err(StowageError::Driver(format!(
                "Thin device {dev_id} is still active as {name}"
            )));
        }
        state
            .devices
            .remove(&dev_id)
            .ok_or_else(|| StowageError::Driver(format!("Thin device {dev_id} does not exist")))?;
        state.transaction += 1;
        Ok(())
    }

    async fn activate(&self, name: &str, dev_id: u32, size: u64) -> StowageResult<PathBuf> {
        let blocks: Vec<(u64, BlockData)> = {
            let mut state = self.state.lock();
            if state.active.contains_key(name) {
                return Err(StowageError::Driver(format!("Device {name} already exists")));
            }
            let device = state
                .devices
                .get(&dev_id)
                .ok_or_else(|| StowageError::Driver(format!("Thin device {dev_id} does not exist")))?;
            let blocks = device.blocks.iter().map(|(i, b)| (*i, b.clone())).collect();
            state.active.insert(name.to_string(), ActiveDevice { dev_id, size });
            blocks
        };

        let path = self.device_path(name);
        if let Err(e) = materialize(&path, size, self.block_size(), blocks).await {
            self.state.lock().active.remove(name);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
        Ok(path)
    }

    async fn remove(&self, name: &str) -> StowageResult<()> {
        if !self.state.lock().active.contains_key(name) {
            return Err(StowageError::Driver(format!("Device {name} does not exist")));
        }
        self.sync_back(name).await?;
        self.state.lock().active.remove(name);

        let path = self.device_path(name);
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("remove device {}", path.display()))?;
        Ok(())
    }

    async fn is_active(&self, name: &str) -> StowageResult<bool> {
        Ok(self.state.lock().active.contains_key(name))
    }

    fn device_path(&self, name: &str) -> PathBuf {
        self.dev_dir.join(name)
    }

    async fn thin_delta(&self, snap1: u32, snap2: u32) -> StowageResult<String> {
        self.sync_dev(snap1).await?;
        self.sync_dev(snap2).await?;
        let state = self.state.lock();
        self.render_delta(&state, snap1, snap2)
    }

    async fn status(&self) -> StowageResult<BTreeMap<String, String>> {
        let state = self.state.lock();
        let mapped: usize = state.devices.values().map(|d| d.blocks.len()).sum();
        Ok(BTreeMap::from([
            ("pool".to_string(), self.name.clone()),
            ("thin_devices".to_string(), state.devices.len().to_string()),
            ("active_devices".to_string(), state.active.len().to_string()),
            ("mapped_blocks".to_string(), mapped.to_string()),
            ("transaction".to_string(), state.transaction.to_string()),
        ]))
    }
}
