//! Block-delta mapping exchanged between drivers and backup destinations.

/// How an extent of the newer snapshot relates to the one it is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtentKind {
    /// Shared by both snapshots. Only reported for full-extent mappings.
    Same,
    /// Mapped in both snapshots with different data.
    Different,
    /// Mapped only in the newer snapshot.
    LeftOnly,
    /// Mapped only in the older snapshot. Reading it from the newer snapshot yields zeros.
    RightOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockExtent {
    /// Byte offset into the device
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
    pub kind: ExtentKind,
}

impl BlockExtent {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockMapping {
    /// Allocation unit of the pool in bytes
    pub block_size: u64,
    /// Whether `Same` extents were kept, which makes the mapping cover every allocated extent.
    pub include_same: bool,
    pub extents: Vec<BlockExtent>,
}

impl BlockMapping {
    pub fn new(block_size: u64, include_same: bool) -> Self {
        Self {
            block_size,
            include_same,
            extents: Vec::new(),
        }
    }

    /// Append an extent, merging it into the previous one when they touch and share a kind.
    pub fn push(&mut self, extent: BlockExtent) {
        if extent.length == 0 {
            return;
        }
        if let Some(last) = self.extents.last_mut() {
            if last.kind == extent.kind && last.end() == extent.offset {
                last.length += extent.length;
                return;
            }
        }
        self.extents.push(extent);
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Total number of bytes covered by the mapping.
    pub fn mapped_bytes(&self) -> u64 {
        self.extents.iter().map(|e| e.length).sum()
    }

    /// The `(offset, length)` ranges, ignoring kinds.
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.extents.iter().map(|e| (e.offset, e.length)).collect()
    }

    /// Split every extent into pieces of at most `chunk_size` bytes.
    pub fn chunks(&self, chunk_size: u64) -> impl Iterator<Item = (u64, u64)> + '_ {
        let chunk_size = chunk_size.max(1);
        self.extents.iter().flat_map(move |extent| {
            let end = extent.end();
            (extent.offset..end)
                .step_by(chunk_size as usize)
                .map(move |offset| (offset, chunk_size.min(end - offset)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(offset: u64, length: u64, kind: ExtentKind) -> BlockExtent {
        BlockExtent {
            offset,
            length,
            kind,
        }
    }

    #[test]
    fn push_merges_adjacent_extents_of_same_kind() {
        let mut mapping = BlockMapping::new(4096, false);
        mapping.push(extent(0, 4096, ExtentKind::Different));
        mapping.push(extent(4096, 4096, ExtentKind::Different));
        mapping.push(extent(8192, 4096, ExtentKind::LeftOnly));
        mapping.push(extent(16384, 0, ExtentKind::LeftOnly));
        assert_eq!(mapping.ranges(), vec![(0, 8192), (8192, 4096)]);
        assert_eq!(mapping.mapped_bytes(), 12288);
    }

    #[test]
    fn chunks_split_long_extents() {
        let mut mapping = BlockMapping::new(4096, true);
        mapping.push(extent(0, 10_000, ExtentKind::Same));
        mapping.push(extent(20_000, 100, ExtentKind::Same));
        let chunks: Vec<_> = mapping.chunks(4096).collect();
        assert_eq!(
            chunks,
            vec![(0, 4096), (4096, 4096), (8192, 1808), (20_000, 100)]
        );
    }
}
