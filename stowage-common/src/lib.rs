pub mod driver;
pub mod error;
pub mod mapping;
pub mod metadata;
pub mod model;

pub use driver::{
    BackupOperations, BackupOptions, Capabilities, Capability, CreateVolumeOptions, Driver,
    SnapshotOperations, SnapshotSource, VolumeOperations,
};
pub use error::{ErrorKind, ResultExt, StowageError, StowageResult};
pub use mapping::{BlockExtent, BlockMapping, ExtentKind};
pub use metadata::{read_json, write_json_atomic, MetadataStore};
pub use model::{generate_id, Snapshot, SnapshotDescriptor, Volume, VolumeDescriptor};
