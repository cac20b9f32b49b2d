pub mod coordinator;
pub mod daemon_config;
pub mod index;
pub mod lock;
pub mod registry;
pub mod runtime;
pub mod sys;

pub use coordinator::Coordinator;
pub use daemon_config::DaemonConfig;
pub use index::{Category, IdentifierIndex};
pub use lock::RootLock;
pub use registry::DriverRegistry;
pub use runtime::{
    build_drivers, CreateBackupRequest, CreateSnapshotRequest, CreateVolumeRequest, Runtime,
};
pub use sys::{DriverInfo, SystemInfo};
