//! Device-mapper thin-provisioning driver.

mod backup;
pub mod delta;
pub mod dmsetup;
pub mod driver;
pub mod memory;
pub mod pool;

pub use delta::parse_thin_delta;
pub use dmsetup::DmsetupThinPool;
pub use driver::{ThinDriver, DRIVER_NAME};
pub use memory::InMemoryThinPool;
pub use pool::ThinPool;
