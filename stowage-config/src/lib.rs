use std::path::PathBuf;

use envconfig::Envconfig;
use lazy_static::lazy_static;

/// One sector in bytes. Thin pool block sizes are expressed in sectors.
pub const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, Envconfig)]
pub struct Config {
    #[envconfig(from = "STOWAGE_ROOT", default = "/var/lib/stowage")]
    pub root: PathBuf,
    #[envconfig(from = "STOWAGE_PORT", default = "5007")]
    pub port: u16,
    #[envconfig(from = "STOWAGE_HOST", default = "127.0.0.1")]
    pub host: String,
    #[envconfig(from = "STOWAGE_LOG_LEVEL", default = "info")]
    pub log_level: String,
    /// Comma separated list of drivers to initialize. The first one is the default driver.
    #[envconfig(from = "STOWAGE_DRIVERS", default = "devmapper")]
    pub drivers: String,

    #[envconfig(from = "STOWAGE_DM_POOL_NAME", default = "stowage-pool")]
    pub dm_pool_name: String,
    #[envconfig(from = "STOWAGE_DM_DATA_DEVICE")]
    pub dm_data_device: Option<PathBuf>,
    #[envconfig(from = "STOWAGE_DM_METADATA_DEVICE")]
    pub dm_metadata_device: Option<PathBuf>,
    /// Thin pool block size in sectors
    #[envconfig(from = "STOWAGE_DM_BLOCK_SIZE", default = "4096")]
    pub dm_block_size: u64,
    //Default volume size in bytes (100 GiB)
    #[envconfig(from = "STOWAGE_DM_DEFAULT_VOLUME_SIZE", default = "107374182400")]
    pub dm_default_volume_size: u64,

    //Default loopback image size in bytes (10 GiB)
    #[envconfig(from = "STOWAGE_LOOPBACK_DEFAULT_VOLUME_SIZE", default = "10737418240")]
    pub loopback_default_volume_size: u64,

    /// Largest chunk uploaded to a backup destination in one object
    #[envconfig(from = "STOWAGE_BACKUP_CHUNK_SIZE", default = "2097152")]
    pub backup_chunk_size: u64,
}

impl Config {
    pub fn init() -> Config {
        Config::init_from_env().expect("Failed to load config")
    }

    /// Drivers listed in `STOWAGE_DRIVERS`, in order, with blanks removed.
    pub fn driver_list(&self) -> Vec<String> {
        self.drivers
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Thin pool block size in bytes.
    pub fn dm_block_size_bytes(&self) -> u64 {
        self.dm_block_size * SECTOR_SIZE
    }
}

lazy_static! {
    pub static ref CONFIG: Config = Config::init();
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_are_applied() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(config.root, PathBuf::from("/var/lib/stowage"));
        assert_eq!(config.driver_list(), vec!["devmapper".to_string()]);
        assert_eq!(config.dm_block_size_bytes(), 2 * 1024 * 1024);
        assert_eq!(config.backup_chunk_size, 2 * 1024 * 1024);
        assert!(config.dm_data_device.is_none());
    }

    #[test]
    fn driver_list_is_trimmed() {
        let mut env = HashMap::new();
        env.insert("STOWAGE_DRIVERS".to_string(), " loopback, devmapper ,,".to_string());
        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(
            config.driver_list(),
            vec!["loopback".to_string(), "devmapper".to_string()]
        );
    }
}
