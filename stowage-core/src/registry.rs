use std::sync::Arc;

use indexmap::IndexMap;
use stowage_common::{Capability, Driver, StowageError, StowageResult};

/// Drivers by name, in registration order. The first registered driver is the default until
/// another one is chosen.
#[derive(Debug, Default)]
pub struct DriverRegistry {
    drivers: IndexMap<String, Arc<dyn Driver>>,
    default_driver: Option<String>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, driver: Arc<dyn Driver>) -> StowageResult<()> {
        if self.drivers.contains_key(name) {
            return Err(StowageError::Conflict(format!(
                "Driver {name} is already registered"
            )));
        }
        tracing::info!(driver = name, capabilities = ?driver.capabilities().list(), "Registered driver");
        self.drivers.insert(name.to_string(), driver);
        if self.default_driver.is_none() {
            self.default_driver = Some(name.to_string());
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> StowageResult<Arc<dyn Driver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| StowageError::NotFound(format!("Driver {name}")))
    }

    pub fn set_default(&mut self, name: &str) -> StowageResult<()> {
        self.get(name)?;
        self.default_driver = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_driver.as_deref()
    }

    pub fn default_driver(&self) -> StowageResult<Arc<dyn Driver>> {
        match &self.default_driver {
            Some(name) => self.get(name),
            None => Err(StowageError::NotFound("Default driver".to_string())),
        }
    }

    /// The named driver, or the default one when no name is given.
    pub fn get_or_default(&self, name: Option<&str>) -> StowageResult<Arc<dyn Driver>> {
        match name {
            Some(name) if !name.is_empty() => self.get(name),
            _ => self.default_driver(),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Driver>)> {
        self.drivers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn supporting(&self, capability: Capability) -> Vec<String> {
        self.drivers
            .iter()
            .filter(|(_, d)| d.capabilities().supports(capability))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use stowage_common::{Capabilities, ErrorKind};

    use super::*;

    #[derive(Debug)]
    struct Stub(&'static str, Capabilities);

    #[async_trait::async_trait]
    impl Driver for Stub {
        fn name(&self) -> &str {
            self.0
        }

        fn capabilities(&self) -> Capabilities {
            self.1
        }

        async fn info(&self) -> StowageResult<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = DriverRegistry::new();
        let thin = Capabilities::NONE
            .with(Capability::Volume)
            .with(Capability::Snapshot)
            .with(Capability::Backup);
        registry.register("thin", Arc::new(Stub("thin", thin))).unwrap();
        registry
            .register("plain", Arc::new(Stub("plain", Capabilities::NONE.with(Capability::Volume))))
            .unwrap();

        assert_eq!(registry.get("plain").unwrap().name(), "plain");
        assert_eq!(registry.get("nope").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(registry.default_name(), Some("thin"));
        assert_eq!(registry.get_or_default(None).unwrap().name(), "thin");
        assert_eq!(registry.get_or_default(Some("")).unwrap().name(), "thin");
        assert_eq!(registry.names(), vec!["thin", "plain"]);
        assert_eq!(registry.supporting(Capability::Backup), vec!["thin"]);

        let err = registry
            .register("thin", Arc::new(Stub("thin", thin)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        registry.set_default("plain").unwrap();
        assert_eq!(registry.default_driver().unwrap().name(), "plain");
        assert_eq!(registry.set_default("gone").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(registry.default_name(), Some("plain"));

        let plain = registry.get("plain").unwrap();
        assert_eq!(
            plain.backup_ops().err().unwrap().kind(),
            ErrorKind::UnsupportedCapability
        );
    }

    #[test]
    fn empty_registry_has_no_default() {
        let registry = DriverRegistry::new();
        assert_eq!(registry.default_driver().unwrap_err().kind(), ErrorKind::NotFound);
    }
}
