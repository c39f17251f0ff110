//! Flash device registry
//!
//! Maps a device type name to the factory that builds devices of that type.
//! The registry is built once at startup and passed to whatever needs to
//! resolve `type:specifier` identifiers.

use crate::device::FlashDeviceKind;
use crate::mtd::get_mtd_device;
use flashy_core::{Config, DeviceId, Error, Result};
use log::debug;
use std::collections::BTreeMap;

/// Builds a device from its specifier
pub type DeviceFactory = fn(&Config, &str) -> Result<FlashDeviceKind>;

/// Information about a registered device type
#[derive(Debug, Clone, Copy)]
pub struct DeviceTypeInfo {
    pub name: &'static str,
    pub description: &'static str,
    factory: DeviceFactory,
}

/// Resolves device identifiers to flash devices
pub struct DeviceRegistry {
    config: Config,
    types: BTreeMap<&'static str, DeviceTypeInfo>,
}

impl DeviceRegistry {
    /// An empty registry
    pub fn new(config: Config) -> Self {
        Self {
            config,
            types: BTreeMap::new(),
        }
    }

    /// A registry with every built-in device type
    pub fn with_defaults(config: Config) -> Self {
        let mut registry = Self::new(config);
        registry.register(
            "mtd",
            "Linux MTD partition, by name in the MTD device table",
            get_mtd_device,
        );
        registry
    }

    /// Register `factory` for `name`, replacing any previous one
    pub fn register(
        &mut self,
        name: &'static str,
        description: &'static str,
        factory: DeviceFactory,
    ) {
        self.types.insert(
            name,
            DeviceTypeInfo {
                name,
                description,
                factory,
            },
        );
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registered device types, sorted by name
    pub fn device_types(&self) -> Vec<DeviceTypeInfo> {
        self.types.values().copied().collect()
    }

    /// Build the device named by `id`
    pub fn get_flash_device(&self, id: &str) -> Result<FlashDeviceKind> {
        let id = DeviceId::parse(id)?;
        let info = self
            .types
            .get(id.device_type.as_str())
            .ok_or_else(|| Error::UnknownDeviceType(id.device_type.clone()))?;
        debug!("Resolving {} with the '{}' factory", id, info.name);
        (info.factory)(&self.config, &id.specifier)
    }
}
