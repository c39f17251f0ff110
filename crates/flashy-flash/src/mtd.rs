//! MTD flash devices

use crate::device::{FlashDevice, FlashDeviceKind, FlashDeviceType};
use flashy_core::tables::{find_mtd_entry, read_mtd_table};
use flashy_core::{Config, Error, ImageValidator, Result, ResultExt};
use flashy_mtd::{mtd_block_path, LinuxMtdHost, Mapping, MtdHost};
use log::{debug, info};
use std::io;
use std::path::{Path, PathBuf};

/// An MTD partition found in the device table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtdDevice {
    specifier: String,
    file_path: PathBuf,
    file_size: u64,
}

impl MtdDevice {
    pub fn new(specifier: impl Into<String>, file_path: impl Into<PathBuf>, file_size: u64) -> Self {
        Self {
            specifier: specifier.into(),
            file_path: file_path.into(),
            file_size,
        }
    }
}

/// Look up the MTD partition named `specifier`
pub fn get_mtd(config: &Config, specifier: &str) -> Result<MtdDevice> {
    let table = read_mtd_table(&config.proc_mtd)?;
    let entry = find_mtd_entry(&table, specifier, &config.proc_mtd)?;
    let device = MtdDevice::new(specifier, config.dev_root.join(&entry.dev), entry.size);
    debug!(
        "mtd:{} is {} ({}B)",
        specifier,
        device.file_path.display(),
        device.file_size
    );
    Ok(device)
}

/// Device factory for the `mtd` type
pub fn get_mtd_device(config: &Config, specifier: &str) -> Result<FlashDeviceKind> {
    get_mtd(config, specifier)
        .with_context(|| format!("Unable to get flash device 'mtd:{}'", specifier))
        .map(FlashDeviceKind::Mtd)
}

impl FlashDevice for MtdDevice {
    fn device_type(&self) -> FlashDeviceType {
        FlashDeviceType::Mtd
    }

    fn specifier(&self) -> &str {
        &self.specifier
    }

    fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Maps the block alias, since the character device cannot be mmapped
    fn map_read_only(&self) -> Result<Mapping> {
        let block_path = mtd_block_path(&self.file_path)?;
        let len = usize::try_from(self.file_size).map_err(|_| {
            Error::io(
                &block_path,
                io::Error::new(io::ErrorKind::InvalidInput, "device too large to map"),
            )
        })?;
        LinuxMtdHost
            .map_read_only(&block_path, Some(len))
            .with_context(|| format!("Unable to map flash device '{}'", self.id()))
    }

    fn validate(&self, validator: &dyn ImageValidator) -> Result<()> {
        let mapping = self.map_read_only()?;
        let result = validator.validate(&self.id(), &mapping);
        self.unmap(mapping);
        result?;
        info!("Flash device '{}' is valid", self.id());
        Ok(())
    }
}
