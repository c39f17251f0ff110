//! Flash device model
//!
//! A [`FlashDevice`] is built on demand for one operation and is never
//! cached: its size comes fresh from the kernel device table every time.

use crate::mtd::MtdDevice;
use flashy_core::{ImageValidator, Result};
use flashy_mtd::Mapping;
use log::debug;
use std::fmt;
use std::path::Path;

/// Supported flash technologies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlashDeviceType {
    Mtd,
}

impl FlashDeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mtd => "mtd",
        }
    }
}

impl fmt::Display for FlashDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical flash region
pub trait FlashDevice {
    fn device_type(&self) -> FlashDeviceType;

    /// Instance within the type, e.g. `flash0`
    fn specifier(&self) -> &str;

    /// Raw device file the image is written through
    fn file_path(&self) -> &Path;

    /// Total addressable bytes; no image larger than this may be written
    fn file_size(&self) -> u64;

    /// Map the whole device read-only
    fn map_read_only(&self) -> Result<Mapping>;

    /// Release a mapping from [`FlashDevice::map_read_only`]
    fn unmap(&self, mapping: Mapping) {
        debug!("Unmapping {}B of {}", mapping.len(), self.file_path().display());
        drop(mapping);
    }

    /// Run `validator` against the live device contents
    fn validate(&self, validator: &dyn ImageValidator) -> Result<()>;

    /// `type:specifier`
    fn id(&self) -> String {
        format!("{}:{}", self.device_type(), self.specifier())
    }
}

/// Every flash device flashy knows how to build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashDeviceKind {
    Mtd(MtdDevice),
}

impl FlashDeviceKind {
    fn inner(&self) -> &dyn FlashDevice {
        match self {
            Self::Mtd(dev) => dev,
        }
    }
}

impl FlashDevice for FlashDeviceKind {
    fn device_type(&self) -> FlashDeviceType {
        self.inner().device_type()
    }

    fn specifier(&self) -> &str {
        self.inner().specifier()
    }

    fn file_path(&self) -> &Path {
        self.inner().file_path()
    }

    fn file_size(&self) -> u64 {
        self.inner().file_size()
    }

    fn map_read_only(&self) -> Result<Mapping> {
        self.inner().map_read_only()
    }

    fn validate(&self, validator: &dyn ImageValidator) -> Result<()> {
        self.inner().validate(validator)
    }
}
