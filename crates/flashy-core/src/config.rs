//! Host configuration
//!
//! Every kernel table, device node and helper binary that flashy touches is
//! reached through a [`Config`]. Production uses [`Config::default`]; a TOML
//! file can override any key:
//!
//! ```toml
//! proc_mtd = "/proc/mtd"
//! dev_root = "/dev"
//! vboot_specifier = "flash1"
//! vboot_offset = "384 KiB"
//! command_timeout_secs = 30
//! uboot_partition_size = "0x60000"
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Paths and constants used by discovery, vboot detection and flashing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// MTD device table
    pub proc_mtd: PathBuf,
    /// Mount table
    pub proc_mounts: PathBuf,
    /// procfs root, scanned for other flasher processes
    pub proc_root: PathBuf,
    /// Directory holding the `mtdN` / `mtdblockN` nodes
    pub dev_root: PathBuf,
    /// Hardware watchdog device
    pub watchdog: PathBuf,
    /// Timeout requested from the watchdog when petting it, in seconds
    pub watchdog_timeout_secs: u32,
    /// Verified boot status utility
    pub vboot_util: PathBuf,
    /// Cache files removed before running the vboot utility
    pub vboot_cache_files: Vec<PathBuf>,
    /// Substring of a device table name that marks a vboot RO region
    pub vboot_marker: String,
    /// Specifier of the flash that carries the RO bootloader
    pub vboot_specifier: String,
    /// Size of the RO bootloader region
    #[serde(deserialize_with = "deserialize_size")]
    pub vboot_offset: u32,
    /// Timeout for external commands, in seconds
    pub command_timeout_secs: u64,
    /// Size of the U-Boot partition at the start of the flash
    ///
    /// When set, devices are validated by the partition's md5sum instead of
    /// the U-Boot magic alone.
    #[serde(deserialize_with = "deserialize_opt_size")]
    pub uboot_partition_size: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proc_mtd: PathBuf::from("/proc/mtd"),
            proc_mounts: PathBuf::from("/proc/mounts"),
            proc_root: PathBuf::from("/proc"),
            dev_root: PathBuf::from("/dev"),
            watchdog: PathBuf::from("/dev/watchdog"),
            watchdog_timeout_secs: 300,
            vboot_util: PathBuf::from("/usr/local/bin/vboot-util"),
            vboot_cache_files: vec![
                PathBuf::from("/tmp/cache_store/rom_version"),
                PathBuf::from("/tmp/cache_store/rom_uboot_version"),
            ],
            vboot_marker: "romx".to_string(),
            vboot_specifier: "flash1".to_string(),
            vboot_offset: 384 * 1024,
            command_timeout_secs: 30,
            uboot_partition_size: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Timeout for external commands
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Deserialize a u32 that can be an integer, hex string or size string
fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeOrInt {
        Int(u32),
        Str(String),
    }

    match SizeOrInt::deserialize(deserializer)? {
        SizeOrInt::Int(n) => Ok(n),
        SizeOrInt::Str(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

fn deserialize_opt_size<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserialize_size(deserializer).map(Some)
}

/// Parse a size string like "384 KiB", "0x60000" or "393216"
pub fn parse_size(s: &str) -> std::result::Result<u32, String> {
    let s = s.trim();

    if let Ok(n) = s.parse::<u32>() {
        return Ok(n);
    }

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u32::from_str_radix(hex.trim(), 16).map_err(|e| format!("invalid hex: {}", e));
    }

    let s_lower = s.to_lowercase();
    let (num_str, multiplier) = if let Some(n) = s_lower.strip_suffix("mib") {
        (n.trim(), 1024 * 1024)
    } else if let Some(n) = s_lower.strip_suffix("kib") {
        (n.trim(), 1024)
    } else if let Some(n) = s_lower.strip_suffix('b') {
        (n.trim(), 1)
    } else {
        return Err(format!("invalid size: {}", s));
    };

    let num: u32 = num_str.parse().map_err(|_| format!("invalid size: {}", s))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size overflows u32: {}", s))
}
