//! Kernel device and mount tables
//!
//! `/proc/mtd` looks like:
//!
//! ```text
//! dev:    size   erasesize  name
//! mtd0: 00060000 00010000 "u-boot"
//! mtd5: 02000000 00010000 "flash0"
//! ```
//!
//! `/proc/mounts` has one `device mountpoint fstype options dump pass` line
//! per mount.

use crate::error::{Error, Result, ResultExt};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::fs;
use std::path::Path;

static MTD_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(?P<dev>mtd[0-9]+): (?P<size>\S+) (?P<erasesize>\S+) "(?P<name>.*)"$"#)
        .expect("mtd table regex is valid")
});

/// Mount point of the writable data partition
pub const DATA_MOUNT_POINT: &str = "/mnt/data";

/// One line of the MTD device table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtdTableEntry {
    /// Device node name, e.g. `mtd5`
    pub dev: String,
    /// Total size in bytes
    pub size: u64,
    /// Erase block size in bytes
    pub erase_size: u64,
    /// Partition name, i.e. the specifier
    pub name: String,
}

/// Parse a hexadecimal table field
fn parse_hex_u64(value: &str) -> Result<u64> {
    u64::from_str_radix(value, 16).map_err(|source| Error::SizeParse {
        value: value.to_string(),
        source,
    })
}

fn entry_from_captures(caps: &Captures<'_>) -> Result<MtdTableEntry> {
    Ok(MtdTableEntry {
        dev: caps["dev"].to_string(),
        size: parse_hex_u64(&caps["size"])?,
        erase_size: parse_hex_u64(&caps["erasesize"])?,
        name: caps["name"].to_string(),
    })
}

fn parse_mtd_line(line: &str) -> Option<Result<MtdTableEntry>> {
    let caps = MTD_LINE_RE.captures(line.trim_end())?;
    Some(entry_from_captures(&caps))
}

/// Parse every well-formed entry of an MTD table, skipping the header
pub fn parse_mtd_table(content: &str) -> Result<Vec<MtdTableEntry>> {
    content.lines().filter_map(parse_mtd_line).collect()
}

/// Find the entry whose name equals `specifier`
///
/// Only the matching line's size fields are parsed, so a malformed line for
/// another partition does not prevent discovery.
pub fn find_mtd_entry(content: &str, specifier: &str, table: &Path) -> Result<MtdTableEntry> {
    for line in content.lines() {
        let Some(caps) = MTD_LINE_RE.captures(line.trim_end()) else {
            continue;
        };
        if &caps["name"] != specifier {
            continue;
        }
        return entry_from_captures(&caps).with_context(|| {
            format!("Invalid entry for '{}' in '{}'", specifier, table.display())
        });
    }

    Err(Error::DeviceTableMismatch {
        specifier: specifier.to_string(),
        table: table.to_path_buf(),
    })
}

/// Whether any entry's name contains `marker`
pub fn has_entry_name_containing(content: &str, marker: &str) -> bool {
    content
        .lines()
        .filter_map(|line| MTD_LINE_RE.captures(line.trim_end()))
        .any(|caps| caps["name"].contains(marker))
}

/// Read the MTD table from `path`
pub fn read_mtd_table(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::io(path, e))
        .context("Unable to read device table")
}

/// One line of the mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
    pub options: Vec<String>,
}

impl MountEntry {
    /// Whether the mount is read-write
    pub fn is_writable(&self) -> bool {
        self.options.iter().any(|o| o == "rw")
    }
}

/// Parse the mount table; lines with fewer than four fields are skipped
pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next()?;
            Some(MountEntry {
                device: device.to_string(),
                mount_point: mount_point.to_string(),
                fs_type: fs_type.to_string(),
                options: options.split(',').map(str::to_string).collect(),
            })
        })
        .collect()
}

/// Read and parse the mount table at `path`
pub fn read_mounts(path: &Path) -> Result<Vec<MountEntry>> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::io(path, e))
        .context("Cannot read mount table")?;
    Ok(parse_mounts(&content))
}

/// Whether the data partition is mounted
pub fn is_data_partition_mounted(mounts: &[MountEntry]) -> bool {
    mounts.iter().any(|m| m.mount_point == DATA_MOUNT_POINT)
}

/// Read-write mounts backed by an MTD block device
///
/// These have to be unmounted or remounted read-only before the underlying
/// flash is erased.
pub fn writable_mtd_mounts(mounts: &[MountEntry]) -> Vec<&MountEntry> {
    mounts
        .iter()
        .filter(|m| {
            m.device
                .rsplit('/')
                .next()
                .is_some_and(|name| name.starts_with("mtdblock"))
                && m.is_writable()
        })
        .collect()
}
