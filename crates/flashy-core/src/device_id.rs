//! Flash device identifiers
//!
//! A device is named `<type>:<specifier>`, e.g. `mtd:flash0`. The type
//! selects the technology, the specifier names the instance within it.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static DEVICE_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<type>[a-z]+):(?P<specifier>.+)$").expect("device id regex is valid")
});

/// Parsed `<type>:<specifier>` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId {
    /// Technology, e.g. `mtd`
    pub device_type: String,
    /// Instance within the technology, e.g. `flash0`
    pub specifier: String,
}

impl DeviceId {
    /// Parse a device identifier
    pub fn parse(id: &str) -> Result<Self> {
        let caps = DEVICE_ID_RE
            .captures(id)
            .ok_or_else(|| Error::Parse { id: id.to_string() })?;
        Ok(Self {
            device_type: caps["type"].to_string(),
            specifier: caps["specifier"].to_string(),
        })
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_type, self.specifier)
    }
}

/// Split a device identifier into `(type, specifier)`
pub fn parse_device_id(id: &str) -> Result<(String, String)> {
    let parsed = DeviceId::parse(id)?;
    Ok((parsed.device_type, parsed.specifier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_valid() {
        assert_eq!(
            parse_device_id("mtd:flash0").unwrap(),
            ("mtd".to_string(), "flash0".to_string())
        );
        // Everything after the first colon belongs to the specifier
        assert_eq!(
            parse_device_id("emmc:mmcblk0:p1").unwrap(),
            ("emmc".to_string(), "mmcblk0:p1".to_string())
        );
    }

    #[test]
    fn test_round_trip() {
        for id in ["mtd:flash0", "mtd:flash1rw", "abc:x", "mtd:u-boot env"] {
            let parsed = DeviceId::parse(id).unwrap();
            assert_eq!(parsed.to_string(), id);
        }
    }

    #[test]
    fn test_parse_invalid() {
        for id in ["", "mtd", "mtd:", ":flash0", "MTD:flash0", "mtd0:flash0", " mtd:flash0"] {
            let err = parse_device_id(id).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ParseError, "id {:?}", id);
        }
    }
}
