//! Verified boot enforcement levels

use std::fmt;

/// vboot-util flag line reporting hardware enforcement off
pub const HARDWARE_ENFORCE_OFF: &str = "Flags hardware_enforce:  0x00";
/// vboot-util flag line reporting software enforcement on
pub const SOFTWARE_ENFORCE_ON: &str = "Flags software_enforce:  0x01";

/// How the running system protects its boot region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbootEnforcement {
    /// Not a vboot system, or no RO boot region
    None,
    /// RO region enforced by software only
    SoftwareEnforce,
    /// RO region enforced by hardware; its bytes must be preserved
    HardwareEnforce,
}

impl VbootEnforcement {
    /// Classify the output of the vboot utility
    ///
    /// Only the exact "hardware off, software on" combination counts as
    /// software enforcement; anything else is treated as hardware enforced.
    pub fn from_vboot_util_output(output: &str) -> Self {
        if output.contains(HARDWARE_ENFORCE_OFF) && output.contains(SOFTWARE_ENFORCE_ON) {
            Self::SoftwareEnforce
        } else {
            Self::HardwareEnforce
        }
    }
}

impl fmt::Display for VbootEnforcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::SoftwareEnforce => write!(f, "software enforce"),
            Self::HardwareEnforce => write!(f, "hardware enforce"),
        }
    }
}
