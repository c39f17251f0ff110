//! flashy-core: shared types for the flashy BMC firmware updater
//!
//! This crate holds everything that does not touch hardware:
//!
//! - Device identifiers and the MTD / mount table parsers
//! - The error taxonomy
//! - Host configuration
//! - Vboot enforcement levels and image validation
//! - Step outcomes and the step registry

pub mod config;
pub mod device_id;
pub mod error;
pub mod step;
pub mod tables;
pub mod validate;
pub mod vboot;

pub use config::Config;
pub use device_id::{parse_device_id, DeviceId};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use step::{Step, StepArgs, StepOutcome, StepRegistry, StepState};
pub use validate::{ImageValidator, UBootChecksumValidator, UBootMagicValidator};
pub use vboot::VbootEnforcement;
