//! flashy-flash: flash devices and update steps
//!
//! Resolves `type:specifier` identifiers to flash devices, detects verified
//! boot, looks for concurrent flashers and runs the built-in update steps.
//!
//! # Example
//!
//! ```ignore
//! use flashy_core::{Config, StepArgs};
//! use flashy_flash::{default_steps, DeviceRegistry, StepContext, SystemCommandRunner};
//!
//! let ctx = StepContext::new(
//!     DeviceRegistry::with_defaults(Config::default()),
//!     Box::new(SystemCommandRunner),
//!     programmer,
//! );
//! let steps = default_steps(Rc::new(ctx));
//! let outcome = steps.run("flash_device", &args);
//! std::process::exit(outcome.exit_code());
//! ```

pub mod device;
pub mod mtd;
pub mod process;
pub mod registry;
pub mod steps;
pub mod vboot;

pub use device::{FlashDevice, FlashDeviceKind, FlashDeviceType};
pub use mtd::{get_mtd, get_mtd_device, MtdDevice};
pub use process::{
    check_other_flasher_running, run_command_with_retries, CommandOutput, CommandRunner,
    SystemCommandRunner, OTHER_FLASHER_BASE_NAMES,
};
pub use registry::{DeviceFactory, DeviceRegistry, DeviceTypeInfo};
pub use steps::{
    default_steps, flash_and_validate, ImageProgrammer, MtdImageProgrammer, StepContext,
    STEP_NAMES,
};
pub use vboot::{patch_image_with_local_bootloader, patching_required, VbootDetector};
