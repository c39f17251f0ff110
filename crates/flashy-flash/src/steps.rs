//! Update steps
//!
//! Every step classifies its own failure. The rule of thumb: a failure
//! before anything was written, or that leaves device and image provably
//! untouched, is safe to reboot; a failure after a write whose result is not
//! confirmed is not.

use crate::device::FlashDevice;
use crate::process::{check_other_flasher_running, CommandRunner};
use crate::registry::DeviceRegistry;
use crate::vboot::{patch_image_with_local_bootloader, patching_required, VbootDetector};
use flashy_core::tables::{read_mounts, writable_mtd_mounts};
use flashy_core::{
    Config, Error, ImageValidator, Result, Step, StepArgs, StepOutcome, StepRegistry,
    UBootChecksumValidator, UBootMagicValidator, VbootEnforcement,
};
use flashy_mtd::{mtd_block_path, FlashCp, FlashProgress, MtdHost, Watchdog};
use log::info;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

pub const FLASH_DEVICE: &str = "flash_device";
pub const VALIDATE_DEVICE: &str = "validate_device";
pub const VBOOT_PATCH: &str = "vboot_patch";
pub const CHECK_OTHER_FLASHER: &str = "check_other_flasher";

/// Names of every built-in step
///
/// Also treated as flasher names when looking for concurrent updates.
pub const STEP_NAMES: &[&str] = &[FLASH_DEVICE, VALIDATE_DEVICE, VBOOT_PATCH, CHECK_OTHER_FLASHER];

/// Writes an image on to a device
pub trait ImageProgrammer {
    fn program(&self, image_path: &Path, device_path: &Path, ro_offset: u32) -> Result<()>;
}

/// [`ImageProgrammer`] backed by the MTD engine
pub struct MtdImageProgrammer<H: MtdHost> {
    host: H,
    watchdog: Box<dyn Watchdog>,
    progress: RefCell<Box<dyn FlashProgress>>,
}

impl<H: MtdHost> MtdImageProgrammer<H> {
    pub fn new(host: H, watchdog: Box<dyn Watchdog>, progress: Box<dyn FlashProgress>) -> Self {
        Self {
            host,
            watchdog,
            progress: RefCell::new(progress),
        }
    }
}

impl<H: MtdHost> ImageProgrammer for MtdImageProgrammer<H> {
    fn program(&self, image_path: &Path, device_path: &Path, ro_offset: u32) -> Result<()> {
        let mut progress = self.progress.borrow_mut();
        FlashCp::new(&self.host, self.watchdog.as_ref()).flash_cp(
            image_path,
            device_path,
            ro_offset,
            progress.as_mut(),
        )?;
        Ok(())
    }
}

/// Program, validate and check for concurrent flashers
///
/// - Programming fails: safe to reboot; verify never attested a new image
/// - Validation fails: safe to reboot and retry
/// - Another flasher is running: unsafe, the device state is ambiguous
pub fn flash_and_validate(
    programmer: &dyn ImageProgrammer,
    device: &dyn FlashDevice,
    validator: &dyn ImageValidator,
    image_path: &Path,
    ro_offset: u32,
    check_other_flasher: impl FnOnce() -> Result<()>,
) -> StepOutcome {
    if let Err(e) = programmer.program(image_path, device.file_path(), ro_offset) {
        return StepOutcome::SafeToReboot(e.context(format!(
            "Unable to flash '{}' on to '{}'",
            image_path.display(),
            device.id()
        )));
    }

    if let Err(e) = device.validate(validator) {
        return StepOutcome::SafeToReboot(
            e.context(format!("Flash device '{}' failed validation", device.id())),
        );
    }

    if let Err(e) = check_other_flasher() {
        return StepOutcome::UnsafeToReboot(e);
    }

    StepOutcome::Success
}

/// Everything the built-in steps share
pub struct StepContext {
    pub devices: DeviceRegistry,
    pub runner: Box<dyn CommandRunner>,
    pub programmer: Box<dyn ImageProgrammer>,
    /// Replaces the default U-Boot validators when set
    pub validator: Option<Box<dyn ImageValidator>>,
}

impl StepContext {
    pub fn new(
        devices: DeviceRegistry,
        runner: Box<dyn CommandRunner>,
        programmer: Box<dyn ImageProgrammer>,
    ) -> Self {
        Self {
            devices,
            runner,
            programmer,
            validator: None,
        }
    }

    pub fn config(&self) -> &Config {
        self.devices.config()
    }

    pub fn detector(&self) -> VbootDetector<'_> {
        VbootDetector::new(self.config(), self.runner.as_ref())
    }

    fn with_validator<R>(
        &self,
        enforcement: VbootEnforcement,
        f: impl FnOnce(&dyn ImageValidator) -> R,
    ) -> R {
        match (&self.validator, self.config().uboot_partition_size) {
            (Some(validator), _) => f(validator.as_ref()),
            (None, Some(size)) => f(&UBootChecksumValidator::new(enforcement)
                .with_partition_size(size as usize)),
            (None, None) => f(&UBootMagicValidator::new(enforcement)),
        }
    }

    fn check_other_flasher(&self) -> Result<()> {
        check_other_flasher_running(&self.config().proc_root, STEP_NAMES)
    }

    /// Fail if the device's block alias is mounted read-write
    fn check_not_mounted_writable(&self, device: &dyn FlashDevice) -> Result<()> {
        let block_path = mtd_block_path(device.file_path())?;
        let mounts = read_mounts(&self.config().proc_mounts)?;
        let block_name = block_path.file_name();
        let mounted = writable_mtd_mounts(&mounts)
            .into_iter()
            .find(|m| Path::new(&m.device).file_name() == block_name);
        match mounted {
            Some(m) => Err(Error::ValidationFailure {
                target: device.id(),
                reason: format!("'{}' is mounted read-write on {}", m.device, m.mount_point),
            }),
            None => Ok(()),
        }
    }
}

/// Flash an image, keeping the RO bootloader on hardware-enforced vboot
pub struct FlashDeviceStep(Rc<StepContext>);

impl Step for FlashDeviceStep {
    fn name(&self) -> &'static str {
        FLASH_DEVICE
    }

    fn run(&self, args: &StepArgs) -> StepOutcome {
        let ctx = &self.0;
        let device = match ctx.devices.get_flash_device(&args.device_id) {
            Ok(device) => device,
            Err(e) => return StepOutcome::SafeToReboot(e),
        };

        if let Err(e) = ctx.check_not_mounted_writable(&device) {
            return StepOutcome::SafeToReboot(e.context("Flash device is in use"));
        }

        let enforcement = match ctx.detector().get_vboot_enforcement() {
            Ok(enforcement) => enforcement,
            Err(e) => {
                return StepOutcome::SafeToReboot(
                    e.context("Unable to determine vboot enforcement"),
                )
            }
        };

        let mut ro_offset = 0;
        if patching_required(ctx.config(), enforcement, device.specifier()) {
            let offset = ctx.config().vboot_offset;
            if let Err(e) = patch_image_with_local_bootloader(&args.image_path, &device, offset) {
                return StepOutcome::SafeToReboot(
                    e.context("Failed to patch image with local bootloader"),
                );
            }
            ro_offset = offset;
        }

        ctx.with_validator(enforcement, |validator| {
            flash_and_validate(
                ctx.programmer.as_ref(),
                &device,
                validator,
                &args.image_path,
                ro_offset,
                || ctx.check_other_flasher(),
            )
        })
    }
}

/// Validate the live device contents
pub struct ValidateDeviceStep(Rc<StepContext>);

impl Step for ValidateDeviceStep {
    fn name(&self) -> &'static str {
        VALIDATE_DEVICE
    }

    fn run(&self, args: &StepArgs) -> StepOutcome {
        let ctx = &self.0;
        let checked = ctx.devices.get_flash_device(&args.device_id).and_then(|device| {
            let enforcement = ctx.detector().get_vboot_enforcement()?;
            Ok((device, enforcement))
        });
        let (device, enforcement) = match checked {
            Ok(checked) => checked,
            Err(e) => return StepOutcome::UnknownError(e),
        };

        // The device is already bad; rebooting would boot it
        match ctx.with_validator(enforcement, |validator| device.validate(validator)) {
            Ok(()) => StepOutcome::Success,
            Err(e) => StepOutcome::UnsafeToReboot(e),
        }
    }
}

/// Patch the image with the local bootloader, if the device needs it
pub struct VbootPatchStep(Rc<StepContext>);

impl Step for VbootPatchStep {
    fn name(&self) -> &'static str {
        VBOOT_PATCH
    }

    fn run(&self, args: &StepArgs) -> StepOutcome {
        let ctx = &self.0;
        let detector = ctx.detector();
        if !detector.is_vboot_system() {
            info!("Not a vboot system, skipping");
            return StepOutcome::Success;
        }

        // Nothing has been written to flash yet
        let patched = ctx
            .devices
            .get_flash_device(&args.device_id)
            .and_then(|device| {
                detector.vboot_patch_image_bootloader_if_needed(&args.image_path, &device)
            });
        match patched {
            Ok(_) => StepOutcome::Success,
            Err(e) => StepOutcome::SafeToReboot(e),
        }
    }
}

/// Fail if another flasher is running
pub struct CheckOtherFlasherStep(Rc<StepContext>);

impl Step for CheckOtherFlasherStep {
    fn name(&self) -> &'static str {
        CHECK_OTHER_FLASHER
    }

    fn run(&self, _args: &StepArgs) -> StepOutcome {
        match self.0.check_other_flasher() {
            Ok(()) => StepOutcome::Success,
            Err(e) => StepOutcome::UnsafeToReboot(e),
        }
    }
}

/// A step registry holding every built-in step
pub fn default_steps(ctx: Rc<StepContext>) -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry.register(Box::new(FlashDeviceStep(Rc::clone(&ctx))));
    registry.register(Box::new(ValidateDeviceStep(Rc::clone(&ctx))));
    registry.register(Box::new(VbootPatchStep(Rc::clone(&ctx))));
    registry.register(Box::new(CheckOtherFlasherStep(ctx)));
    registry
}
