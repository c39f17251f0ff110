//! Verified boot detection and image patching
//!
//! On hardware-enforced vboot systems the first `vboot_offset` bytes of the
//! writable flash hold the RO bootloader. flashy leaves that region alone and
//! patches the image so its head matches what is already on the flash.

use crate::device::FlashDevice;
use crate::process::CommandRunner;
use flashy_core::tables::{has_entry_name_containing, read_mtd_table};
use flashy_core::{Config, Error, Result, ResultExt, VbootEnforcement};
use log::{debug, info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::Path;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// Whether `path` starts with the ELF magic
fn is_elf(path: &Path) -> Result<bool> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == ELF_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Whether an image for `specifier` must keep the live RO bootloader
pub fn patching_required(config: &Config, enforcement: VbootEnforcement, specifier: &str) -> bool {
    enforcement == VbootEnforcement::HardwareEnforce && specifier == config.vboot_specifier
}

/// Copy the first `offset` bytes of `device` over the head of the image
///
/// The rest of the image file is left as is. The image must be at least
/// `offset` bytes long; otherwise nothing is written.
pub fn patch_image_with_local_bootloader(
    image_path: &Path,
    device: &dyn FlashDevice,
    offset: u32,
) -> Result<()> {
    warn!("===== WARNING: PATCHING IMAGE FILE =====");
    warn!(
        "This vboot system has {}B RO offset in mtd, patching image file with offset.",
        offset
    );

    let image_size = fs::metadata(image_path)
        .map_err(|e| Error::io(image_path, e))?
        .len();
    if offset as u64 > image_size {
        return Err(Error::OffsetExceedsImage {
            image_size,
            ro_offset: offset as u64,
        });
    }

    let flash = device.map_read_only()?;
    let Some(bootloader) = flash.get(..offset as usize) else {
        let len = flash.len();
        device.unmap(flash);
        return Err(Error::io(
            device.file_path(),
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("device ({}B) smaller than RO offset ({}B)", len, offset),
            ),
        ));
    };

    let result = OpenOptions::new()
        .write(true)
        .open(image_path)
        .and_then(|file| {
            file.write_all_at(bootloader, 0)?;
            file.sync_all()
        })
        .map_err(|e| Error::io(image_path, e));
    device.unmap(flash);
    result?;

    info!("Successfully patched image file");
    Ok(())
}

/// Detects vboot enforcement on the running system
pub struct VbootDetector<'a> {
    config: &'a Config,
    runner: &'a dyn CommandRunner,
}

impl<'a> VbootDetector<'a> {
    pub fn new(config: &'a Config, runner: &'a dyn CommandRunner) -> Self {
        Self { config, runner }
    }

    /// A vboot system ships the vboot utility
    pub fn is_vboot_system(&self) -> bool {
        self.config.vboot_util.exists()
    }

    /// Output of the vboot utility
    ///
    /// Its cached results are removed first so the report is current.
    pub fn get_vboot_util_contents(&self) -> Result<String> {
        for cache in &self.config.vboot_cache_files {
            // The cache may legitimately not exist
            if let Err(e) = fs::remove_file(cache) {
                debug!("Not removing {}: {}", cache.display(), e);
            }
        }

        let util = self.config.vboot_util.to_string_lossy().into_owned();
        let argv = if is_elf(&self.config.vboot_util)? {
            vec![util]
        } else {
            vec!["bash".to_string(), util]
        };
        let command = argv.join(" ");

        let output = self
            .runner
            .run_command(&argv, self.config.command_timeout())
            .and_then(|o| o.check(&command))
            .context("Unable to get vboot-util info")?;
        Ok(output.stdout)
    }

    /// Enforcement level of the running system
    pub fn get_vboot_enforcement(&self) -> Result<VbootEnforcement> {
        if !self.is_vboot_system() {
            return Ok(VbootEnforcement::None);
        }

        let table = read_mtd_table(&self.config.proc_mtd)?;
        if !has_entry_name_containing(&table, &self.config.vboot_marker) {
            return Ok(VbootEnforcement::None);
        }

        let contents = self.get_vboot_util_contents()?;
        let enforcement = VbootEnforcement::from_vboot_util_output(&contents);
        info!("Vboot enforcement: {}", enforcement);
        Ok(enforcement)
    }

    /// Whether an image for `specifier` must be patched before flashing
    pub fn is_vboot_image_patching_required(&self, specifier: &str) -> Result<bool> {
        let enforcement = self.get_vboot_enforcement()?;
        Ok(patching_required(self.config, enforcement, specifier))
    }

    /// Patch the image if the target device needs it
    ///
    /// Returns whether the image was patched.
    pub fn vboot_patch_image_bootloader_if_needed(
        &self,
        image_path: &Path,
        device: &dyn FlashDevice,
    ) -> Result<bool> {
        if !self.is_vboot_system() {
            return Err(Error::NotVbootSystem.context("Cannot run vboot remediation"));
        }

        let required = self
            .is_vboot_image_patching_required(device.specifier())
            .context("Unable to determine whether image patching is required")?;
        if !required {
            info!("No image patching required for '{}'", device.id());
            return Ok(false);
        }

        patch_image_with_local_bootloader(image_path, device, self.config.vboot_offset)
            .context("Failed to patch image with local bootloader")?;
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mtd::MtdDevice;
    use crate::process::CommandOutput;
    use flashy_core::ErrorKind;
    use std::cell::RefCell;
    use std::path::PathBuf;

    pub(crate) const TIOGAPASS1_PROC_MTD: &str = r#"dev:    size   erasesize  name
mtd0: 00060000 00010000 "romx"
mtd1: 00020000 00010000 "env"
mtd2: 00400000 00010000 "fit"
mtd3: 01780000 00010000 "data0"
mtd4: 02000000 00010000 "flash0"
mtd5: 00000010 00000004 "flash1"
mtd12: 02000000 00010000 "flash0""#;

    pub(crate) const HARDWARE_ENFORCED: &str = "Flags hardware_enforce:  0x01\nFlags software_enforce:  0x01\n";
    pub(crate) const SOFTWARE_ENFORCED: &str = "Flags hardware_enforce:  0x00\nFlags software_enforce:  0x01\n";

    /// Replies with a fixed vboot-util output and records every command
    pub(crate) struct FakeRunner {
        pub output: String,
        pub calls: RefCell<Vec<Vec<String>>>,
    }

    impl FakeRunner {
        pub fn new(output: &str) -> Self {
            Self {
                output: output.to_string(),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl CommandRunner for FakeRunner {
        fn run_command(&self, argv: &[String], _timeout: std::time::Duration) -> Result<CommandOutput> {
            self.calls.borrow_mut().push(argv.to_vec());
            Ok(CommandOutput {
                stdout: self.output.clone(),
                ..Default::default()
            })
        }
    }

    /// A tempdir laid out like a vboot BMC: vboot-util, /proc/mtd and
    /// `mtdblock5` holding the bootloader
    pub(crate) fn vboot_root(dir: &Path, util: Option<&[u8]>, proc_mtd: &str) -> Config {
        let config = Config {
            proc_mtd: dir.join("mtd"),
            dev_root: dir.to_path_buf(),
            vboot_util: dir.join("vboot-util"),
            vboot_cache_files: vec![dir.join("rom_version"), dir.join("rom_uboot_version")],
            vboot_offset: 4,
            ..Config::default()
        };
        fs::write(&config.proc_mtd, proc_mtd).unwrap();
        if let Some(util) = util {
            fs::write(&config.vboot_util, util).unwrap();
        }
        fs::write(dir.join("mtdblock5"), b"BOOTflash1-image").unwrap();
        config
    }

    #[test]
    fn test_not_vboot_without_utility() {
        let dir = tempfile::tempdir().unwrap();
        let config = vboot_root(dir.path(), None, TIOGAPASS1_PROC_MTD);
        let runner = FakeRunner::new(HARDWARE_ENFORCED);
        let detector = VbootDetector::new(&config, &runner);

        assert!(!detector.is_vboot_system());
        assert_eq!(detector.get_vboot_enforcement().unwrap(), VbootEnforcement::None);
        assert!(runner.calls.borrow().is_empty());
    }

    #[test]
    fn test_not_vboot_without_marker() {
        let dir = tempfile::tempdir().unwrap();
        let config = vboot_root(dir.path(), Some(b"#!/bin/sh\n"), "mtd5: 02000000 00010000 \"flash0\"\n");
        let runner = FakeRunner::new(HARDWARE_ENFORCED);
        let detector = VbootDetector::new(&config, &runner);
        assert_eq!(detector.get_vboot_enforcement().unwrap(), VbootEnforcement::None);
    }

    #[test]
    fn test_enforcement_from_utility() {
        let dir = tempfile::tempdir().unwrap();
        let config = vboot_root(dir.path(), Some(b"#!/bin/sh\n"), TIOGAPASS1_PROC_MTD);
        fs::write(dir.path().join("rom_version"), b"stale").unwrap();

        let runner = FakeRunner::new(HARDWARE_ENFORCED);
        let detector = VbootDetector::new(&config, &runner);
        assert_eq!(
            detector.get_vboot_enforcement().unwrap(),
            VbootEnforcement::HardwareEnforce
        );
        // Not an ELF, so it goes through bash; the cache was cleared
        assert_eq!(runner.calls.borrow()[0][0], "bash");
        assert!(!dir.path().join("rom_version").exists());

        let runner = FakeRunner::new(SOFTWARE_ENFORCED);
        let detector = VbootDetector::new(&config, &runner);
        assert_eq!(
            detector.get_vboot_enforcement().unwrap(),
            VbootEnforcement::SoftwareEnforce
        );
    }

    #[test]
    fn test_elf_utility_runs_directly() {
        let dir = tempfile::tempdir().unwrap();
        let config = vboot_root(dir.path(), Some(b"\x7fELF\x02\x01\x01"), TIOGAPASS1_PROC_MTD);
        let runner = FakeRunner::new(SOFTWARE_ENFORCED);
        VbootDetector::new(&config, &runner)
            .get_vboot_util_contents()
            .unwrap();
        assert_eq!(
            runner.calls.borrow()[0],
            vec![config.vboot_util.to_string_lossy().into_owned()]
        );
    }

    #[test]
    fn test_patching_required_only_for_hardware_on_vboot_specifier() {
        let config = Config::default();
        assert!(patching_required(&config, VbootEnforcement::HardwareEnforce, "flash1"));
        assert!(!patching_required(&config, VbootEnforcement::HardwareEnforce, "flash0"));
        assert!(!patching_required(&config, VbootEnforcement::SoftwareEnforce, "flash1"));
        assert!(!patching_required(&config, VbootEnforcement::None, "flash1"));
    }

    #[test]
    fn test_patch_image() {
        let dir = tempfile::tempdir().unwrap();
        vboot_root(dir.path(), None, TIOGAPASS1_PROC_MTD);
        let image = dir.path().join("image.bin");
        fs::write(&image, b"XXXXnew-image-data").unwrap();

        let device = MtdDevice::new("flash1", dir.path().join("mtd5"), 16);
        patch_image_with_local_bootloader(&image, &device, 4).unwrap();
        assert_eq!(fs::read(&image).unwrap(), b"BOOTnew-image-data");
    }

    #[test]
    fn test_patch_offset_larger_than_image() {
        let dir = tempfile::tempdir().unwrap();
        vboot_root(dir.path(), None, TIOGAPASS1_PROC_MTD);
        let image = dir.path().join("image.bin");
        fs::write(&image, b"abcd").unwrap();

        let device = MtdDevice::new("flash1", dir.path().join("mtd5"), 16);
        let err = patch_image_with_local_bootloader(&image, &device, 12).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OffsetExceedsImage);
        assert_eq!(err.to_string(), "RO offset (12B) larger than image size (4B)");
        assert_eq!(fs::read(&image).unwrap(), b"abcd");
    }

    #[test]
    fn test_patch_if_needed() {
        let dir = tempfile::tempdir().unwrap();
        let config = vboot_root(dir.path(), Some(b"#!/bin/sh\n"), TIOGAPASS1_PROC_MTD);
        let image = dir.path().join("image.bin");
        fs::write(&image, b"XXXXnew-image-data").unwrap();
        let flash1 = MtdDevice::new("flash1", dir.path().join("mtd5"), 16);
        let flash0 = MtdDevice::new("flash0", PathBuf::from("/dev/mtd4"), 16);

        let runner = FakeRunner::new(HARDWARE_ENFORCED);
        let detector = VbootDetector::new(&config, &runner);
        assert!(!detector.vboot_patch_image_bootloader_if_needed(&image, &flash0).unwrap());
        assert_eq!(fs::read(&image).unwrap(), b"XXXXnew-image-data");

        assert!(detector.vboot_patch_image_bootloader_if_needed(&image, &flash1).unwrap());
        assert_eq!(fs::read(&image).unwrap(), b"BOOTnew-image-data");
    }

    #[test]
    fn test_patch_if_needed_on_non_vboot_system() {
        let dir = tempfile::tempdir().unwrap();
        let config = vboot_root(dir.path(), None, TIOGAPASS1_PROC_MTD);
        let runner = FakeRunner::new(HARDWARE_ENFORCED);
        let device = MtdDevice::new("flash1", dir.path().join("mtd5"), 16);

        let err = VbootDetector::new(&config, &runner)
            .vboot_patch_image_bootloader_if_needed(&dir.path().join("image.bin"), &device)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotVbootSystem);
    }
}
