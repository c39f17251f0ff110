//! Erase, program and verify an image on a raw MTD device
//!
//! A run goes through these phases, strictly in order:
//!
//! 1. Health check: device path, image size and RO offset
//! 2. Erase every erase block touched by `[ro_offset, image_size)`
//! 3. Program `image[ro_offset..]` at `ro_offset`
//! 4. Close the raw device
//! 5. Verify `[ro_offset, image_size)` through the mmapped block alias
//!
//! Reading the block alias while the raw device is still open returns
//! stale data on some controllers, so phase 4 is not optional. The
//! watchdog is petted before erase, program and verify.

use crate::device_file::{mtd_block_path, FlashDeviceFile, MtdHost};
use crate::ioctl::{MtdFlags, MtdInfoUser};
use crate::progress::{FlashProgress, FlashStats};
use crate::watchdog::Watchdog;
use flashy_core::{Error, Result, ResultExt};
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io;
use std::path::Path;

/// Largest single positioned write
///
/// Keeps any one syscall short in case of a misbehaving driver.
pub const PROGRAM_CHUNK_SIZE: usize = 1024 * 1024;

/// Raw MTD device path pattern
pub const MTD_DEVICE_PATTERN: &str = r"^/dev/mtd[0-9]+$";

static MTD_DEVICE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(MTD_DEVICE_PATTERN).expect("mtd device regex is valid"));

/// Erase-block aligned span `[start, start + length)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseRegion {
    pub start: u32,
    pub length: u32,
}

impl EraseRegion {
    pub fn end(&self) -> u64 {
        self.start as u64 + self.length as u64
    }

    /// Start offsets of each erase block in the region
    pub fn blocks(&self, erase_size: u32) -> impl Iterator<Item = u32> {
        let end = self.end();
        (self.start as u64..end)
            .step_by(erase_size.max(1) as usize)
            .map(|b| b as u32)
    }
}

/// Erase region for an image of `image_size` bytes above `ro_offset`
///
/// The start is rounded down and the end rounded up to `erase_size`.
/// Returns `None` for a zero erase size or a region past 4 GiB.
pub fn erase_region(image_size: u64, ro_offset: u64, erase_size: u32) -> Option<EraseRegion> {
    if erase_size == 0 {
        return None;
    }
    let es = erase_size as u64;
    let start = ro_offset / es * es;
    let end = image_size.checked_add(es - 1)? / es * es;
    let start = u32::try_from(start).ok()?;
    let length = u32::try_from(end.checked_sub(start as u64)?).ok()?;
    // The region must also be addressable by MEMERASE
    u32::try_from(end).ok()?;
    Some(EraseRegion { start, length })
}

/// Check that `image_size` bytes above `ro_offset` can go to `device_path`
pub fn health_check(
    device_path: &Path,
    device_size: u64,
    image_size: u64,
    ro_offset: u64,
) -> Result<()> {
    let matches = device_path
        .to_str()
        .is_some_and(|p| MTD_DEVICE_RE.is_match(p));
    if !matches {
        return Err(Error::DeviceMismatch {
            path: device_path.to_path_buf(),
            pattern: MTD_DEVICE_PATTERN,
        });
    }

    if image_size > device_size {
        return Err(Error::ImageTooLarge {
            image_size,
            device_size,
        });
    }

    if ro_offset > image_size {
        return Err(Error::OffsetExceedsImage {
            image_size,
            ro_offset,
        });
    }

    Ok(())
}

/// Query device geometry, rejecting devices that cannot be erased by block
pub fn device_info<F: FlashDeviceFile>(file: &F) -> Result<MtdInfoUser> {
    let driver_error = |source: io::Error| Error::DriverCall {
        call: "MEMGETINFO",
        path: file.path().to_path_buf(),
        source,
    };

    let info = file.info().map_err(driver_error)?;
    if info.erasesize == 0 {
        return Err(driver_error(io::Error::new(
            io::ErrorKind::InvalidData,
            "device reports an erase size of 0",
        )));
    }

    debug!(
        "{}: type={} flags={:?} size={:#x} erasesize={:#x} writesize={:#x}",
        file.path().display(),
        info.type_name(),
        info.flags(),
        info.size,
        info.erasesize,
        info.writesize
    );
    if !info.flags().contains(MtdFlags::WRITEABLE) {
        warn!("{} is not flagged as writeable", file.path().display());
    }
    Ok(info)
}

/// Erase the blocks that will be programmed
pub fn erase<F: FlashDeviceFile>(
    file: &mut F,
    info: &MtdInfoUser,
    image_size: u64,
    ro_offset: u64,
    progress: &mut dyn FlashProgress,
) -> Result<EraseRegion> {
    let region = erase_region(image_size, ro_offset, info.erasesize).ok_or_else(|| {
        Error::DriverCall {
            call: "MEMERASE",
            path: file.path().to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "erase region for {}B image overflows with erase size {:#x}",
                    image_size, info.erasesize
                ),
            ),
        }
    })?;

    let block_count = region.blocks(info.erasesize).count();
    info!(
        "Erasing flash device '{}' from {:#x} to {:#x} ({} blocks)",
        file.path().display(),
        region.start,
        region.end(),
        block_count
    );
    progress.erasing(block_count, region.length as u64);

    for (i, block) in region.blocks(info.erasesize).enumerate() {
        file.erase(block, info.erasesize)
            .map_err(|source| Error::EraseFailure {
                path: file.path().to_path_buf(),
                offset: block,
                source,
            })?;
        progress.erase_progress(i + 1);
    }

    Ok(region)
}

/// Program `image[ro_offset..]` at `ro_offset`, returning the bytes written
pub fn program<F: FlashDeviceFile>(
    file: &mut F,
    image: &[u8],
    ro_offset: u64,
    progress: &mut dyn FlashProgress,
) -> Result<u64> {
    let start = usize::try_from(ro_offset).unwrap_or(usize::MAX);
    let data = image.get(start..).ok_or(Error::OffsetExceedsImage {
        image_size: image.len() as u64,
        ro_offset,
    })?;

    info!(
        "Programming {}B on to flash device '{}' at {:#x}",
        data.len(),
        file.path().display(),
        ro_offset
    );
    progress.writing(data.len() as u64);

    let mut written = 0u64;
    for chunk in data.chunks(PROGRAM_CHUNK_SIZE) {
        let offset = ro_offset + written;
        let n = file
            .write_at(chunk, offset)
            .map_err(|source| Error::ProgramFailure {
                path: file.path().to_path_buf(),
                offset,
                source,
            })?;
        if n != chunk.len() {
            return Err(Error::ProgramFailure {
                path: file.path().to_path_buf(),
                offset,
                source: io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write: {}B of {}B", n, chunk.len()),
                ),
            });
        }
        written += n as u64;
        progress.write_progress(written);
    }

    Ok(written)
}

/// Compare `image` and `flash` above `ro_offset`
///
/// Bytes below the offset belong to the RO region and are not compared. A
/// mismatch reports the absolute offset of the first differing byte.
pub fn verify(image: &[u8], flash: &[u8], ro_offset: u64) -> Result<()> {
    let start = usize::try_from(ro_offset).unwrap_or(usize::MAX);
    let (Some(image_tail), Some(flash_tail)) = (image.get(start..), flash.get(start..)) else {
        return Err(Error::OffsetExceedsImage {
            image_size: image.len().min(flash.len()) as u64,
            ro_offset,
        });
    };

    if image_tail == flash_tail {
        return Ok(());
    }

    let first = image_tail
        .iter()
        .zip(flash_tail)
        .position(|(a, b)| a != b)
        .unwrap_or_else(|| image_tail.len().min(flash_tail.len()));
    let err = Error::VerifyMismatch {
        offset: ro_offset + first as u64,
        ro_offset,
    };
    error!("{}", err);
    Err(err)
}

/// Copies an image on to an MTD device
pub struct FlashCp<'a, H: MtdHost> {
    host: &'a H,
    watchdog: &'a dyn Watchdog,
}

impl<'a, H: MtdHost> FlashCp<'a, H> {
    pub fn new(host: &'a H, watchdog: &'a dyn Watchdog) -> Self {
        Self { host, watchdog }
    }

    /// Erase, program and verify `image_path` on `device_path`
    ///
    /// The first `ro_offset` bytes of the device are never programmed or
    /// compared. Nothing is retried; every failure is returned as is.
    pub fn flash_cp(
        &self,
        image_path: &Path,
        device_path: &Path,
        ro_offset: u32,
        progress: &mut dyn FlashProgress,
    ) -> Result<FlashStats> {
        let ro_offset = ro_offset as u64;
        let image = self
            .host
            .map_read_only(image_path, None)
            .with_context(|| format!("Unable to map image file '{}'", image_path.display()))?;
        let image_size = image.len() as u64;

        info!(
            "Flashing '{}' ({}B) on to '{}' with RO offset {:#x}",
            image_path.display(),
            image_size,
            device_path.display(),
            ro_offset
        );

        let mut stats = FlashStats::default();
        {
            let mut file = self.host.open_device(device_path).with_context(|| {
                format!("Unable to open flash device '{}'", device_path.display())
            })?;
            let info = device_info(&file)?;
            health_check(device_path, info.size as u64, image_size, ro_offset)
                .context("Flash device health check failed")?;

            self.watchdog.pet();
            let region = erase(&mut file, &info, image_size, ro_offset, progress)?;
            stats.blocks_erased = region.blocks(info.erasesize).count();
            stats.bytes_erased = region.length as u64;

            self.watchdog.pet();
            stats.bytes_written = program(&mut file, &image, ro_offset, progress)?;

            file.close()?;
        }

        self.watchdog.pet();
        let block_path = mtd_block_path(device_path)?;
        info!(
            "Verifying '{}' against '{}'",
            block_path.display(),
            image_path.display()
        );
        progress.verifying(image_size - ro_offset);
        let flash = self
            .host
            .map_read_only(&block_path, Some(image.len()))
            .with_context(|| format!("Unable to map flash device '{}'", block_path.display()))?;
        verify(&image, &flash, ro_offset)?;
        stats.bytes_verified = image_size - ro_offset;

        info!("Finished flashing '{}'", device_path.display());
        progress.complete(&stats);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ChipHandle, MemoryChip, MemoryMtdHost};
    use crate::progress::NoProgress;
    use crate::watchdog::Watchdog;
    use flashy_core::ErrorKind;
    use std::cell::Cell;
    use std::path::PathBuf;

    #[derive(Default)]
    struct CountingWatchdog(Cell<usize>);

    impl Watchdog for CountingWatchdog {
        fn pet(&self) {
            self.0.set(self.0.get() + 1);
        }
    }

    const IMAGE: &str = "/images/flash.bin";

    fn setup(image: &[u8], chip: MemoryChip) -> (MemoryMtdHost, ChipHandle) {
        let mut host = MemoryMtdHost::new();
        let handle = host.add_chip(Path::new("/dev"), 5, chip);
        host.add_file(IMAGE, image);
        (host, handle)
    }

    fn run(host: &MemoryMtdHost, ro_offset: u32) -> Result<FlashStats> {
        FlashCp::new(host, &crate::watchdog::NoWatchdog).flash_cp(
            Path::new(IMAGE),
            Path::new("/dev/mtd5"),
            ro_offset,
            &mut NoProgress,
        )
    }

    #[test]
    fn test_erase_region_example() {
        assert_eq!(
            erase_region(6, 2, 4),
            Some(EraseRegion {
                start: 0,
                length: 8
            })
        );
    }

    #[test]
    fn test_erase_region_alignment() {
        for erase_size in [1u32, 3, 4, 0x1000, 0x10000] {
            for image_size in [0u64, 1, 5, 0x1000, 0x12345] {
                for ro_offset in [0u64, 1, 4, 0x800, image_size] {
                    if ro_offset > image_size {
                        continue;
                    }
                    let r = erase_region(image_size, ro_offset, erase_size).unwrap();
                    assert_eq!(r.start % erase_size, 0);
                    assert_eq!(r.end() % erase_size as u64, 0);
                    assert!(r.start as u64 <= ro_offset);
                    assert!(r.end() >= image_size);
                }
            }
        }
    }

    #[test]
    fn test_erase_region_invalid() {
        assert_eq!(erase_region(6, 0, 0), None);
        assert_eq!(erase_region(u64::MAX, 0, 0x10000), None);
        assert_eq!(erase_region(0x1_0000_0001, 0, 0x10000), None);
    }

    #[test]
    fn test_health_check() {
        let dev = Path::new("/dev/mtd5");
        health_check(dev, 8, 6, 2).unwrap();
        health_check(dev, 6, 6, 6).unwrap();

        let err = health_check(Path::new("/dev/mtdblock5"), 8, 6, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceMismatch);

        let err = health_check(dev, 1, 6, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImageTooLarge);
        assert_eq!(
            err.to_string(),
            "Image size (6B) larger than flash device size (1B)"
        );

        let err = health_check(dev, 8, 6, 7).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OffsetExceedsImage);
    }

    #[test]
    fn test_verify_mismatch_offset() {
        let err = verify(b"foobar", b"foobrr", 0).unwrap_err();
        assert!(matches!(err, Error::VerifyMismatch { offset: 4, .. }));
        assert!(err.to_string().contains("0x4"));

        // Differences below the RO offset are ignored
        verify(b"foobar", b"xxobar", 2).unwrap();
        let err = verify(b"foobar", b"xxobrr", 2).unwrap_err();
        assert!(matches!(
            err,
            Error::VerifyMismatch {
                offset: 4,
                ro_offset: 2
            }
        ));
    }

    #[test]
    fn test_flash_cp_round_trip() {
        let image = b"hello flash!";
        let (host, chip) = setup(image, MemoryChip::new(16, 4));

        let stats = run(&host, 0).unwrap();
        assert_eq!(&chip.borrow().data[..12], image);
        assert_eq!(&chip.borrow().data[12..], &[0xFF; 4]);
        assert_eq!(stats.blocks_erased, 3);
        assert_eq!(stats.bytes_written, 12);
        assert_eq!(stats.bytes_verified, 12);
        assert!(!chip.borrow().open);
    }

    #[test]
    fn test_flash_cp_is_idempotent() {
        let image = b"\x13\x00\x00\xEAfirmware";
        let (host, chip) = setup(image, MemoryChip::with_data(&[0x5A; 16], 4));

        run(&host, 0).unwrap();
        let first = chip.borrow().data.clone();
        run(&host, 0).unwrap();
        assert_eq!(chip.borrow().data, first);
    }

    #[test]
    fn test_flash_cp_never_programs_ro_region() {
        let image = b"NEWBOOTnewimage!";
        let original = b"OLDBOOToldimage!";
        let (host, chip) = setup(image, MemoryChip::with_data(original, 8));

        run(&host, 7).unwrap();
        let data = chip.borrow().data.clone();
        assert_eq!(&data[7..], &image[7..]);

        // Block 0 is erased because the RO offset lies inside it, but none
        // of the image's RO bytes are written there
        assert_eq!(&data[..7], &[0xFF; 7]);
        assert_eq!(chip.borrow().erases[0].start, 0);
        assert_eq!(chip.borrow().erases.len(), 2);
    }

    #[test]
    fn test_ro_offset_equal_to_image_size_writes_nothing() {
        let (host, chip) = setup(b"abcd", MemoryChip::new(8, 4));
        let stats = run(&host, 4).unwrap();
        assert_eq!(stats.bytes_written, 0);
        assert_eq!(stats.bytes_verified, 0);
        assert!(chip.borrow().erases.is_empty());
        assert_eq!(&chip.borrow().data[..4], &[0xFF; 4]);
    }

    #[test]
    fn test_image_too_large() {
        let (host, chip) = setup(b"foobar", MemoryChip::new(1, 1));
        let err = run(&host, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImageTooLarge);
        // Nothing was erased and the device was released
        assert!(chip.borrow().erases.is_empty());
        assert!(!chip.borrow().open);
    }

    #[test]
    fn test_zero_erase_size() {
        let (host, _chip) = setup(b"foobar", MemoryChip::new(8, 0));
        let err = run(&host, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DriverCallFailure);
    }

    #[test]
    fn test_info_failure() {
        let mut chip = MemoryChip::new(8, 4);
        chip.fail_info = true;
        let (host, _chip) = setup(b"foobar", chip);
        let err = run(&host, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DriverCallFailure);
        assert!(err.to_string().contains("MEMGETINFO"));
    }

    #[test]
    fn test_erase_failure_reports_block() {
        let mut chip = MemoryChip::new(16, 4);
        chip.fail_erase_at = Some(8);
        let (host, _chip) = setup(&[0u8; 12], chip);
        let err = run(&host, 0).unwrap_err();
        assert!(matches!(err, Error::EraseFailure { offset: 8, .. }));
    }

    #[test]
    fn test_short_write_is_program_failure() {
        let mut chip = MemoryChip::new(16, 4);
        chip.max_write = Some(3);
        let (host, _chip) = setup(b"foobar", chip);
        let err = run(&host, 2).unwrap_err();
        assert!(matches!(err, Error::ProgramFailure { offset: 2, .. }));
        assert!(err.to_string().contains("short write: 3B of 4B"));
    }

    #[test]
    fn test_bad_cell_is_verify_mismatch() {
        let mut chip = MemoryChip::new(8, 4);
        chip.stuck_byte = Some(5);
        let (host, _chip) = setup(b"foobar", chip);
        let err = run(&host, 0).unwrap_err();
        assert!(matches!(err, Error::VerifyMismatch { offset: 5, .. }));
    }

    #[test]
    fn test_raw_device_path_is_checked() {
        let mut host = MemoryMtdHost::new();
        host.add_chip(Path::new("/tmp/dev"), 5, MemoryChip::new(8, 4));
        host.add_file(IMAGE, b"foobar");
        let err = FlashCp::new(&host, &crate::watchdog::NoWatchdog)
            .flash_cp(
                Path::new(IMAGE),
                &PathBuf::from("/tmp/dev/mtd5"),
                0,
                &mut NoProgress,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceMismatch);
    }

    #[test]
    fn test_watchdog_petted_before_each_phase() {
        let (host, _chip) = setup(b"foobar", MemoryChip::new(8, 4));
        let watchdog = CountingWatchdog::default();
        FlashCp::new(&host, &watchdog)
            .flash_cp(
                Path::new(IMAGE),
                Path::new("/dev/mtd5"),
                0,
                &mut NoProgress,
            )
            .unwrap();
        assert_eq!(watchdog.0.get(), 3);
    }
}
