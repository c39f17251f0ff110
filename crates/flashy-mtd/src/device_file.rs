//! MTD device files and the host that opens them
//!
//! The engine never opens files itself. It goes through an [`MtdHost`], which
//! hands out locked [`FlashDeviceFile`]s for the raw character device and
//! read-only [`Mapping`]s for images and the block alias.

use crate::ioctl::{memerase, memgetinfo, EraseInfoUser, MtdInfoUser};
use crate::mmap::{MappedFile, Mapping};
use flashy_core::{Error, Result};
use log::debug;
use nix::fcntl::{Flock, FlockArg};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Raw MTD device file name pattern
pub const MTD_FILE_NAME_PATTERN: &str = r"^mtd([0-9]+)$";

static MTD_FILE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(MTD_FILE_NAME_PATTERN).expect("mtd file name regex is valid"));

/// An open raw flash device
pub trait FlashDeviceFile {
    /// Path the device was opened from
    fn path(&self) -> &Path;

    /// Query device geometry (MEMGETINFO)
    fn info(&self) -> io::Result<MtdInfoUser>;

    /// Erase `length` bytes at `start` (MEMERASE)
    fn erase(&mut self, start: u32, length: u32) -> io::Result<()>;

    /// Positioned write, independent of the file offset
    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Release the lock and close the descriptor
    fn close(self) -> Result<()>;
}

/// Opens device files and maps files for the engine
pub trait MtdHost {
    type File: FlashDeviceFile;

    /// Open the raw device read-write under an exclusive lock
    fn open_device(&self, path: &Path) -> Result<Self::File>;

    /// Map `path` read-only; `len` limits the mapping, `None` maps it whole
    fn map_read_only(&self, path: &Path, len: Option<usize>) -> Result<Mapping>;
}

/// Block device alias of a raw MTD device: `/dev/mtd5` → `/dev/mtdblock5`
///
/// The raw character device cannot be mmapped; the block alias can.
pub fn mtd_block_path(path: &Path) -> Result<PathBuf> {
    let mismatch = || Error::DeviceMismatch {
        path: path.to_path_buf(),
        pattern: MTD_FILE_NAME_PATTERN,
    };

    let name = path.file_name().and_then(|n| n.to_str()).ok_or_else(mismatch)?;
    let caps = MTD_FILE_NAME_RE.captures(name).ok_or_else(mismatch)?;
    Ok(path.with_file_name(format!("mtdblock{}", &caps[1])))
}

/// A raw `/dev/mtdN` character device
pub struct MtdCharDevice {
    path: PathBuf,
    file: Flock<File>,
}

impl FlashDeviceFile for MtdCharDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    fn info(&self) -> io::Result<MtdInfoUser> {
        let mut info = MtdInfoUser::default();
        // SAFETY: valid descriptor and a properly sized, writable MtdInfoUser
        unsafe { memgetinfo(self.file.as_raw_fd(), &mut info) }?;
        Ok(info)
    }

    fn erase(&mut self, start: u32, length: u32) -> io::Result<()> {
        let erase_info = EraseInfoUser { start, length };
        // SAFETY: valid descriptor and a properly initialized EraseInfoUser
        unsafe { memerase(self.file.as_raw_fd(), &erase_info) }?;
        Ok(())
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        FileExt::write_at(&*self.file, buf, offset)
    }

    fn close(self) -> Result<()> {
        let path = self.path;
        let file = self
            .file
            .unlock()
            .map_err(|(_, errno)| Error::io(&path, errno.into()).context("Unable to unlock"))?;
        drop(file);
        debug!("Closed {}", path.display());
        Ok(())
    }
}

/// Production host backed by the real filesystem and kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxMtdHost;

impl MtdHost for LinuxMtdHost {
    type File = MtdCharDevice;

    fn open_device(&self, path: &Path) -> Result<MtdCharDevice> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|e| Error::io(path, e))?;

        let file = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            Error::io(path, errno.into()).context("Unable to lock flash device")
        })?;

        debug!("Opened {} with exclusive lock", path.display());
        Ok(MtdCharDevice {
            path: path.to_path_buf(),
            file,
        })
    }

    fn map_read_only(&self, path: &Path, len: Option<usize>) -> Result<Mapping> {
        let mapping = match len {
            Some(len) => MappedFile::open_range(path, len)?,
            None => MappedFile::open(path)?,
        };
        Ok(Mapping::File(mapping))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flashy_core::ErrorKind;
    use std::io::Write;

    #[test]
    fn test_block_path() {
        assert_eq!(
            mtd_block_path(Path::new("/dev/mtd5")).unwrap(),
            PathBuf::from("/dev/mtdblock5")
        );
        assert_eq!(
            mtd_block_path(Path::new("/tmp/x/mtd12")).unwrap(),
            PathBuf::from("/tmp/x/mtdblock12")
        );
    }

    #[test]
    fn test_block_path_mismatch() {
        for path in ["/dev/mtdblock5", "/dev/mmcblk0", "/dev/mtd", "/"] {
            let err = mtd_block_path(Path::new(path)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DeviceMismatch, "path {}", path);
        }
    }

    #[test]
    fn test_linux_host_maps_regular_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abcdef").unwrap();
        file.flush().unwrap();

        let mapping = LinuxMtdHost.map_read_only(file.path(), Some(4)).unwrap();
        assert_eq!(&*mapping, b"abcd");
        let mapping = LinuxMtdHost.map_read_only(file.path(), None).unwrap();
        assert_eq!(&*mapping, b"abcdef");
    }

    #[test]
    fn test_linux_host_lock_is_exclusive() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let first = LinuxMtdHost.open_device(file.path()).unwrap();
        let err = match LinuxMtdHost.open_device(file.path()) {
            Ok(_) => panic!("second open must not get the lock"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::Io);
        first.close().unwrap();
        LinuxMtdHost.open_device(file.path()).unwrap().close().unwrap();
    }
}
