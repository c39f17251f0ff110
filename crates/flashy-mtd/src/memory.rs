//! In-memory MTD host
//!
//! Emulates NOR flash: erase sets bytes to 0xFF and programming can only
//! clear bits. The block alias `mtdblockN` reads the same storage as
//! `mtdN`, but refuses to be mapped while the raw device is open.

use crate::device_file::{FlashDeviceFile, MtdHost};
use crate::ioctl::{mtd_type, EraseInfoUser, MtdFlags, MtdInfoUser};
use crate::mmap::Mapping;
use flashy_core::{Error, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Backing store and fault injection for one emulated chip
#[derive(Debug, Clone)]
pub struct MemoryChip {
    pub data: Vec<u8>,
    pub erase_size: u32,
    pub flags: MtdFlags,
    /// Raw device currently open
    pub open: bool,
    /// Every MEMERASE call, in order
    pub erases: Vec<EraseInfoUser>,
    /// Fail MEMGETINFO
    pub fail_info: bool,
    /// Fail the erase of the block starting at this offset
    pub fail_erase_at: Option<u32>,
    /// Accept at most this many bytes per write
    pub max_write: Option<usize>,
    /// Flip this byte after every write, emulating a bad cell
    pub stuck_byte: Option<usize>,
}

impl MemoryChip {
    /// An erased chip
    pub fn new(size: usize, erase_size: u32) -> Self {
        Self {
            data: vec![0xFF; size],
            erase_size,
            flags: MtdFlags::WRITEABLE,
            open: false,
            erases: Vec::new(),
            fail_info: false,
            fail_erase_at: None,
            max_write: None,
            stuck_byte: None,
        }
    }

    /// A chip holding `data`
    pub fn with_data(data: &[u8], erase_size: u32) -> Self {
        let mut chip = Self::new(data.len(), erase_size);
        chip.data.copy_from_slice(data);
        chip
    }
}

/// Shared handle to an emulated chip
pub type ChipHandle = Rc<RefCell<MemoryChip>>;

/// Raw device file handed out by [`MemoryMtdHost`]
pub struct MemoryMtd {
    path: PathBuf,
    chip: ChipHandle,
}

impl FlashDeviceFile for MemoryMtd {
    fn path(&self) -> &Path {
        &self.path
    }

    fn info(&self) -> io::Result<MtdInfoUser> {
        let chip = self.chip.borrow();
        if chip.fail_info {
            return Err(io::Error::from_raw_os_error(libc::ENOTTY));
        }
        Ok(MtdInfoUser {
            mtd_type: mtd_type::NOR_FLASH,
            flags: chip.flags.bits(),
            size: chip.data.len() as u32,
            erasesize: chip.erase_size,
            writesize: 1,
            oobsize: 0,
            padding: 0,
        })
    }

    fn erase(&mut self, start: u32, length: u32) -> io::Result<()> {
        let mut chip = self.chip.borrow_mut();
        chip.erases.push(EraseInfoUser { start, length });
        if chip.fail_erase_at == Some(start) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        let end = start as usize + length as usize;
        if end > chip.data.len() || chip.erase_size == 0 || start % chip.erase_size != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        chip.data[start as usize..end].fill(0xFF);
        Ok(())
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut chip = self.chip.borrow_mut();
        let start = offset as usize;
        if start > chip.data.len() {
            return Err(io::Error::from_raw_os_error(libc::ENOSPC));
        }
        let room = chip.data.len() - start;
        let n = buf.len().min(room).min(chip.max_write.unwrap_or(usize::MAX));
        for (dst, src) in chip.data[start..start + n].iter_mut().zip(buf) {
            *dst &= *src;
        }
        if let Some(i) = chip.stuck_byte {
            if let Some(b) = chip.data.get_mut(i) {
                *b ^= 0x01;
            }
        }
        Ok(n)
    }

    fn close(self) -> Result<()> {
        drop(self);
        Ok(())
    }
}

impl Drop for MemoryMtd {
    fn drop(&mut self) {
        self.chip.borrow_mut().open = false;
    }
}

/// In-memory [`MtdHost`]
#[derive(Default)]
pub struct MemoryMtdHost {
    devices: HashMap<PathBuf, ChipHandle>,
    blocks: HashMap<PathBuf, ChipHandle>,
    files: HashMap<PathBuf, Vec<u8>>,
}

impl MemoryMtdHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `chip` as `<dir>/mtd<index>` and `<dir>/mtdblock<index>`
    pub fn add_chip(&mut self, dir: &Path, index: u32, chip: MemoryChip) -> ChipHandle {
        let handle = Rc::new(RefCell::new(chip));
        self.devices
            .insert(dir.join(format!("mtd{}", index)), Rc::clone(&handle));
        self.blocks
            .insert(dir.join(format!("mtdblock{}", index)), Rc::clone(&handle));
        handle
    }

    /// Register a plain file, e.g. an image
    pub fn add_file(&mut self, path: impl Into<PathBuf>, data: &[u8]) {
        self.files.insert(path.into(), data.to_vec());
    }
}

fn not_found(path: &Path) -> Error {
    Error::io(path, io::Error::from(io::ErrorKind::NotFound))
}

impl MtdHost for MemoryMtdHost {
    type File = MemoryMtd;

    fn open_device(&self, path: &Path) -> Result<MemoryMtd> {
        let chip = self.devices.get(path).ok_or_else(|| not_found(path))?;
        {
            let mut c = chip.borrow_mut();
            if c.open {
                return Err(Error::io(path, io::Error::from_raw_os_error(libc::EWOULDBLOCK))
                    .context("Unable to lock flash device"));
            }
            c.open = true;
        }
        Ok(MemoryMtd {
            path: path.to_path_buf(),
            chip: Rc::clone(chip),
        })
    }

    fn map_read_only(&self, path: &Path, len: Option<usize>) -> Result<Mapping> {
        let data = if let Some(chip) = self.blocks.get(path) {
            let chip = chip.borrow();
            if chip.open {
                return Err(Error::io(path, io::Error::from_raw_os_error(libc::EBUSY))
                    .context("raw device still open"));
            }
            chip.data.clone()
        } else {
            self.files.get(path).cloned().ok_or_else(|| not_found(path))?
        };

        let len = len.unwrap_or(data.len());
        if len > data.len() {
            return Err(Error::io(path, io::Error::from_raw_os_error(libc::EINVAL))
                .context("mmap failed"));
        }
        Ok(Mapping::Memory(data[..len].to_vec()))
    }
}
