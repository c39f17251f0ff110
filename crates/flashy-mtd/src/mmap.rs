//! Read-only memory mappings of images and block devices

use flashy_core::{Error, Result};
use std::fs::File;
use std::io;
use std::ops::Deref;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// A read-only shared mapping of (the start of) a file
#[derive(Debug)]
pub struct MappedFile {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MappedFile {
    /// Map the whole file at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let len = file.metadata().map_err(|e| Error::io(path, e))?.len();
        let len = usize::try_from(len).map_err(|_| {
            Error::io(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "file too large to map"),
            )
        })?;
        Self::map(&file, len, path)
    }

    /// Map the first `len` bytes of the file at `path`
    pub fn open_range(path: &Path, len: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        Self::map(&file, len, path)
    }

    /// Map the first `len` bytes of `file`
    ///
    /// The mapping stays valid after `file` is closed.
    pub fn map(file: &File, len: usize, path: &Path) -> Result<Self> {
        // mmap rejects empty mappings
        if len == 0 {
            return Ok(Self {
                ptr: std::ptr::null_mut(),
                len: 0,
            });
        }

        // SAFETY: a fresh read-only shared mapping of a valid descriptor;
        // the result is checked against MAP_FAILED.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::io(path, io::Error::last_os_error()).context("mmap failed"));
        }

        Ok(Self { ptr, len })
    }
}

impl Deref for MappedFile {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: ptr maps len readable bytes until Drop
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if self.len != 0 {
            // SAFETY: ptr and len come from a successful mmap
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

/// Read-only view of image or device contents
pub enum Mapping {
    /// Backed by an mmap of a real file
    File(MappedFile),
    /// Backed by a copy in memory
    Memory(Vec<u8>),
}

impl Deref for Mapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::File(m) => m,
            Self::Memory(v) => v,
        }
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::File(_) => "File",
            Self::Memory(_) => "Memory",
        };
        write!(f, "Mapping::{}({} bytes)", kind, self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_map_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"foobar").unwrap();
        file.flush().unwrap();

        let whole = MappedFile::open(file.path()).unwrap();
        assert_eq!(&*whole, b"foobar");

        let head = MappedFile::open_range(file.path(), 3).unwrap();
        assert_eq!(&*head, b"foo");
    }

    #[test]
    fn test_map_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mapping = MappedFile::open(file.path()).unwrap();
        assert!(mapping.is_empty());
    }

    #[test]
    fn test_map_missing_file() {
        let err = MappedFile::open(Path::new("/nonexistent/image.bin")).unwrap_err();
        assert_eq!(err.kind(), flashy_core::ErrorKind::Io);
    }
}
