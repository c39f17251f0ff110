//! flashy-mtd - erase/program/verify engine for Linux MTD devices
//!
//! The engine copies an image on to a raw `/dev/mtdN` character device,
//! leaving an optional leading read-only region untouched, and verifies the
//! result through the `/dev/mtdblockN` alias.
//!
//! # Example
//!
//! ```ignore
//! use flashy_mtd::{DevWatchdog, FlashCp, LinuxMtdHost, NoProgress};
//!
//! let watchdog = DevWatchdog::new("/dev/watchdog", 300);
//! FlashCp::new(&LinuxMtdHost, &watchdog).flash_cp(
//!     Path::new("/tmp/image.bin"),
//!     Path::new("/dev/mtd5"),
//!     0,
//!     &mut NoProgress,
//! )?;
//! ```
//!
//! All device access goes through the [`MtdHost`] trait. [`LinuxMtdHost`]
//! talks to the kernel; [`MemoryMtdHost`] emulates NOR flash in memory.

pub mod device_file;
pub mod flashcp;
pub mod ioctl;
pub mod memory;
pub mod mmap;
pub mod progress;
pub mod watchdog;

pub use device_file::{mtd_block_path, FlashDeviceFile, LinuxMtdHost, MtdCharDevice, MtdHost};
pub use flashcp::{erase_region, health_check, verify, EraseRegion, FlashCp};
pub use ioctl::{MtdFlags, MtdInfoUser};
pub use memory::{MemoryChip, MemoryMtd, MemoryMtdHost};
pub use mmap::{MappedFile, Mapping};
pub use progress::{FlashProgress, FlashStats, NoProgress};
pub use watchdog::{DevWatchdog, NoWatchdog, Watchdog};
