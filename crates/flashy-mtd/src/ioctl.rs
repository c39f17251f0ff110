//! MTD character device ioctls
//!
//! Structures match `include/uapi/mtd/mtd-abi.h`.

use bitflags::bitflags;

/// MTD device types reported in [`MtdInfoUser::mtd_type`]
pub mod mtd_type {
    pub const ABSENT: u8 = 0;
    pub const RAM: u8 = 1;
    pub const ROM: u8 = 2;
    pub const NOR_FLASH: u8 = 3;
    pub const NAND_FLASH: u8 = 4;
    pub const DATA_FLASH: u8 = 6;
    pub const UBI_VOLUME: u8 = 7;
    pub const MLC_NAND_FLASH: u8 = 8;
}

bitflags! {
    /// MTD capability flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MtdFlags: u32 {
        /// Device is writeable
        const WRITEABLE = 0x400;
        /// Single bits can be flipped
        const BIT_WRITEABLE = 0x800;
        /// No erase necessary
        const NO_ERASE = 0x1000;
        /// Always locked after reset
        const POWERUP_LOCK = 0x2000;
    }
}

/// `struct mtd_info_user`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MtdInfoUser {
    pub mtd_type: u8,
    pub flags: u32,
    /// Total size of the MTD
    pub size: u32,
    pub erasesize: u32,
    pub writesize: u32,
    /// Amount of OOB data per block (e.g. 16)
    pub oobsize: u32,
    pub padding: u64,
}

impl MtdInfoUser {
    pub fn flags(&self) -> MtdFlags {
        MtdFlags::from_bits_truncate(self.flags)
    }

    pub fn type_name(&self) -> &'static str {
        match self.mtd_type {
            mtd_type::ABSENT => "absent",
            mtd_type::RAM => "ram",
            mtd_type::ROM => "rom",
            mtd_type::NOR_FLASH => "nor",
            mtd_type::NAND_FLASH => "nand",
            mtd_type::DATA_FLASH => "dataflash",
            mtd_type::UBI_VOLUME => "ubi",
            mtd_type::MLC_NAND_FLASH => "mlc-nand",
            _ => "unknown",
        }
    }
}

/// `struct erase_info_user`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseInfoUser {
    pub start: u32,
    pub length: u32,
}

// MEMGETINFO = _IOR('M', 1, struct mtd_info_user)
nix::ioctl_read!(memgetinfo, b'M', 1, MtdInfoUser);
// MEMERASE = _IOW('M', 2, struct erase_info_user)
nix::ioctl_write_ptr!(memerase, b'M', 2, EraseInfoUser);
