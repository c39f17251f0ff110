//! Progress reporting for the flash engine

/// Counters for one erase/program/verify run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashStats {
    /// Erase blocks erased
    pub blocks_erased: usize,
    /// Bytes erased
    pub bytes_erased: u64,
    /// Bytes programmed, starting at the RO offset
    pub bytes_written: u64,
    /// Bytes compared during verification
    pub bytes_verified: u64,
}

/// Progress callbacks for a flash run
pub trait FlashProgress {
    /// Called when starting erase operations
    fn erasing(&mut self, blocks_to_erase: usize, bytes_to_erase: u64);

    /// Called after each block is erased
    fn erase_progress(&mut self, blocks_erased: usize);

    /// Called when starting write operations
    fn writing(&mut self, bytes_to_write: u64);

    /// Called after each chunk is written
    fn write_progress(&mut self, bytes_written: u64);

    /// Called when starting verification
    fn verifying(&mut self, bytes_to_verify: u64);

    /// Called when the run is complete
    fn complete(&mut self, stats: &FlashStats);
}

/// A no-op progress reporter
pub struct NoProgress;

impl FlashProgress for NoProgress {
    fn erasing(&mut self, _blocks_to_erase: usize, _bytes_to_erase: u64) {}
    fn erase_progress(&mut self, _blocks_erased: usize) {}
    fn writing(&mut self, _bytes_to_write: u64) {}
    fn write_progress(&mut self, _bytes_written: u64) {}
    fn verifying(&mut self, _bytes_to_verify: u64) {}
    fn complete(&mut self, _stats: &FlashStats) {}
}
