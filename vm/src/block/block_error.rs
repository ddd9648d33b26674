use super::block_core::BlockSector;

/// Error type for block operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    /// The sector is out of bounds (greater than the block size)
    #[error("sector {0} out of bounds")]
    SectorOutOfBounds(BlockSector),
    /// The buffer has an invalid size (not `BLOCK_SECTOR_SIZE`)
    #[error("invalid buffer size {0} (not `BLOCK_SECTOR_SIZE`)")]
    BufferInvalid(usize),
    /// The device refused a write
    #[error("cannot write to a foreign block")]
    ReadOnly,
}
