use super::block_error::BlockError;
use alloc::{boxed::Box, string::String};
use core::fmt;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = kidneyos_shared::sizes::SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Types of blocks
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlockType {
    /// File system
    FileSystem,
    /// Swap
    Swap,
    /// "Raw" device with unidentified contents
    Raw,
    /// Owned by non-KidneyOS operating system
    Foreign,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::FileSystem => write!(f, "File System"),
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Raw => write!(f, "Raw"),
            BlockType::Foreign => write!(f, "Foreign"),
        }
    }
}

/// Lower-level interface to block device drivers
pub trait BlockOp: Send {
    /// Read a block sector
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write a block sector
    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

/// A block device
pub struct Block {
    /// The name of the block device
    block_name: String,
    /// The type of block
    block_type: BlockType,
    /// The block driver
    driver: Box<dyn BlockOp>,
    /// The size of the block device in sectors
    block_size: BlockSector,

    read_count: u64,
    write_count: u64,
}

impl Block {
    pub fn new(
        block_type: BlockType,
        block_name: &str,
        block_size: BlockSector,
        driver: Box<dyn BlockOp>,
    ) -> Self {
        log::info!(
            "Registered block device \"{}\" ({} type) with {} sectors",
            block_name,
            block_type,
            block_size
        );

        Self {
            block_name: String::from(block_name),
            block_type,
            driver,
            block_size,
            read_count: 0,
            write_count: 0,
        }
    }

    fn check(&self, sector: BlockSector, len: usize) -> Result<(), BlockError> {
        if sector >= self.block_size {
            return Err(BlockError::SectorOutOfBounds(sector));
        }
        if len != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid(len));
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must have room for
    /// `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check(sector, buf.len())?;
        self.driver.read(sector, buf)?;
        self.read_count += 1;
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE` bytes. Returns
    /// after the block device has acknowledged receiving the data.
    pub fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check(sector, buf.len())?;
        if self.block_type == BlockType::Foreign {
            return Err(BlockError::ReadOnly);
        }
        self.driver.write(sector, buf)?;
        self.write_count += 1;
        Ok(())
    }

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }
    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
    pub fn read_count(&self) -> u64 {
        self.read_count
    }
    pub fn write_count(&self) -> u64 {
        self.write_count
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.block_name, self.block_type, self.block_size, self.read_count, self.write_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::RamDisk;

    fn disk(block_type: BlockType) -> Block {
        Block::new(block_type, "hdb", 4, Box::new(RamDisk::new(4)))
    }

    #[test]
    fn test_read_back_sector() {
        let mut block = disk(BlockType::Raw);
        let data = [0xAB; BLOCK_SECTOR_SIZE];
        block.write(2, &data).unwrap();
        let mut buf = [0; BLOCK_SECTOR_SIZE];
        block.read(2, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!((block.read_count(), block.write_count()), (1, 1));
    }

    #[test]
    fn test_rejects_bad_requests() {
        let mut block = disk(BlockType::Raw);
        let mut buf = [0; BLOCK_SECTOR_SIZE];
        assert_eq!(block.read(4, &mut buf), Err(BlockError::SectorOutOfBounds(4)));
        assert_eq!(block.write(0, &buf[..10]), Err(BlockError::BufferInvalid(10)));
        assert_eq!(disk(BlockType::Foreign).write(0, &buf), Err(BlockError::ReadOnly));
        assert_eq!(block.read_count(), 0);
    }
}
