use crate::mem::PAGE_FRAME_SIZE;

pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const GB: usize = MB * KB;

pub const SECTOR_SIZE: u32 = 512;

// A swap slot holds exactly one page, spread over consecutive sectors.
#[allow(clippy::cast_possible_truncation)]
pub const SECTORS_PER_PAGE: u32 = PAGE_FRAME_SIZE as u32 / SECTOR_SIZE;

pub const SWAP_SECTORS: u32 = 8192;
pub const SWAP_SIZE: u32 = SECTOR_SIZE * SWAP_SECTORS;
pub const SWAP_SLOTS: usize = (SWAP_SECTORS / SECTORS_PER_PAGE) as usize;
