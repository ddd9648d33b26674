//! Fixtures shared by the unit tests.

use crate::block::{Block, BlockType, RamDisk};
use crate::config::VmConfig;
use crate::mem::UserPage;
use crate::swapping::SwapSpace;
use crate::system::VirtualMemory;
use alloc::boxed::Box;
use kidneyos_shared::{mem::PAGE_FRAME_SIZE, sizes::SECTORS_PER_PAGE};

pub fn swap_device(slots: u32) -> Block {
    let sectors = slots * SECTORS_PER_PAGE;
    Block::new(BlockType::Swap, "swap", sectors, Box::new(RamDisk::new(sectors)))
}

pub fn swap_space(slots: u32) -> SwapSpace {
    SwapSpace::new(swap_device(slots))
}

pub fn vm_with(config: VmConfig, swap_slots: u32) -> VirtualMemory {
    VirtualMemory::new(config, swap_device(swap_slots))
}

/// A system with `frames` user frames and plenty of swap.
pub fn vm(frames: usize) -> VirtualMemory {
    vm_with(VmConfig::default().with_user_frames(frames), 32)
}

/// The `n`th user page.
pub fn page(n: usize) -> UserPage {
    match UserPage::new(n * PAGE_FRAME_SIZE) {
        Some(page) => page,
        None => panic!("page {n} is not a user page"),
    }
}
