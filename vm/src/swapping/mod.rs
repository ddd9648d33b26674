// Slot and sector counts are bounded by the device size, which fits in a
// `BlockSector`.
#![allow(clippy::cast_possible_truncation)]

pub mod page_replacement;

use crate::block::{Block, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use crate::sync::mutex::Mutex;
use kidneyos_shared::{bitmap::Bitmap, mem::PAGE_FRAME_SIZE, sizes::SECTORS_PER_PAGE};

/// A page-sized region of the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub const fn index(self) -> usize {
        self.0
    }

    fn first_sector(self) -> BlockSector {
        self.0 as BlockSector * SECTORS_PER_PAGE
    }
}

struct SwapInner {
    device: Block,
    used: Bitmap,
}

/// Page-sized slots on a swap block device.
///
/// A single lock covers the slot map and the device, and is held for the whole
/// of every transfer.
pub struct SwapSpace {
    inner: Mutex<SwapInner>,
}

impl SwapSpace {
    pub fn new(device: Block) -> Self {
        assert_eq!(
            device.get_type(),
            BlockType::Swap,
            "swap space needs a swap block device, got {device}"
        );
        let slots = (device.get_size() / SECTORS_PER_PAGE) as usize;
        log::info!("swap: {slots} slots on {}", device.get_name());

        Self {
            inner: Mutex::new(SwapInner {
                device,
                used: Bitmap::new(slots),
            }),
        }
    }

    /// Writes one page to a free slot and returns the slot.
    ///
    /// # Panics
    ///
    /// When every slot is occupied.
    pub fn swap_out(&self, page: &[u8]) -> SwapSlot {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        let mut inner = self.inner.lock();

        let Some(index) = inner.used.first_clear() else {
            log::error!("swap: out of swap slots");
            panic!("swap space exhausted");
        };
        let slot = SwapSlot(index);
        inner.used.set(index, true);

        for (i, chunk) in page.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            let sector = slot.first_sector() + i as BlockSector;
            inner
                .device
                .write(sector, chunk)
                .unwrap_or_else(|e| panic!("swap: write of sector {sector} failed: {e}"));
        }

        log::debug!("swap: wrote slot {index}");
        slot
    }

    /// Reads `slot` into `page` and frees the slot.
    ///
    /// # Panics
    ///
    /// When `slot` is not occupied.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8]) {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        let mut inner = self.inner.lock();
        Self::check_occupied(&inner, slot);

        for (i, chunk) in page.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            let sector = slot.first_sector() + i as BlockSector;
            inner
                .device
                .read(sector, chunk)
                .unwrap_or_else(|e| panic!("swap: read of sector {sector} failed: {e}"));
        }
        inner.used.set(slot.0, false);

        log::debug!("swap: read slot {}", slot.0);
    }

    /// Frees `slot` without reading it back.
    pub fn free(&self, slot: SwapSlot) {
        let mut inner = self.inner.lock();
        Self::check_occupied(&inner, slot);
        inner.used.set(slot.0, false);
    }

    fn check_occupied(inner: &SwapInner, slot: SwapSlot) {
        if slot.0 >= inner.used.len() || !inner.used.get(slot.0) {
            log::error!("swap: slot {} is not in use", slot.0);
            panic!("swap slot {} is not in use", slot.0);
        }
    }

    pub fn is_occupied(&self, slot: SwapSlot) -> bool {
        let inner = self.inner.lock();
        slot.0 < inner.used.len() && inner.used.get(slot.0)
    }

    pub fn used_slots(&self) -> usize {
        self.inner.lock().used.count_set()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().used.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::RamDisk;
    use crate::testing::swap_space;
    use alloc::{boxed::Box, vec};
    use proptest::prelude::*;

    #[test]
    fn test_slots_are_reused_without_aliasing() {
        let swap = swap_space(2);
        assert_eq!(swap.capacity(), 2);

        let a = swap.swap_out(&[1; PAGE_FRAME_SIZE]);
        let b = swap.swap_out(&[2; PAGE_FRAME_SIZE]);
        assert_ne!(a, b);

        let mut page = [0; PAGE_FRAME_SIZE];
        swap.swap_in(a, &mut page);
        assert_eq!(page, [1; PAGE_FRAME_SIZE]);
        assert!(!swap.is_occupied(a));

        let c = swap.swap_out(&[3; PAGE_FRAME_SIZE]);
        assert_eq!(c, a);
        swap.swap_in(b, &mut page);
        assert_eq!(page, [2; PAGE_FRAME_SIZE]);
        assert_eq!(swap.used_slots(), 1);
    }

    #[test]
    #[should_panic(expected = "swap space exhausted")]
    fn test_swap_full() {
        let swap = swap_space(1);
        swap.swap_out(&[0; PAGE_FRAME_SIZE]);
        swap.swap_out(&[0; PAGE_FRAME_SIZE]);
    }

    #[test]
    #[should_panic(expected = "not in use")]
    fn test_swap_in_free_slot() {
        let swap = swap_space(1);
        let slot = swap.swap_out(&[0; PAGE_FRAME_SIZE]);
        swap.free(slot);
        swap.swap_in(slot, &mut [0; PAGE_FRAME_SIZE]);
    }

    #[test]
    #[should_panic(expected = "swap block device")]
    fn test_rejects_non_swap_device() {
        SwapSpace::new(Block::new(
            BlockType::FileSystem,
            "hda",
            SECTORS_PER_PAGE,
            Box::new(RamDisk::new(SECTORS_PER_PAGE)),
        ));
    }

    proptest! {
        #[test]
        fn swap_in_returns_what_was_swapped_out(seed in any::<u8>(), filler in 1..4usize) {
            let swap = swap_space(4);
            // Occupy some slots so the page under test does not always land in slot 0.
            let fillers: vec::Vec<_> = (0..filler)
                .map(|i| swap.swap_out(&[i as u8; PAGE_FRAME_SIZE]))
                .collect();

            let page: vec::Vec<u8> = (0..PAGE_FRAME_SIZE)
                .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
                .collect();
            let slot = swap.swap_out(&page);

            let mut back = vec![0; PAGE_FRAME_SIZE];
            swap.swap_in(slot, &mut back);
            prop_assert_eq!(back, page);
            prop_assert!(!swap.is_occupied(slot));
            prop_assert_eq!(swap.used_slots(), fillers.len());
        }
    }
}
