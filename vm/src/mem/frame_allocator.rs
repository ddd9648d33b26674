//! The user pool: the physical frames handed out to user pages, and the core
//! map that tracks which of them are in use.

mod placement_algorithms;

pub use placement_algorithms::{FirstFit, NextFit, PlacementAlgorithm};

use super::PhysFrame;
use crate::config::Placement;
use alloc::{boxed::Box, vec::Vec};
use bitbybit::bitfield;
use core::cell::UnsafeCell;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
}

#[repr(C, align(4096))]
struct FrameCell(UnsafeCell<[u8; PAGE_FRAME_SIZE]>);

/// Page-aligned backing memory for every frame in the pool.
///
/// The pool itself does no locking. Who may touch a frame's bytes is decided by
/// the frame table: the thread that holds a frame pinned, or the eviction path
/// while it holds the frame-table lock and the frame is unpinned.
pub struct UserPool {
    base: usize,
    frames: Box<[FrameCell]>,
}

// SAFETY: Access to each cell is serialized by the frame table as described above.
unsafe impl Sync for UserPool {}

impl UserPool {
    pub fn new(base: usize, frames: usize) -> Self {
        assert_eq!(base % PAGE_FRAME_SIZE, 0, "user pool base must be page aligned");
        let frames: Vec<FrameCell> = (0..frames)
            .map(|_| FrameCell(UnsafeCell::new([0; PAGE_FRAME_SIZE])))
            .collect();
        Self {
            base,
            frames: frames.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, index: usize) -> PhysFrame {
        assert!(index < self.len(), "frame {index} outside the user pool");
        PhysFrame::from_addr(self.base + index * PAGE_FRAME_SIZE)
    }

    pub fn index_of(&self, frame: PhysFrame) -> usize {
        let index = frame
            .addr()
            .checked_sub(self.base)
            .map(|off| off / PAGE_FRAME_SIZE)
            .filter(|i| *i < self.len());
        match index {
            Some(index) => index,
            None => panic!("{frame:?} is not part of the user pool"),
        }
    }

    /// # Safety
    ///
    /// The caller must have exclusive use of `frame` (see [`UserPool`]) for the
    /// lifetime of the returned reference.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, frame: PhysFrame) -> &mut [u8; PAGE_FRAME_SIZE] {
        &mut *self.frames[self.index_of(frame)].0.get()
    }

    /// # Safety
    ///
    /// No other thread may write `frame` while the returned reference lives.
    pub unsafe fn bytes(&self, frame: PhysFrame) -> &[u8; PAGE_FRAME_SIZE] {
        &*self.frames[self.index_of(frame)].0.get()
    }
}

/// Hands out free frame indices of a [`UserPool`].
pub struct FrameAllocator {
    core_map: Box<[CoreMapEntry]>,
    placement_algorithm: Box<dyn PlacementAlgorithm>,
    frames_allocated: usize,
}

impl FrameAllocator {
    pub fn new(frames: usize, placement: Placement) -> Self {
        let placement_algorithm: Box<dyn PlacementAlgorithm> = match placement {
            Placement::NextFit => Box::new(NextFit::default()),
            Placement::FirstFit => Box::new(FirstFit),
        };
        Self {
            core_map: alloc::vec![CoreMapEntry::DEFAULT; frames].into_boxed_slice(),
            placement_algorithm,
            frames_allocated: 0,
        }
    }

    /// Takes a free frame, or returns `None` if every frame is in use.
    pub fn alloc(&mut self) -> Option<usize> {
        if self.frames_allocated == self.core_map.len() {
            return None;
        }

        let index = self.placement_algorithm.place(&self.core_map)?;
        assert!(!self.core_map[index].allocated());
        self.core_map[index] = self.core_map[index].with_allocated(true);
        self.frames_allocated += 1;
        Some(index)
    }

    pub fn dealloc(&mut self, index: usize) {
        assert!(
            self.core_map[index].allocated(),
            "double free of user frame {index}"
        );
        self.core_map[index] = self.core_map[index].with_allocated(false);
        self.frames_allocated -= 1;
    }

    pub fn frames_allocated(&self) -> usize {
        self.frames_allocated
    }
}
