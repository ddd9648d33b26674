//! The global table of resident user frames, and eviction.

use super::frame_allocator::{FrameAllocator, UserPool};
use super::{PhysFrame, UserPage};
use crate::config::{Replacement, VmConfig};
use crate::process::{ProcessRef, ProcessTable};
use crate::swapping::page_replacement::{
    ClockHand, ClockSweep, FrameProbe, PageReplacementPolicy, Reference, SecondChance,
};
use crate::swapping::SwapSpace;
use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, vec::Vec};
use core::hash::{BuildHasher, BuildHasherDefault, Hasher};
use indexmap::IndexMap;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

/// Multiplicative hash for frame addresses. Frame addresses are distinct
/// multiples of the page size, so there is nothing to protect against.
#[derive(Default)]
pub struct FrameHasher(u64);

impl Hasher for FrameHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 = (self.0 ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3);
        }
    }

    fn write_usize(&mut self, n: usize) {
        self.0 = (self.0 ^ n as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    }
}

pub type FrameBuildHasher = BuildHasherDefault<FrameHasher>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEntry {
    pub owner: ProcessRef,
    pub page: UserPage,
    /// Outstanding pins. A frame with any pins is never evicted.
    pub pins: u32,
}

impl FrameEntry {
    pub fn pinned(&self) -> bool {
        self.pins > 0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub resident: usize,
    pub evictions: u64,
    pub swap_writes: u64,
    pub clean_discards: u64,
}

struct FrameTableInner<S> {
    entries: IndexMap<PhysFrame, FrameEntry, S>,
    allocator: FrameAllocator,
    hand: ClockHand,
    policy: Box<dyn PageReplacementPolicy>,
    stats: FrameStats,
}

/// Every user frame currently holding a page, in the order the frames were
/// handed out.
///
/// One lock covers the registry, the underlying allocator and the clock hand,
/// and is held across the whole of an allocation including any eviction.
pub struct FrameTable<S = FrameBuildHasher> {
    pool: UserPool,
    inner: Mutex<FrameTableInner<S>>,
    protect_stack_sentinel: bool,
}

impl<S: BuildHasher + Default + Send> FrameTable<S> {
    pub fn new(config: &VmConfig) -> Self {
        let policy: Box<dyn PageReplacementPolicy> = match config.replacement {
            Replacement::ClockSweep => Box::new(ClockSweep),
            Replacement::SecondChance => Box::new(SecondChance),
        };

        Self {
            pool: UserPool::new(config.pool_base, config.user_frames),
            inner: Mutex::new(FrameTableInner {
                entries: IndexMap::with_hasher(S::default()),
                allocator: FrameAllocator::new(config.user_frames, config.placement),
                hand: ClockHand::default(),
                policy,
                stats: FrameStats::default(),
            }),
            protect_stack_sentinel: config.protect_stack_sentinel,
        }
    }

    pub fn capacity(&self) -> usize {
        self.pool.len()
    }

    /// Gets a frame for `page` of `owner`, evicting another page if the pool is
    /// empty. The frame comes back registered and pinned.
    ///
    /// # Panics
    ///
    /// If the pool is empty and every frame is pinned.
    pub fn allocate(
        &self,
        owner: ProcessRef,
        page: UserPage,
        swap: &SwapSpace,
        processes: &ProcessTable,
    ) -> PhysFrame {
        let mut inner = self.inner.lock();

        let index = match inner.allocator.alloc() {
            Some(index) => index,
            None => self.evict(&mut inner, swap, processes),
        };
        let frame = self.pool.frame(index);

        let entry = FrameEntry {
            owner,
            page,
            pins: 1,
        };
        if let Some(old) = inner.entries.insert(frame, entry) {
            log::error!("frame table: {frame:?} handed out while held by {old:?}");
            panic!("{frame:?} is already registered");
        }
        inner.stats.resident = inner.entries.len();

        log::trace!("frame table: {frame:?} -> pid {} {page:?}", owner.pid);
        frame
    }

    /// Reclaims a frame from some other page and returns its pool index. The
    /// frame stays allocated in the core map.
    fn evict(
        &self,
        inner: &mut FrameTableInner<S>,
        swap: &SwapSpace,
        processes: &ProcessTable,
    ) -> usize {
        let FrameTableInner {
            entries,
            hand,
            policy,
            stats,
            ..
        } = inner;
        let len = entries.len();
        let protect_stack_sentinel = self.protect_stack_sentinel;

        let victim = policy.choose(hand, len, &mut |index, reference| {
            let Some((_, entry)) = entries.get_index(index) else {
                return FrameProbe::default();
            };
            if entry.pinned()
                || (protect_stack_sentinel && entry.page == UserPage::STACK_SENTINEL)
            {
                return FrameProbe::default();
            }
            let accessed = reference == Reference::TestAndClear
                && processes.get(entry.owner).is_some_and(|owner| {
                    owner.with_memory(|memory| {
                        let accessed = memory.mapper.is_accessed(entry.page);
                        memory.mapper.set_accessed(entry.page, false);
                        accessed
                    })
                });
            FrameProbe {
                evictable: true,
                accessed,
            }
        });

        let Some((frame, entry)) = victim.and_then(|index| {
            hand.removed(index);
            entries.shift_remove_index(index)
        }) else {
            log::error!("frame table: all {len} frames are pinned");
            panic!("out of user frames: nothing can be evicted");
        };

        let Some(owner) = processes.get(entry.owner) else {
            log::error!("frame table: {frame:?} is owned by dead process {:?}", entry.owner);
            panic!("{frame:?} has a stale owner");
        };

        // SAFETY: The frame is unpinned and we hold the frame-table lock, so no one
        // else is looking at it.
        let contents = unsafe { self.pool.bytes(frame) };

        owner.with_memory(|memory| {
            let page = entry.page;
            let hardware_dirty = memory.mapper.is_dirty(page);
            memory.mapper.unmap(page);

            assert_eq!(
                memory.pages.lookup(page).and_then(|state| state.frame()),
                Some(frame),
                "page-state entry for {page:?} does not point at its frame"
            );
            memory.pages.mark_dirty(page, hardware_dirty);

            if memory.pages.lookup(page).is_some_and(|state| state.dirty) {
                let slot = swap.swap_out(contents);
                memory.pages.set_swap_slot(page, slot);
                stats.swap_writes += 1;
                log::debug!("frame table: evicted pid {} {page:?} to {slot:?}", owner.pid());
            } else {
                memory.pages.discard(page);
                stats.clean_discards += 1;
                log::debug!("frame table: discarded clean pid {} {page:?}", owner.pid());
            }
        });

        stats.evictions += 1;
        self.pool.index_of(frame)
    }

    fn index_of_registered(inner: &FrameTableInner<S>, frame: PhysFrame) -> usize {
        match inner.entries.get_index_of(&frame) {
            Some(index) => index,
            None => {
                log::error!("frame table: {frame:?} is not registered");
                panic!("{frame:?} is not registered in the frame table");
            }
        }
    }

    /// Drops the registration of `frame`. With `release_physical` the frame also
    /// goes back to the pool; otherwise the caller keeps it until
    /// [`FrameTable::release_physical`].
    pub fn free(&self, frame: PhysFrame, release_physical: bool) {
        let mut inner = self.inner.lock();
        let index = Self::index_of_registered(&inner, frame);
        inner.entries.shift_remove_index(index);
        inner.hand.removed(index);
        inner.stats.resident = inner.entries.len();

        if release_physical {
            inner.allocator.dealloc(self.pool.index_of(frame));
        }
    }

    /// Returns an unregistered frame to the pool.
    pub fn release_physical(&self, frame: PhysFrame) {
        let mut inner = self.inner.lock();
        assert!(
            !inner.entries.contains_key(&frame),
            "{frame:?} is still registered"
        );
        inner.allocator.dealloc(self.pool.index_of(frame));
    }

    pub fn pin(&self, frame: PhysFrame) {
        let mut inner = self.inner.lock();
        let index = Self::index_of_registered(&inner, frame);
        inner.entries[index].pins += 1;
    }

    pub fn unpin(&self, frame: PhysFrame) {
        let mut inner = self.inner.lock();
        let index = Self::index_of_registered(&inner, frame);
        let entry = &mut inner.entries[index];
        assert!(entry.pinned(), "{frame:?} is not pinned");
        entry.pins -= 1;
    }

    /// Pins `frame` if it still holds `page` of `owner`.
    pub fn try_pin(&self, frame: PhysFrame, owner: ProcessRef, page: UserPage) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&frame) {
            Some(entry) if entry.owner == owner && entry.page == page => {
                entry.pins += 1;
                true
            }
            _ => false,
        }
    }

    /// Unregisters and releases every frame of `owner`. Returns how many there were.
    pub fn release_owner(&self, owner: ProcessRef) -> usize {
        let mut inner = self.inner.lock();
        let indices: Vec<usize> = inner
            .entries
            .values()
            .enumerate()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(index, _)| index)
            .collect();

        // Highest first so the remaining indices stay valid.
        for &index in indices.iter().rev() {
            if let Some((frame, _)) = inner.entries.shift_remove_index(index) {
                inner.hand.removed(index);
                inner.allocator.dealloc(self.pool.index_of(frame));
            }
        }
        inner.stats.resident = inner.entries.len();
        indices.len()
    }

    pub fn entry(&self, frame: PhysFrame) -> Option<FrameEntry> {
        self.inner.lock().entries.get(&frame).copied()
    }

    pub fn is_pinned(&self, frame: PhysFrame) -> bool {
        self.entry(frame).is_some_and(|entry| entry.pinned())
    }

    /// Registered frames in clock order.
    pub fn resident_frames(&self) -> Vec<PhysFrame> {
        self.inner.lock().entries.keys().copied().collect()
    }

    pub fn stats(&self) -> FrameStats {
        self.inner.lock().stats
    }

    pub fn free_frames(&self) -> usize {
        self.capacity() - self.inner.lock().allocator.frames_allocated()
    }

    /// Runs `f` on the contents of `frame`, which the caller must hold pinned.
    pub fn with_pinned<R>(
        &self,
        frame: PhysFrame,
        f: impl FnOnce(&mut [u8; PAGE_FRAME_SIZE]) -> R,
    ) -> R {
        assert!(self.is_pinned(frame), "{frame:?} must be pinned to access it");
        // SAFETY: A pinned frame is never evicted, and pins are only taken under
        // the owning process's fault lock, so its contents are ours.
        f(unsafe { self.pool.bytes_mut(frame) })
    }

    /// A copy of an unpinned frame's contents.
    pub fn snapshot(&self, frame: PhysFrame) -> Vec<u8> {
        let inner = self.inner.lock();
        let index = Self::index_of_registered(&inner, frame);
        assert!(
            inner.entries.get_index(index).is_some_and(|(_, e)| !e.pinned()),
            "{frame:?} is pinned"
        );
        // SAFETY: Unpinned frames are only written by eviction, which needs the
        // lock we hold.
        unsafe { self.pool.bytes(frame) }.to_vec()
    }
}
