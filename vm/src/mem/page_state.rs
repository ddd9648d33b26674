//! Per-process record of where every user page lives.

use super::{PhysFrame, UserPage};
use crate::error::{Result, VmError};
use crate::file::MappedFile;
use crate::swapping::{SwapSlot, SwapSpace};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::fmt;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

/// Where the bytes of a file-backed page come from.
#[derive(Clone)]
pub struct FileMapping {
    pub file: Arc<dyn MappedFile>,
    pub offset: u64,
    /// Bytes read from the file; the remaining `zero_len` bytes are zeroed.
    pub read_len: usize,
    pub zero_len: usize,
    pub writable: bool,
}

impl PartialEq for FileMapping {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.file, &other.file)
            && self.offset == other.offset
            && self.read_len == other.read_len
            && self.zero_len == other.zero_len
            && self.writable == other.writable
    }
}

impl Eq for FileMapping {}

impl fmt::Debug for FileMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMapping")
            .field("file", &Arc::as_ptr(&self.file))
            .field("offset", &self.offset)
            .field("read_len", &self.read_len)
            .field("zero_len", &self.zero_len)
            .field("writable", &self.writable)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageStatus {
    /// Not yet touched; reads as zeros.
    Zero,
    Resident { frame: PhysFrame },
    Swapped { slot: SwapSlot },
    FileBacked(FileMapping),
}

/// What a page reverts to when its frame is reclaimed without being written
/// to swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Anonymous,
    File(FileMapping),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageEntry {
    pub status: PageStatus,
    /// Set once a resident copy has been modified. Never cleared.
    pub dirty: bool,
    pub origin: Origin,
}

impl PageEntry {
    pub fn zero() -> Self {
        Self {
            status: PageStatus::Zero,
            dirty: false,
            origin: Origin::Anonymous,
        }
    }

    pub fn file_backed(mapping: FileMapping) -> Self {
        assert_eq!(
            mapping.read_len + mapping.zero_len,
            PAGE_FRAME_SIZE,
            "file-backed page must cover exactly one page"
        );
        Self {
            status: PageStatus::FileBacked(mapping.clone()),
            dirty: false,
            origin: Origin::File(mapping),
        }
    }

    /// A page whose only copy is already in `frame`.
    pub fn resident(frame: PhysFrame) -> Self {
        Self {
            status: PageStatus::Resident { frame },
            dirty: true,
            origin: Origin::Anonymous,
        }
    }

    pub fn writable(&self) -> bool {
        match &self.origin {
            Origin::Anonymous => true,
            Origin::File(mapping) => mapping.writable,
        }
    }

    pub fn file_mapping(&self) -> Option<&FileMapping> {
        match &self.origin {
            Origin::Anonymous => None,
            Origin::File(mapping) => Some(mapping),
        }
    }

    pub fn frame(&self) -> Option<PhysFrame> {
        match self.status {
            PageStatus::Resident { frame } => Some(frame),
            _ => None,
        }
    }

    fn origin_status(&self) -> PageStatus {
        match &self.origin {
            Origin::Anonymous => PageStatus::Zero,
            Origin::File(mapping) => PageStatus::FileBacked(mapping.clone()),
        }
    }
}

/// The page-state table of one process.
///
/// There is no locking in here; the owning [`Process`](crate::process::Process)
/// keeps the table behind its memory lock.
#[derive(Debug, Default)]
pub struct PageStateTable {
    entries: BTreeMap<UserPage, PageEntry>,
}

impl PageStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `entry` at `page`, leaving any existing entry untouched.
    pub fn try_install(&mut self, page: UserPage, entry: PageEntry) -> Result<()> {
        if self.entries.contains_key(&page) {
            return Err(VmError::AlreadyInstalled(page.addr()));
        }
        self.entries.insert(page, entry);
        Ok(())
    }

    fn install(&mut self, page: UserPage, entry: PageEntry) {
        if self.try_install(page, entry).is_err() {
            log::error!("page table: {page:?} installed twice");
            panic!("{page:?} is already installed");
        }
    }

    pub fn install_zero(&mut self, page: UserPage) {
        self.install(page, PageEntry::zero());
    }

    pub fn install_file_backed(
        &mut self,
        page: UserPage,
        file: Arc<dyn MappedFile>,
        offset: u64,
        read_len: usize,
        zero_len: usize,
        writable: bool,
    ) {
        let mapping = FileMapping {
            file,
            offset,
            read_len,
            zero_len,
            writable,
        };
        self.install(page, PageEntry::file_backed(mapping));
    }

    /// Installs a page that is already loaded into `frame`. The caller is
    /// responsible for the frame-table entry and the hardware mapping.
    pub fn install_resident(&mut self, page: UserPage, frame: PhysFrame) {
        self.install(page, PageEntry::resident(frame));
    }

    pub fn lookup(&self, page: UserPage) -> Option<&PageEntry> {
        self.entries.get(&page)
    }

    pub fn has_entry(&self, page: UserPage) -> bool {
        self.entries.contains_key(&page)
    }

    fn entry_mut(&mut self, page: UserPage) -> &mut PageEntry {
        match self.entries.get_mut(&page) {
            Some(entry) => entry,
            None => {
                log::error!("page table: no entry for {page:?}");
                panic!("no page-state entry for {page:?}");
            }
        }
    }

    pub fn mark_dirty(&mut self, page: UserPage, dirty: bool) {
        self.entry_mut(page).dirty |= dirty;
    }

    pub fn set_swap_slot(&mut self, page: UserPage, slot: SwapSlot) {
        self.entry_mut(page).status = PageStatus::Swapped { slot };
    }

    pub(crate) fn set_resident(&mut self, page: UserPage, frame: PhysFrame) {
        self.entry_mut(page).status = PageStatus::Resident { frame };
    }

    /// Forgets the resident copy of a clean page; it will be rebuilt from its
    /// origin on the next fault.
    pub(crate) fn discard(&mut self, page: UserPage) {
        let entry = self.entry_mut(page);
        entry.status = entry.origin_status();
    }

    pub fn remove(&mut self, page: UserPage) -> Option<PageEntry> {
        self.entries.remove(&page)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empties the table. Swap slots are freed here; the frames of resident
    /// pages are returned so the caller can release them from the frame table.
    /// File references are dropped with their entries.
    pub fn destroy(&mut self, swap: &SwapSpace) -> Vec<(UserPage, PhysFrame)> {
        let mut resident = Vec::new();
        for (page, entry) in core::mem::take(&mut self.entries) {
            match entry.status {
                PageStatus::Resident { frame } => resident.push((page, frame)),
                PageStatus::Swapped { slot } => swap.free(slot),
                PageStatus::Zero | PageStatus::FileBacked(_) => {}
            }
        }
        resident
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryFile;
    use crate::testing::swap_space;
    use alloc::vec;

    fn page(addr: usize) -> UserPage {
        UserPage::new(addr).unwrap()
    }

    fn file() -> Arc<dyn MappedFile> {
        Arc::new(MemoryFile::new(vec![7; 100]))
    }

    #[test]
    fn test_lookup_returns_installed_fields() {
        let mut table = PageStateTable::new();
        let file = file();
        table.install_zero(page(0x1000));
        let zero_len = PAGE_FRAME_SIZE - 100;
        table.install_file_backed(page(0x2000), file.clone(), 0, 100, zero_len, false);

        assert_eq!(table.lookup(page(0x1000)), Some(&PageEntry::zero()));
        let entry = table.lookup(page(0x2000)).unwrap();
        let PageStatus::FileBacked(mapping) = &entry.status else {
            panic!("expected a file-backed page, got {entry:?}");
        };
        assert!(Arc::ptr_eq(&mapping.file, &file));
        assert_eq!((mapping.offset, mapping.read_len), (0, 100));
        assert_eq!(mapping.zero_len, PAGE_FRAME_SIZE - 100);
        assert!(!entry.writable());
        assert!(!entry.dirty);
        assert!(!table.has_entry(page(0x3000)));
    }

    #[test]
    fn test_try_install_twice_keeps_original() {
        let mut table = PageStateTable::new();
        table.install_zero(page(0x1000));
        let resident = PageEntry::resident(PhysFrame::from_addr(0x0100_0000));
        assert_eq!(
            table.try_install(page(0x1000), resident),
            Err(VmError::AlreadyInstalled(0x1000))
        );
        assert_eq!(table.lookup(page(0x1000)), Some(&PageEntry::zero()));
    }

    #[test]
    #[should_panic(expected = "already installed")]
    fn test_install_twice_panics() {
        let mut table = PageStateTable::new();
        table.install_zero(page(0x1000));
        table.install_zero(page(0x1000));
    }

    #[test]
    #[should_panic(expected = "exactly one page")]
    fn test_file_page_must_cover_page() {
        PageStateTable::new().install_file_backed(page(0x1000), file(), 0, 100, 100, true);
    }

    #[test]
    fn test_dirty_is_sticky() {
        let mut table = PageStateTable::new();
        table.install_zero(page(0x1000));
        table.mark_dirty(page(0x1000), true);
        table.mark_dirty(page(0x1000), false);
        assert!(table.lookup(page(0x1000)).unwrap().dirty);

        table.install_resident(page(0x2000), PhysFrame::from_addr(0x0100_0000));
        assert!(table.lookup(page(0x2000)).unwrap().dirty);
    }

    #[test]
    fn test_discard_reverts_to_origin() {
        let mut table = PageStateTable::new();
        let frame = PhysFrame::from_addr(0x0100_0000);
        table.install_zero(page(0x1000));
        let zero_len = PAGE_FRAME_SIZE - 100;
        table.install_file_backed(page(0x2000), file(), 0, 100, zero_len, true);

        for addr in [0x1000, 0x2000] {
            table.set_resident(page(addr), frame);
            table.discard(page(addr));
        }
        assert_eq!(table.lookup(page(0x1000)).unwrap().status, PageStatus::Zero);
        assert!(matches!(
            table.lookup(page(0x2000)).unwrap().status,
            PageStatus::FileBacked(FileMapping { read_len: 100, writable: true, .. })
        ));
    }

    #[test]
    fn test_destroy_frees_slots_and_reports_frames() {
        let swap = swap_space(4);
        let mut table = PageStateTable::new();
        let frame = PhysFrame::from_addr(0x0100_0000);
        table.install_zero(page(0x1000));
        table.install_resident(page(0x2000), frame);
        table.install_zero(page(0x3000));
        table.set_swap_slot(page(0x3000), swap.swap_out(&[1; PAGE_FRAME_SIZE]));

        assert_eq!(table.destroy(&swap), vec![(page(0x2000), frame)]);
        assert!(table.is_empty());
        assert_eq!(swap.used_slots(), 0);
    }
}
