//! The hardware page-table seam.
//!
//! The pager never touches page tables directly; it goes through
//! [`PageMapper`]. [`PageManager`] keeps a two-level x86 page directory in
//! kernel memory using the shared entry layouts, and is what the host tests
//! drive.

use crate::mem::{PhysFrame, UserPage};
use alloc::{boxed::Box, collections::BTreeMap};
use kidneyos_shared::paging::{
    PageDirectory, PageDirectoryEntry, PageTable, PageTableEntry, VirtualAddress,
};

/// Per-process hardware mappings for user pages.
pub trait PageMapper: Send {
    /// Maps `page` to `frame`. Returns `false` if the page is already mapped or
    /// the page-table memory for it could not be obtained.
    #[must_use]
    fn map(&mut self, frame: PhysFrame, page: UserPage, writable: bool) -> bool;
    /// Removes the mapping for `page`, if any.
    fn unmap(&mut self, page: UserPage);
    fn translate(&self, page: UserPage) -> Option<PhysFrame>;
    fn is_writable(&self, page: UserPage) -> bool;
    fn is_dirty(&self, page: UserPage) -> bool;
    fn set_dirty(&mut self, page: UserPage, dirty: bool);
    fn is_accessed(&self, page: UserPage) -> bool;
    fn set_accessed(&mut self, page: UserPage, accessed: bool);

    fn is_mapped(&self, page: UserPage) -> bool {
        self.translate(page).is_some()
    }

    /// Records a user access to `page` the way the MMU would: sets the
    /// accessed bit, and the dirty bit for writes. Returns `false` where the
    /// hardware would fault instead.
    fn touch(&mut self, page: UserPage, write: bool) -> bool {
        if !self.is_mapped(page) || (write && !self.is_writable(page)) {
            return false;
        }
        self.set_accessed(page, true);
        if write {
            self.set_dirty(page, true);
        }
        true
    }
}

/// A process page directory and the page tables hanging off it.
#[derive(Default)]
pub struct PageManager {
    root: Box<PageDirectory>,
    tables: BTreeMap<usize, Box<PageTable>>,
    /// Maximum number of page tables, `None` for no limit.
    table_limit: Option<usize>,
}

impl PageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager that fails to map pages needing more than `limit` page tables.
    pub fn with_table_limit(limit: usize) -> Self {
        Self {
            table_limit: Some(limit),
            ..Self::default()
        }
    }

    fn entry(&self, page: UserPage) -> Option<&PageTableEntry> {
        let (pd, pt) = VirtualAddress::from_usize(page.addr()).indices();
        if !self.root[pd].present() {
            return None;
        }
        self.tables
            .get(&pd)
            .map(|table| &table[pt])
            .filter(|entry| entry.present())
    }

    fn entry_mut(&mut self, page: UserPage) -> Option<&mut PageTableEntry> {
        let (pd, pt) = VirtualAddress::from_usize(page.addr()).indices();
        self.tables
            .get_mut(&pd)
            .map(|table| &mut table[pt])
            .filter(|entry| entry.present())
    }

    fn update(&mut self, page: UserPage, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        if let Some(entry) = self.entry_mut(page) {
            *entry = f(*entry);
        }
    }
}

impl PageMapper for PageManager {
    fn map(&mut self, frame: PhysFrame, page: UserPage, writable: bool) -> bool {
        if self.is_mapped(page) {
            return false;
        }

        let (pd, pt) = VirtualAddress::from_usize(page.addr()).indices();
        if !self.tables.contains_key(&pd) {
            if self.table_limit.is_some_and(|limit| self.tables.len() >= limit) {
                return false;
            }
            let table = Box::<PageTable>::default();
            // Page tables are walked through `tables`; the directory entry only
            // carries the permission bits.
            self.root[pd] = PageDirectoryEntry::DEFAULT
                .with_present(true)
                .with_read_write(true)
                .with_user_supervisor(true);
            self.tables.insert(pd, table);
        }

        let Some(table) = self.tables.get_mut(&pd) else {
            return false;
        };
        table[pt] = PageTableEntry::user_page(frame.addr(), writable);
        true
    }

    fn unmap(&mut self, page: UserPage) {
        if let Some(entry) = self.entry_mut(page) {
            *entry = PageTableEntry::DEFAULT;
        }
    }

    fn translate(&self, page: UserPage) -> Option<PhysFrame> {
        self.entry(page).map(|entry| PhysFrame::from_addr(entry.frame()))
    }

    fn is_writable(&self, page: UserPage) -> bool {
        self.entry(page).is_some_and(PageTableEntry::read_write)
    }

    fn is_dirty(&self, page: UserPage) -> bool {
        self.entry(page).is_some_and(PageTableEntry::dirty)
    }

    fn set_dirty(&mut self, page: UserPage, dirty: bool) {
        self.update(page, |entry| entry.with_dirty(dirty));
    }

    fn is_accessed(&self, page: UserPage) -> bool {
        self.entry(page).is_some_and(PageTableEntry::accessed)
    }

    fn set_accessed(&mut self, page: UserPage, accessed: bool) {
        self.update(page, |entry| entry.with_accessed(accessed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(addr: usize) -> UserPage {
        UserPage::new(addr).unwrap()
    }

    #[test]
    fn test_map_translate_unmap() {
        let mut pm = PageManager::new();
        let frame = PhysFrame::from_addr(0x0100_0000);
        assert!(pm.map(frame, page(0x0804_8000), false));
        assert_eq!(pm.translate(page(0x0804_8000)), Some(frame));
        assert!(!pm.is_writable(page(0x0804_8000)));
        assert!(!pm.map(frame, page(0x0804_8000), true));

        pm.unmap(page(0x0804_8000));
        assert!(!pm.is_mapped(page(0x0804_8000)));
    }

    #[test]
    fn test_touch_sets_hardware_bits() {
        let mut pm = PageManager::new();
        let p = page(0x1000);
        assert!(!pm.touch(p, false));
        assert!(pm.map(PhysFrame::from_addr(0x0100_0000), p, true));

        assert!(pm.touch(p, false));
        assert!(pm.is_accessed(p));
        assert!(!pm.is_dirty(p));
        assert!(pm.touch(p, true));
        assert!(pm.is_dirty(p));

        pm.set_accessed(p, false);
        pm.set_dirty(p, false);
        assert!(!pm.is_accessed(p) && !pm.is_dirty(p));
    }

    #[test]
    fn test_read_only_write_faults() {
        let mut pm = PageManager::new();
        assert!(pm.map(PhysFrame::from_addr(0x0100_0000), page(0x1000), false));
        assert!(!pm.touch(page(0x1000), true));
        assert!(!pm.is_dirty(page(0x1000)));
        assert!(pm.touch(page(0x1000), false));
    }

    #[test]
    fn test_table_limit() {
        let mut pm = PageManager::with_table_limit(1);
        let frame = PhysFrame::from_addr(0x0100_0000);
        assert!(pm.map(frame, page(0x1000), true));
        // Same page table.
        assert!(pm.map(frame, page(0x2000), true));
        // Needs a second one.
        assert!(!pm.map(frame, page(0x0040_0000), true));
    }
}
