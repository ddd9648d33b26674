//! File mappings and eagerly loaded pages.

use super::page_state::{PageEntry, PageStatus};
use super::{PhysFrame, UserPage};
use crate::error::{Result, VmError};
use crate::file::MappedFile;
use crate::process::Process;
use crate::system::VirtualMemory;
use alloc::{sync::Arc, vec, vec::Vec};
use core::cmp::min;
use kidneyos_shared::mem::{is_user_vaddr, PAGE_FRAME_SIZE};

fn user_page(addr: usize) -> Result<UserPage> {
    if !is_user_vaddr(addr) {
        return Err(VmError::KernelAddress(addr));
    }
    UserPage::new(addr).ok_or(VmError::Unaligned(addr))
}

/// The pages covering `len` bytes from `start`.
fn pages(start: UserPage, len: usize) -> Result<Vec<UserPage>> {
    (0..len.div_ceil(PAGE_FRAME_SIZE))
        .map(|i| {
            start
                .offset(i)
                .ok_or(VmError::KernelAddress(start.addr().saturating_add(len)))
        })
        .collect()
}

/// Maps `len` bytes of `file` from `offset` at user address `addr`. Pages are
/// read in on first touch. Returns the number of pages mapped.
pub fn map_file(
    vm: &VirtualMemory,
    process: &Process,
    addr: usize,
    file: Arc<dyn MappedFile>,
    offset: u64,
    len: usize,
    writable: bool,
) -> Result<usize> {
    let pages = pages(user_page(addr)?, len)?;
    // (page, file offset, bytes read from the file)
    let layout = pages
        .iter()
        .enumerate()
        .map(|(i, page)| -> Result<(UserPage, u64, usize)> {
            let start = i * PAGE_FRAME_SIZE;
            let page_offset = offset
                .checked_add(start as u64)
                .ok_or(VmError::FileOffset(offset))?;
            Ok((*page, page_offset, min(PAGE_FRAME_SIZE, len - start)))
        })
        .collect::<Result<Vec<_>>>()?;

    let _faults = process.lock_faults();
    process.with_memory(|memory| {
        if let Some(taken) = pages.iter().find(|page| memory.pages.has_entry(**page)) {
            return Err(VmError::Overlap(taken.addr()));
        }

        for &(page, page_offset, read_len) in &layout {
            memory.pages.install_file_backed(
                page,
                file.clone(),
                page_offset,
                read_len,
                PAGE_FRAME_SIZE - read_len,
                writable,
            );
        }
        Ok(())
    })?;

    log::debug!(
        "mmap: pid {} mapped {} pages at {addr:#x}, free frames {}",
        process.pid(),
        pages.len(),
        vm.frames().free_frames()
    );
    Ok(pages.len())
}

/// Removes the file mapping covering `len` bytes at `addr`, writing modified
/// pages back to the file.
///
/// Every page in the range must belong to a file mapping. If a write-back fails
/// the rest of the range is still unmapped and the first error is returned.
pub fn unmap_file(
    vm: &VirtualMemory,
    process: &Process,
    addr: usize,
    len: usize,
) -> Result<()> {
    let pages = pages(user_page(addr)?, len)?;

    let _faults = process.lock_faults();
    process.with_memory(|memory| {
        match pages.iter().find(|page| {
            memory
                .pages
                .lookup(**page)
                .and_then(PageEntry::file_mapping)
                .is_none()
        }) {
            Some(page) => Err(VmError::NotMapped(page.addr())),
            None => Ok(()),
        }
    })?;

    let mut result = Ok(());
    for page in pages {
        let unmapped = unmap_page(vm, process, page);
        if result.is_ok() {
            result = unmapped;
        }
    }
    result
}

fn unmap_page(vm: &VirtualMemory, process: &Process, page: UserPage) -> Result<()> {
    let frames = vm.frames();

    // Take the entry out of the table. A resident page is pinned first so that
    // eviction cannot move it while we look at its frame.
    let (entry, frame) = loop {
        let Some(entry) = process.lookup(page) else {
            return Ok(());
        };
        let PageStatus::Resident { frame } = entry.status else {
            break (process.with_memory(|memory| memory.pages.remove(page)), None);
        };
        if frames.try_pin(frame, process.id(), page) {
            let entry = process.with_memory(|memory| {
                let dirty = memory.mapper.is_dirty(page);
                memory.mapper.unmap(page);
                memory.pages.mark_dirty(page, dirty);
                memory.pages.remove(page)
            });
            break (entry, Some(frame));
        }
    };
    let mapping = entry.as_ref().and_then(PageEntry::file_mapping);
    let dirty = entry.as_ref().is_some_and(|entry| entry.dirty);
    let write_back = |bytes: &[u8]| match mapping {
        Some(mapping) if dirty => mapping
            .file
            .write_at(mapping.offset, &bytes[..mapping.read_len])
            .map(|_| ()),
        _ => Ok(()),
    };

    let written = match (frame, entry.as_ref().map(|entry| &entry.status)) {
        (Some(frame), _) => {
            let written = frames.with_pinned(frame, |bytes| write_back(&bytes[..]));
            frames.free(frame, true);
            written
        }
        (None, Some(PageStatus::Swapped { slot })) => {
            let mut bytes = vec![0; PAGE_FRAME_SIZE];
            vm.swap().swap_in(*slot, &mut bytes);
            write_back(&bytes)
        }
        _ => Ok(()),
    };

    written.map_err(|e| {
        log::warn!("munmap: pid {} write-back of {page:?} failed: {e}", process.pid());
        VmError::from(e)
    })
}

/// Loads `contents` into a fresh frame and installs it at `page` as a resident
/// page, zero-filling the rest of the frame. Used for stack setup and eagerly
/// loaded segments.
pub fn load_page(
    vm: &VirtualMemory,
    process: &Process,
    page: UserPage,
    contents: &[u8],
) -> Result<PhysFrame> {
    assert!(contents.len() <= PAGE_FRAME_SIZE, "more than a page of contents");

    let _faults = process.lock_faults();
    if process.has_entry(page) {
        return Err(VmError::AlreadyInstalled(page.addr()));
    }

    let frames = vm.frames();
    let frame = frames.allocate(process.id(), page, vm.swap(), vm.processes());
    frames.with_pinned(frame, |bytes| {
        bytes[..contents.len()].copy_from_slice(contents);
        bytes[contents.len()..].fill(0);
    });

    let mapped = process.with_memory(|memory| {
        if !memory.mapper.map(frame, page, true) {
            return false;
        }
        memory.pages.install_resident(page, frame);
        true
    });
    if !mapped {
        frames.free(frame, true);
        return Err(VmError::MapFailed(page.addr()));
    }

    frames.unpin(frame);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryFile;
    use crate::mem::page_fault::{resolve, Access};
    use crate::mem::user::{copy_from_user, copy_to_user};
    use crate::paging::PageManager;
    use crate::testing::{page, vm};
    use alloc::boxed::Box;

    fn file(len: usize) -> Arc<MemoryFile> {
        Arc::new(MemoryFile::new((0..len).map(|i| (i % 251) as u8).collect()))
    }

    #[test]
    fn test_map_file_pages() {
        let vm = vm(4);
        let process = vm.create_process(1, Box::new(PageManager::new()));
        let file = file(PAGE_FRAME_SIZE + 10);

        let len = PAGE_FRAME_SIZE + 10;
        assert_eq!(
            map_file(&vm, &process, page(1).addr(), file.clone(), 0, len, false),
            Ok(2)
        );
        let last = process.lookup(page(2)).unwrap();
        let mapping = last.file_mapping().unwrap();
        assert_eq!((mapping.offset, mapping.read_len), (PAGE_FRAME_SIZE as u64, 10));
        assert_eq!(
            copy_from_user(&vm, &process, page(2).addr(), 3).unwrap(),
            &file.contents()[PAGE_FRAME_SIZE..PAGE_FRAME_SIZE + 3]
        );
        vm.destroy_process(&process);
    }

    #[test]
    fn test_map_file_rejects_bad_ranges() {
        let vm = vm(4);
        let process = vm.create_process(1, Box::new(PageManager::new()));
        process.install_zero(page(2));
        let file = file(100);

        assert_eq!(
            map_file(&vm, &process, page(1).addr() + 1, file.clone(), 0, 100, true),
            Err(VmError::Unaligned(page(1).addr() + 1))
        );
        let len = 2 * PAGE_FRAME_SIZE;
        assert_eq!(
            map_file(&vm, &process, page(1).addr(), file.clone(), 0, len, true),
            Err(VmError::Overlap(page(2).addr()))
        );
        // Nothing from the failed request was installed.
        assert!(!process.has_entry(page(1)));
        assert!(matches!(
            map_file(&vm, &process, UserPage::STACK_SENTINEL.addr(), file, 0, len, true),
            Err(VmError::KernelAddress(_))
        ));
        vm.destroy_process(&process);
    }

    #[test]
    fn test_map_file_rejects_overflowing_offset() {
        let vm = vm(4);
        let process = vm.create_process(1, Box::new(PageManager::new()));
        let file = file(100);

        let offset = u64::MAX - 10;
        assert_eq!(
            map_file(&vm, &process, page(1).addr(), file, offset, 2 * PAGE_FRAME_SIZE, false),
            Err(VmError::FileOffset(offset))
        );
        // The first page's offset fits, but it must not be installed either.
        assert!(!process.has_entry(page(1)));
        assert!(!process.has_entry(page(2)));
        vm.destroy_process(&process);
    }

    #[test]
    fn test_unmap_writes_back_resident_page() {
        let vm = vm(4);
        let process = vm.create_process(1, Box::new(PageManager::new()));
        let file = file(100);
        map_file(&vm, &process, page(1).addr(), file.clone(), 0, 100, true).unwrap();

        copy_to_user(&vm, &process, page(1).addr() + 1, b"hi").unwrap();
        // Bytes past the end of the file are not written back.
        copy_to_user(&vm, &process, page(1).addr() + 200, b"no").unwrap();
        unmap_file(&vm, &process, page(1).addr(), 100).unwrap();

        let contents = file.contents();
        assert_eq!(contents.len(), 100);
        assert_eq!(&contents[..4], &[0, b'h', b'i', 3]);
        assert!(!process.has_entry(page(1)));
        assert_eq!(vm.frames().free_frames(), 4);
        vm.destroy_process(&process);
    }

    #[test]
    fn test_unmap_writes_back_swapped_page() {
        let vm = vm(1);
        let process = vm.create_process(1, Box::new(PageManager::new()));
        let file = file(PAGE_FRAME_SIZE);
        let len = PAGE_FRAME_SIZE;
        map_file(&vm, &process, page(1).addr(), file.clone(), 0, len, true).unwrap();
        process.install_zero(page(2));

        copy_to_user(&vm, &process, page(1).addr(), b"swap").unwrap();
        resolve(&vm, &process, page(2).addr(), Access::Read).unwrap();
        assert!(matches!(
            process.lookup(page(1)).unwrap().status,
            PageStatus::Swapped { .. }
        ));

        unmap_file(&vm, &process, page(1).addr(), PAGE_FRAME_SIZE).unwrap();
        assert_eq!(&file.contents()[..4], b"swap");
        assert_eq!(vm.swap().used_slots(), 0);
        vm.destroy_process(&process);
    }

    #[test]
    fn test_clean_mapping_is_not_written() {
        let vm = vm(2);
        let process = vm.create_process(1, Box::new(PageManager::new()));
        let file: Arc<dyn MappedFile> = Arc::new(MemoryFile::read_only(vec![5; 64]));
        map_file(&vm, &process, page(1).addr(), file, 0, 64, false).unwrap();
        copy_from_user(&vm, &process, page(1).addr(), 64).unwrap();

        assert_eq!(unmap_file(&vm, &process, page(1).addr(), 64), Ok(()));
        assert_eq!(
            unmap_file(&vm, &process, page(1).addr(), 64),
            Err(VmError::NotMapped(page(1).addr()))
        );
        vm.destroy_process(&process);
    }

    #[test]
    fn test_load_page() {
        let vm = vm(2);
        let process = vm.create_process(1, Box::new(PageManager::new()));
        let frame = load_page(&vm, &process, UserPage::STACK_SENTINEL, b"argv").unwrap();

        let entry = process.lookup(UserPage::STACK_SENTINEL).unwrap();
        assert_eq!(entry.status, PageStatus::Resident { frame });
        assert!(entry.dirty);
        assert_eq!(&vm.frames().snapshot(frame)[..5], b"argv\0");
        assert_eq!(
            load_page(&vm, &process, UserPage::STACK_SENTINEL, b""),
            Err(VmError::AlreadyInstalled(UserPage::STACK_SENTINEL.addr()))
        );
        vm.destroy_process(&process);
    }
}
