//! Kernel access to user memory on behalf of system calls.

use super::page_fault::{resolve_locked, Access};
use super::page_state::PageStatus;
use super::{PhysFrame, UserPage};
use crate::error::{Result, VmError};
use crate::process::Process;
use crate::system::VirtualMemory;
use alloc::vec::Vec;
use core::cmp::min;
use kidneyos_shared::mem::{page_offset, OFFSET, PAGE_FRAME_SIZE};

/// Splits `addr..addr + len` into per-page pieces of (address, length).
fn chunks(addr: usize, len: usize) -> Result<impl Iterator<Item = (usize, usize)>> {
    // Trying to reach into kernel memory.
    let end = addr.checked_add(len).ok_or(VmError::KernelAddress(addr))?;
    if end > OFFSET {
        return Err(VmError::KernelAddress(addr));
    }

    let mut cursor = addr;
    Ok(core::iter::from_fn(move || {
        if cursor >= end {
            return None;
        }
        let chunk = min(end - cursor, PAGE_FRAME_SIZE - page_offset(cursor));
        let piece = (cursor, chunk);
        cursor += chunk;
        Some(piece)
    }))
}

/// Runs `f` on each piece of the user range with its page resident and pinned,
/// then records the access in the page table the way the MMU would.
fn for_each_piece(
    vm: &VirtualMemory,
    process: &Process,
    addr: usize,
    len: usize,
    access: Access,
    mut f: impl FnMut(&mut [u8]),
) -> Result<()> {
    let _faults = process.lock_faults();
    for (cursor, chunk) in chunks(addr, len)? {
        let frame = resolve_locked(vm, process, cursor, access, true)?;
        let offset = page_offset(cursor);
        vm.frames()
            .with_pinned(frame, |bytes| f(&mut bytes[offset..offset + chunk]));

        if let Some(page) = UserPage::containing(cursor) {
            let touched =
                process.with_memory(|memory| memory.mapper.touch(page, access == Access::Write));
            debug_assert!(touched, "{page:?} is not mapped after being resolved");
        }
        vm.frames().unpin(frame);
    }
    Ok(())
}

/// Copies `len` bytes starting at user address `addr` into kernel memory.
pub fn copy_from_user(
    vm: &VirtualMemory,
    process: &Process,
    addr: usize,
    len: usize,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    for_each_piece(vm, process, addr, len, Access::Read, |bytes| {
        out.extend_from_slice(bytes);
    })?;
    Ok(out)
}

/// Copies `bytes` to user address `addr`. Fails without copying anything past
/// the first page that is unmapped or read-only.
pub fn copy_to_user(
    vm: &VirtualMemory,
    process: &Process,
    addr: usize,
    bytes: &[u8],
) -> Result<()> {
    let mut rest = bytes;
    for_each_piece(vm, process, addr, bytes.len(), Access::Write, |dst| {
        let (head, tail) = core::mem::take(&mut rest).split_at(dst.len());
        dst.copy_from_slice(head);
        rest = tail;
    })
}

/// Faults in and pins every page of a user buffer so a blocking transfer can
/// use it without faulting. Nothing stays pinned on failure.
pub fn pin_user_buffer(
    vm: &VirtualMemory,
    process: &Process,
    addr: usize,
    len: usize,
    access: Access,
) -> Result<Vec<PhysFrame>> {
    let _faults = process.lock_faults();
    let mut pinned = Vec::new();
    for (cursor, _) in chunks(addr, len)? {
        match resolve_locked(vm, process, cursor, access, true) {
            Ok(frame) => pinned.push(frame),
            Err(e) => {
                for frame in pinned {
                    vm.frames().unpin(frame);
                }
                return Err(e);
            }
        }
    }
    Ok(pinned)
}

/// Undoes [`pin_user_buffer`].
pub fn unpin_user_buffer(
    vm: &VirtualMemory,
    process: &Process,
    addr: usize,
    len: usize,
) -> Result<()> {
    let _faults = process.lock_faults();
    for (cursor, _) in chunks(addr, len)? {
        let page = UserPage::containing(cursor).ok_or(VmError::KernelAddress(cursor))?;
        match process.lookup(page).map(|entry| entry.status) {
            Some(PageStatus::Resident { frame }) => vm.frames().unpin(frame),
            status => {
                log::error!("user: pid {} unpinned non-resident {page:?}", process.pid());
                panic!("unpinning {page:?} which was not pinned ({status:?})");
            }
        }
    }
    Ok(())
}
