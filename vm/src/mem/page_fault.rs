//! Page fault resolution.
//!
//! The trap handler calls [`resolve`] with the faulting address. Any error means
//! the process made an invalid reference and should be killed.

use super::page_state::{PageEntry, PageStatus};
use super::{PhysFrame, UserPage};
use crate::error::{Result, VmError};
use crate::process::Process;
use crate::system::VirtualMemory;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Makes the page containing `addr` resident and mapped.
pub fn resolve(
    vm: &VirtualMemory,
    process: &Process,
    addr: usize,
    access: Access,
) -> Result<PhysFrame> {
    let _faults = process.lock_faults();
    resolve_locked(vm, process, addr, access, false)
}

/// Like [`resolve`], but the frame comes back pinned. The caller unpins it
/// through the frame table when done.
pub fn resolve_pinned(
    vm: &VirtualMemory,
    process: &Process,
    addr: usize,
    access: Access,
) -> Result<PhysFrame> {
    let _faults = process.lock_faults();
    resolve_locked(vm, process, addr, access, true)
}

/// The caller holds `process`'s fault lock.
pub(crate) fn resolve_locked(
    vm: &VirtualMemory,
    process: &Process,
    addr: usize,
    access: Access,
    keep_pinned: bool,
) -> Result<PhysFrame> {
    let page = UserPage::containing(addr).ok_or(VmError::KernelAddress(addr))?;
    log::trace!("fault: pid {} {access:?} at {addr:#x}", process.pid());

    loop {
        let entry = process.lookup(page).ok_or(VmError::NotMapped(addr))?;
        if access == Access::Write && !entry.writable() {
            return Err(VmError::ReadOnly(addr));
        }

        let PageStatus::Resident { frame } = entry.status else {
            return load(vm, process, page, &entry, keep_pinned);
        };
        if !keep_pinned {
            return Ok(frame);
        }
        // Eviction may take the frame between the lookup and the pin; in that
        // case the entry has moved on and we go again.
        if vm.frames().try_pin(frame, process.id(), page) {
            return Ok(frame);
        }
    }
}

fn load(
    vm: &VirtualMemory,
    process: &Process,
    page: UserPage,
    entry: &PageEntry,
    keep_pinned: bool,
) -> Result<PhysFrame> {
    let frames = vm.frames();
    let frame = frames.allocate(process.id(), page, vm.swap(), vm.processes());

    if let Err(e) = frames.with_pinned(frame, |bytes| fill(vm, page, &entry.status, bytes)) {
        log::warn!("fault: pid {} {page:?}: {e}", process.pid());
        frames.free(frame, true);
        return Err(e);
    }

    let writable = entry.writable();
    let mapped = process.with_memory(|memory| {
        if !memory.mapper.map(frame, page, writable) {
            return false;
        }
        memory.pages.set_resident(page, frame);
        true
    });

    if !mapped {
        log::warn!("fault: pid {} could not map {page:?}", process.pid());
        if let PageStatus::Swapped { .. } = entry.status {
            // Swapping in released the slot, so the frame holds the only copy.
            let slot = frames.with_pinned(frame, |bytes| vm.swap().swap_out(&bytes[..]));
            process.with_memory(|memory| memory.pages.set_swap_slot(page, slot));
        }
        frames.free(frame, true);
        return Err(VmError::MapFailed(page.addr()));
    }

    if !keep_pinned {
        frames.unpin(frame);
    }
    Ok(frame)
}

fn fill(
    vm: &VirtualMemory,
    page: UserPage,
    status: &PageStatus,
    bytes: &mut [u8; PAGE_FRAME_SIZE],
) -> Result<()> {
    match status {
        PageStatus::Zero => bytes.fill(0),
        PageStatus::FileBacked(mapping) => {
            let got = mapping
                .file
                .read_at(mapping.offset, &mut bytes[..mapping.read_len])?;
            if got != mapping.read_len {
                return Err(VmError::ShortRead {
                    page: page.addr(),
                    expected: mapping.read_len,
                    got,
                });
            }
            bytes[mapping.read_len..].fill(0);
        }
        PageStatus::Swapped { slot } => vm.swap().swap_in(*slot, bytes),
        PageStatus::Resident { .. } => unreachable!("resident pages are not filled"),
    }
    Ok(())
}
