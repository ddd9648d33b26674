use crate::block::Block;
use crate::config::VmConfig;
use crate::error::Result;
use crate::file::MappedFile;
use crate::mem::frame_table::FrameTable;
use crate::mem::page_fault::{self, Access};
use crate::mem::{mmap, user, PhysFrame, UserPage};
use crate::paging::PageMapper;
use crate::process::{Pid, Process, ProcessTable};
use crate::swapping::SwapSpace;
use alloc::{boxed::Box, sync::Arc, vec::Vec};

/// The virtual memory system: user frames, swap, and the processes using them.
///
/// Created once at boot and passed by reference to the trap handler, the
/// loader and the system calls.
pub struct VirtualMemory {
    config: VmConfig,
    frames: FrameTable,
    swap: SwapSpace,
    processes: ProcessTable,
}

impl VirtualMemory {
    pub fn new(config: VmConfig, swap_device: Block) -> Self {
        let vm = Self {
            config,
            frames: FrameTable::new(&config),
            swap: SwapSpace::new(swap_device),
            processes: ProcessTable::new(),
        };
        log::info!(
            "vm: {} user frames at {:#x}, {} swap slots, {:?} replacement",
            config.user_frames,
            config.pool_base,
            vm.swap.capacity(),
            config.replacement
        );
        vm
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn create_process(&self, pid: Pid, mapper: Box<dyn PageMapper>) -> Arc<Process> {
        self.processes.register(pid, mapper)
    }

    /// Releases every frame and swap slot of `process` and forgets it.
    pub fn destroy_process(&self, process: &Process) {
        let _faults = process.lock_faults();

        // Frames first, so eviction stops looking at this process.
        let released = self.frames.release_owner(process.id());
        let resident = process.with_memory(|memory| {
            let resident = memory.pages.destroy(&self.swap);
            for (page, _) in &resident {
                memory.mapper.unmap(*page);
            }
            resident
        });
        debug_assert_eq!(resident.len(), released);

        self.processes.unregister(process.id());
        log::info!("vm: pid {} gone, released {released} frames", process.pid());
    }

    pub fn resolve(&self, process: &Process, addr: usize, access: Access) -> Result<PhysFrame> {
        page_fault::resolve(self, process, addr, access)
    }

    pub fn copy_from_user(&self, process: &Process, addr: usize, len: usize) -> Result<Vec<u8>> {
        user::copy_from_user(self, process, addr, len)
    }

    pub fn copy_to_user(&self, process: &Process, addr: usize, bytes: &[u8]) -> Result<()> {
        user::copy_to_user(self, process, addr, bytes)
    }

    pub fn map_file(
        &self,
        process: &Process,
        addr: usize,
        file: Arc<dyn MappedFile>,
        offset: u64,
        len: usize,
        writable: bool,
    ) -> Result<usize> {
        mmap::map_file(self, process, addr, file, offset, len, writable)
    }

    pub fn unmap_file(&self, process: &Process, addr: usize, len: usize) -> Result<()> {
        mmap::unmap_file(self, process, addr, len)
    }

    pub fn load_page(
        &self,
        process: &Process,
        page: UserPage,
        contents: &[u8],
    ) -> Result<PhysFrame> {
        mmap::load_page(self, process, page, contents)
    }

    /// Tears the system down. Every process must have been destroyed.
    pub fn shutdown(self) {
        assert!(
            self.processes.is_empty(),
            "vm shut down with {} live processes",
            self.processes.len()
        );
        let stats = self.frames.stats();
        assert_eq!(stats.resident, 0, "vm shut down with resident frames");
        assert_eq!(self.swap.used_slots(), 0, "vm shut down with swap slots in use");
        log::info!(
            "vm: shut down after {} evictions ({} to swap, {} discarded)",
            stats.evictions,
            stats.swap_writes,
            stats.clean_discards
        );
    }
}
