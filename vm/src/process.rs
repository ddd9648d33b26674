//! The pager's view of processes.

use crate::error::Result;
use crate::mem::page_state::{PageEntry, PageStateTable};
use crate::mem::UserPage;
use crate::paging::PageMapper;
use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};

pub type Pid = u16;

/// A weak reference to a process. A pid can be reused once its process is
/// gone, the generation tells the incarnations apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessRef {
    pub pid: Pid,
    pub generation: u32,
}

/// Everything the eviction path needs to touch in a victim's owner.
pub struct ProcessMemory {
    pub pages: PageStateTable,
    pub mapper: Box<dyn PageMapper>,
}

pub struct Process {
    id: ProcessRef,
    /// Serializes fault resolution, installs, unmaps and buffer pinning for this
    /// process. Taken before the frame-table lock.
    fault_lock: Mutex<()>,
    /// Held only for short bookkeeping updates. Taken after the frame-table lock
    /// and never held while acquiring it.
    memory: Mutex<ProcessMemory>,
}

impl Process {
    fn new(id: ProcessRef, mapper: Box<dyn PageMapper>) -> Self {
        Self {
            id,
            fault_lock: Mutex::new(()),
            memory: Mutex::new(ProcessMemory {
                pages: PageStateTable::new(),
                mapper,
            }),
        }
    }

    pub fn id(&self) -> ProcessRef {
        self.id
    }

    pub fn pid(&self) -> Pid {
        self.id.pid
    }

    pub fn lock_faults(&self) -> MutexGuard<'_, ()> {
        self.fault_lock.lock()
    }

    pub fn with_memory<R>(&self, f: impl FnOnce(&mut ProcessMemory) -> R) -> R {
        f(&mut self.memory.lock())
    }

    pub fn install(&self, page: UserPage, entry: PageEntry) -> Result<()> {
        let _faults = self.lock_faults();
        self.with_memory(|memory| memory.pages.try_install(page, entry))
    }

    pub fn install_zero(&self, page: UserPage) {
        let _faults = self.lock_faults();
        self.with_memory(|memory| memory.pages.install_zero(page));
    }

    pub fn lookup(&self, page: UserPage) -> Option<PageEntry> {
        self.with_memory(|memory| memory.pages.lookup(page).cloned())
    }

    pub fn has_entry(&self, page: UserPage) -> bool {
        self.with_memory(|memory| memory.pages.has_entry(page))
    }
}

struct ProcessTableInner {
    content: BTreeMap<Pid, Arc<Process>>,
    next_generation: u32,
}

/// Live processes by pid.
pub struct ProcessTable {
    inner: Mutex<ProcessTableInner>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ProcessTableInner {
                content: BTreeMap::new(),
                next_generation: 1,
            }),
        }
    }

    pub fn register(&self, pid: Pid, mapper: Box<dyn PageMapper>) -> Arc<Process> {
        let mut inner = self.inner.lock();
        assert!(
            !inner.content.contains_key(&pid),
            "Process with pid {pid} already added to process table."
        );

        let generation = inner.next_generation;
        inner.next_generation = inner.next_generation.wrapping_add(1);
        let process = Arc::new(Process::new(ProcessRef { pid, generation }, mapper));
        inner.content.insert(pid, process.clone());
        process
    }

    /// The process `id` refers to, if that incarnation is still registered.
    pub fn get(&self, id: ProcessRef) -> Option<Arc<Process>> {
        self.inner
            .lock()
            .content
            .get(&id.pid)
            .filter(|process| process.id == id)
            .cloned()
    }

    pub fn unregister(&self, id: ProcessRef) -> Option<Arc<Process>> {
        let mut inner = self.inner.lock();
        if inner.content.get(&id.pid)?.id != id {
            return None;
        }
        inner.content.remove(&id.pid)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
