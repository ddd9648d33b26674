pub mod frame_allocator;
pub mod frame_table;
pub mod mmap;
pub mod page_fault;
pub mod page_state;
pub mod user;

use core::fmt;
use kidneyos_shared::mem::{
    is_page_aligned, is_user_vaddr, page_round_down, PAGE_FRAME_SIZE, USER_STACK_PAGE,
};

/// A page-aligned user virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserPage(usize);

impl UserPage {
    /// The last page of user space, holding the top of the initial stack.
    pub const STACK_SENTINEL: Self = Self(USER_STACK_PAGE);

    /// The page containing `addr`, or `None` for kernel addresses.
    pub const fn containing(addr: usize) -> Option<Self> {
        if is_user_vaddr(addr) {
            Some(Self(page_round_down(addr)))
        } else {
            None
        }
    }

    /// Like [`UserPage::containing`] but also rejects addresses inside a page.
    pub const fn new(addr: usize) -> Option<Self> {
        if is_page_aligned(addr) {
            Self::containing(addr)
        } else {
            None
        }
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    /// The page `n` pages above this one, if it is still a user page.
    pub fn offset(self, n: usize) -> Option<Self> {
        n.checked_mul(PAGE_FRAME_SIZE)
            .and_then(|delta| self.0.checked_add(delta))
            .and_then(Self::new)
    }
}

impl fmt::Debug for UserPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserPage({:#x})", self.0)
    }
}

/// The physical address of a page frame from the user pool.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame(usize);

impl PhysFrame {
    pub(crate) const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> usize {
        self.0
    }
}

impl fmt::Debug for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysFrame({:#x})", self.0)
    }
}
