use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// The topmost user page, directly below the kernel. The first page of every
/// process stack lives here and is never chosen for eviction.
pub const USER_STACK_PAGE: usize = OFFSET - PAGE_FRAME_SIZE;

/// Physical address of the first frame of the user pool. Everything below is
/// left to the kernel image, its heap and the bootstrap allocator.
pub const USER_POOL_BASE: usize = 16 * MB;

/// Number of frames in the user pool when nothing else is configured.
pub const USER_POOL_FRAMES: usize = 256;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        assert_eq!(page_round_down(0x1fff), 0x1000);
        assert_eq!(page_offset(0x1fff), 0xfff);
        assert!(is_page_aligned(0x2000));
        assert!(!is_page_aligned(0x2001));
    }

    #[test]
    fn test_stack_page_is_user() {
        assert!(is_user_vaddr(USER_STACK_PAGE));
        assert!(!is_user_vaddr(USER_STACK_PAGE + PAGE_FRAME_SIZE));
    }
}
