use crate::file::FileError;

/// Why a request into the virtual memory manager was refused.
///
/// Every variant is an invalid reference on the caller's part: the fault
/// dispatcher treats any of them as a reason to terminate the process. Resource
/// exhaustion and broken invariants are not represented here; they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("no page installed at {0:#x}")]
    NotMapped(usize),
    #[error("{0:#x} is a kernel address")]
    KernelAddress(usize),
    #[error("write to read-only page {0:#x}")]
    ReadOnly(usize),
    #[error("page {0:#x} is already installed")]
    AlreadyInstalled(usize),
    #[error("{0:#x} is not page aligned")]
    Unaligned(usize),
    #[error("file offset {0:#x} runs past the end of the file's address range")]
    FileOffset(u64),
    #[error("mapping at {0:#x} overlaps an existing page")]
    Overlap(usize),
    #[error("could not install a hardware mapping for {0:#x}")]
    MapFailed(usize),
    #[error("short read for page {page:#x}: expected {expected} bytes, got {got}")]
    ShortRead {
        page: usize,
        expected: usize,
        got: usize,
    },
    #[error("backing file: {0}")]
    File(#[from] FileError),
}

pub type Result<T> = core::result::Result<T, VmError>;
