//! Demand paging for KidneyOS user processes.
//!
//! Every process has a page-state table recording where each of its pages
//! lives. User frames come from a fixed pool tracked by the frame table; when
//! the pool runs dry a victim is picked by the clock and written to swap if it
//! was modified. The trap handler hands page faults to
//! [`mem::page_fault::resolve`], which puts the page back together.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod config;
pub mod error;
pub mod file;
pub mod mem;
pub mod paging;
pub mod process;
pub mod swapping;
pub mod sync;
pub mod system;

#[cfg(test)]
mod testing;

pub use config::VmConfig;
pub use error::{Result, VmError};
pub use mem::page_fault::Access;
pub use system::VirtualMemory;
