//! The seam towards the operating system.
//!
//! The concrete primitives for querying and reading another process's
//! virtual memory are not part of this crate; callers provide them through
//! [`ProcessMemory`].

use crate::address::{Address, AddressRange};

/// Opaque protection bits, passed through from the querying side.
pub type ProtectFlags = u32;

/// The state of a queried memory descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryState {
    Commit,
    Free,
    Reserve,
}

impl MemoryState {
    /// Test if the memory is committed (i.e. backed and readable in principle).
    pub fn is_commit(self) -> bool {
        matches!(self, MemoryState::Commit)
    }
}

/// The kind of backing a queried memory descriptor has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    None,
    Image,
    Mapped,
    Private,
}

/// One virtual-memory descriptor of the target process.
#[derive(Debug, Clone, Copy)]
pub struct RegionInfo {
    pub range: AddressRange,
    pub protect: ProtectFlags,
    pub state: MemoryState,
    pub ty: MemoryType,
}

/// Access to the address space of a target process.
pub trait ProcessMemory: Send + Sync {
    /// One-shot query for the virtual-memory descriptor containing `address`.
    ///
    /// Returning `None` ends enumeration; there is no descriptor at or beyond
    /// the address.
    fn virtual_query(&self, address: Address) -> Option<RegionInfo>;

    /// Bulk-read target memory at `address` into `buf`, returning the number
    /// of bytes actually read.
    fn read_memory(&self, address: Address, buf: &mut [u8]) -> anyhow::Result<usize>;
}
