//! Memory regions of the target process and their enumeration.

use std::{ops, sync::Arc};

use byteorder::{ByteOrder as _, NativeEndian};

use crate::{
    address::{Address, AddressRange},
    error::Error,
    process::{MemoryType, ProcessMemory, ProtectFlags, RegionInfo},
    snapshot::{SnapshotStore, Span},
};

/// One committed virtual-address range of the target process, together with
/// a snapshot of its bytes once [`read_memory`](MemoryRegion::read_memory)
/// has run.
pub struct MemoryRegion {
    info: RegionInfo,
    process: Arc<dyn ProcessMemory>,
    store: Arc<SnapshotStore>,
    snapshot: Option<Span>,
}

impl MemoryRegion {
    pub fn new(
        info: RegionInfo,
        process: Arc<dyn ProcessMemory>,
        store: Arc<SnapshotStore>,
    ) -> MemoryRegion {
        MemoryRegion {
            info,
            process,
            store,
            snapshot: None,
        }
    }

    /// Base address of the region in the target process.
    pub fn base(&self) -> Address {
        self.info.range.base
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> usize {
        self.info.range.size as usize
    }

    /// Test if any of the given protection bits are set.
    pub fn has_protection(&self, mask: ProtectFlags) -> bool {
        self.info.protect & mask != 0
    }

    pub fn is_committed(&self) -> bool {
        self.info.state.is_commit()
    }

    pub fn is_memmapped(&self) -> bool {
        matches!(self.info.ty, MemoryType::Mapped)
    }

    /// Capture the region's bytes into its snapshot.
    ///
    /// The snapshot span is allocated on the first call only; later calls
    /// re-read into the same storage. Returns `Ok(false)` when the target
    /// refuses the read or comes up short, in which case the span stays
    /// allocated (zero-filled on the first call) and the region is skipped
    /// by the scan engine.
    pub fn read_memory(&mut self) -> Result<bool, Error> {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.store.allocate_zero(self.size())?);
        }

        let base = self.base();
        let size = self.size();

        let span = match self.snapshot.as_mut() {
            Some(span) => span,
            None => return Ok(false),
        };

        match self.process.read_memory(base, span.bytes_mut()) {
            Ok(n) if n == size => Ok(true),
            Ok(n) => {
                log::trace!("short read at {}: {} of {} bytes", base, n, size);
                Ok(false)
            }
            Err(e) => {
                log::trace!("failed to read {} bytes at {}: {}", size, base, e);
                Ok(false)
            }
        }
    }

    /// The snapshot bytes, empty until [`read_memory`](Self::read_memory)
    /// has allocated them.
    pub fn raw_bytes(&self) -> &[u8] {
        self.snapshot.as_ref().map(Span::bytes).unwrap_or(&[])
    }

    /// Iterate the snapshot as `size / k` elements of `k` bytes each,
    /// zero-extended into 64-bit registers. The trailing remainder is
    /// dropped.
    pub fn elements_by_size(&self, k: usize) -> impl Iterator<Item = u64> + '_ {
        self.raw_bytes()
            .chunks_exact(k)
            .map(move |chunk| NativeEndian::read_uint(chunk, k))
    }
}

/// Iterator over the committed regions that fall inside a requested window.
///
/// Walks the target's virtual-memory descriptors in ascending order, clips
/// each to the window, and yields those that are committed, not backed by a
/// mapped file, and carry at least one bit of the protection mask. Ends
/// silently when the query fails.
pub struct RegionIter {
    process: Arc<dyn ProcessMemory>,
    store: Arc<SnapshotStore>,
    cursor: u64,
    lo: u64,
    hi: u64,
    mask: ProtectFlags,
}

impl RegionIter {
    pub fn new(
        process: Arc<dyn ProcessMemory>,
        store: Arc<SnapshotStore>,
        window: ops::Range<Address>,
        mask: ProtectFlags,
    ) -> RegionIter {
        RegionIter {
            process,
            store,
            cursor: window.start.into_u64(),
            lo: window.start.into_u64(),
            hi: window.end.into_u64(),
            mask,
        }
    }
}

impl Iterator for RegionIter {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor < self.hi {
            let info = self.process.virtual_query(Address::new(self.cursor))?;
            let d_end = info.range.end();

            // NB: advance to the descriptor's original end, not the clipped
            // one, so clipping never causes a re-visit.
            if d_end <= self.cursor {
                return None;
            }

            self.cursor = d_end;

            let base = info.range.base.into_u64().max(self.lo);
            let end = d_end.min(self.hi);

            if end <= base {
                continue;
            }

            let clipped = RegionInfo {
                range: AddressRange::new(Address::new(base), end - base),
                ..info
            };

            let region = MemoryRegion::new(
                clipped,
                Arc::clone(&self.process),
                Arc::clone(&self.store),
            );

            if region.is_committed() && !region.is_memmapped() && region.has_protection(self.mask) {
                return Some(region);
            }
        }

        None
    }
}
