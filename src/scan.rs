//! A typed filter over one memory region and its results.

use byteorder::{ByteOrder as _, NativeEndian};

use crate::{
    error::Error,
    predicate::{Comparator, ScanKind},
    region::MemoryRegion,
};

/// One accepted element.
///
/// `value` tracks the most recently observed bytes; `snapshot_value` keeps
/// the value from when the entry was first admitted so later passes can
/// still compare against the original. `element_index` counts elements of
/// the scan's size from the region base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanEntry {
    pub value: u64,
    pub snapshot_value: u64,
    pub element_index: usize,
}

/// A scan over a single region.
pub struct Scan {
    region: MemoryRegion,
    kind: ScanKind,
    elem_size: usize,
    valid: bool,
    results: Vec<ScanEntry>,
}

impl std::fmt::Debug for Scan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scan")
            .field("kind", &self.kind)
            .field("elem_size", &self.elem_size)
            .field("valid", &self.valid)
            .field("results", &self.results)
            .finish()
    }
}

impl Scan {
    /// Construct a scan over `region` with the given element size.
    pub fn new(region: MemoryRegion, kind: ScanKind, elem_size: usize) -> Result<Scan, Error> {
        if !matches!(elem_size, 1 | 2 | 4 | 8) {
            return Err(Error::InvalidElementSize(elem_size));
        }

        Ok(Scan {
            region,
            kind,
            elem_size,
            valid: false,
            results: Vec::new(),
        })
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut MemoryRegion {
        &mut self.region
    }

    pub fn kind(&self) -> ScanKind {
        self.kind
    }

    pub fn element_size(&self) -> usize {
        self.elem_size
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Mark the scan as carrying results worth keeping.
    pub fn set_valid(&mut self) {
        self.valid = true;
    }

    pub fn results(&self) -> &[ScanEntry] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Append an externally produced entry.
    pub fn add_result(&mut self, entry: ScanEntry) {
        self.results.push(entry);
    }

    /// Filter every aligned element of the snapshot through `cmp`.
    ///
    /// Clears any prior results. The scan becomes valid iff at least one
    /// element matched; the hit count is returned.
    pub fn search_value(&mut self, cmp: &Comparator, ref1: u64, ref2: Option<u64>) -> u64 {
        self.results.clear();

        let elem_size = self.elem_size;
        let mut count = 0;

        for (i, value) in self.region.elements_by_size(elem_size).enumerate() {
            if cmp(value, ref1, ref2) {
                self.results.push(ScanEntry {
                    value,
                    snapshot_value: value,
                    element_index: i,
                });
                count += 1;
            }
        }

        self.valid = count > 0;
        count
    }

    /// Re-read the region and refresh each entry's current value.
    ///
    /// `snapshot_value` is left untouched so relative predicates keep their
    /// original baseline.
    pub fn update(&mut self) -> Result<(), Error> {
        if self.results.is_empty() {
            return Ok(());
        }

        self.region.read_memory()?;

        let elem_size = self.elem_size;
        let bytes = self.region.raw_bytes();

        for entry in &mut self.results {
            let offset = entry.element_index * elem_size;

            if offset + elem_size <= bytes.len() {
                entry.value = NativeEndian::read_uint(&bytes[offset..offset + elem_size], elem_size);
            }
        }

        Ok(())
    }
}
