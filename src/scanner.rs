//! The engine orchestrating scans across regions.

use std::{collections::VecDeque, ops, path::PathBuf, sync::Arc};

use byteorder::{ByteOrder as _, NativeEndian};
use parking_lot::Mutex;

use crate::{
    address::Address,
    error::Error,
    pool::WorkerPool,
    predicate::{comparator, ElementType, ScanKind},
    process::{ProcessMemory, ProtectFlags},
    region::{MemoryRegion, RegionIter},
    scan::{Scan, ScanEntry},
    snapshot::SnapshotStore,
};

/// Configuration for a [`Scanner`].
pub struct ScannerBuilder {
    path: PathBuf,
    workers: usize,
}

impl ScannerBuilder {
    /// Where the snapshot dump lives. Defaults to `dump.bin`.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Number of worker threads used by the first scan. Defaults to eight.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Build the scanner, creating its backing file.
    pub fn build(self) -> Result<Scanner, Error> {
        Ok(Scanner {
            store: Arc::new(SnapshotStore::create(self.path)?),
            pool: WorkerPool::new(self.workers),
            process: None,
        })
    }
}

impl Default for ScannerBuilder {
    fn default() -> Self {
        ScannerBuilder {
            path: PathBuf::from("dump.bin"),
            workers: 8,
        }
    }
}

/// A memory scanner over one attached target process.
///
/// Owns the snapshot store and the worker pool; dropping the scanner drops
/// both and removes the dump file.
pub struct Scanner {
    store: Arc<SnapshotStore>,
    pool: WorkerPool,
    process: Option<Arc<dyn ProcessMemory>>,
}

impl Scanner {
    pub fn builder() -> ScannerBuilder {
        ScannerBuilder::default()
    }

    /// Build a scanner with default configuration.
    pub fn new() -> Result<Scanner, Error> {
        Self::builder().build()
    }

    /// Attach to a target process. Replaces any previous target.
    pub fn attach(&mut self, process: Arc<dyn ProcessMemory>) {
        self.process = Some(process);
    }

    pub fn detach(&mut self) {
        self.process = None;
    }

    /// The snapshot store backing this scanner.
    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Enumerate the committed regions of the window matching `protect`.
    fn regions(
        &self,
        window: ops::Range<Address>,
        protect: ProtectFlags,
    ) -> Result<RegionIter, Error> {
        let process = self.process.clone().ok_or(Error::NotAttached)?;
        Ok(RegionIter::new(
            process,
            Arc::clone(&self.store),
            window,
            protect,
        ))
    }

    /// Filter every aligned element of every matching region in the window.
    ///
    /// Regions are snapshotted and searched in parallel on the worker pool.
    /// Regions whose memory cannot be read are skipped; a failure of the
    /// snapshot store aborts the whole call. The returned scans are sorted
    /// ascending by region base and each carries at least one result,
    /// except for `unknown_value` scans which are valid without results.
    pub fn first_scan(
        &self,
        window: ops::Range<Address>,
        protect: ProtectFlags,
        kind: ScanKind,
        ty: ElementType,
        ref1: u64,
        ref2: Option<u64>,
    ) -> anyhow::Result<Vec<Scan>> {
        let cmp = comparator(kind, ty);
        let elem_size = ty.size();

        let mut handles = Vec::new();

        for region in self.regions(window, protect)? {
            let cmp = Arc::clone(&cmp);
            let mut scan = Scan::new(region, kind, elem_size)?;

            handles.push(self.pool.submit(move || -> anyhow::Result<Scan> {
                if !scan.region_mut().read_memory()? {
                    return Ok(scan);
                }

                if kind == ScanKind::UnknownValue {
                    scan.set_valid();
                    return Ok(scan);
                }

                scan.search_value(&cmp, ref1, ref2);
                Ok(scan)
            }));
        }

        let submitted = handles.len();
        let mut results = Vec::new();

        for handle in handles {
            match handle.wait() {
                Some(Ok(scan)) if scan.is_valid() => results.push(scan),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                // The pool only abandons tasks while shutting down.
                None => {}
            }
        }

        results.sort_by_key(|s| s.region().base());

        log::debug!(
            "first scan: {} of {} regions produced results",
            results.len(),
            submitted
        );

        Ok(results)
    }

    /// Intersect a fresh snapshot of the window with the prior scan list.
    ///
    /// Walks new regions and prior scans in tandem by address. Each new
    /// region is consumed by the first prior scan it overlaps; the prior
    /// index deliberately stays put so one prior scan can be matched by
    /// several new regions when the target's layout split it up. Surviving
    /// scans replace `scans`, sorted ascending by region base.
    pub fn next_scan(
        &self,
        window: ops::Range<Address>,
        protect: ProtectFlags,
        kind: ScanKind,
        ty: ElementType,
        scans: &mut Vec<Scan>,
        ref1: u64,
        ref2: Option<u64>,
    ) -> anyhow::Result<()> {
        let cmp = comparator(kind, ty);
        let elem_size = ty.size();

        let mut regions: VecDeque<MemoryRegion> = self.regions(window, protect)?.collect();
        let mut results = Vec::new();
        let mut idx = 0;

        while idx < scans.len() {
            let front = match regions.front() {
                Some(front) => front,
                None => break,
            };
            let prev = &scans[idx];

            let r_start = front.base().into_u64();
            let r_end = r_start + front.size() as u64;
            let p_start = prev.region().base().into_u64();
            let p_end = p_start + prev.region().size() as u64;

            if r_end <= p_start {
                regions.pop_front();
                continue;
            }

            if p_end <= r_start {
                idx += 1;
                continue;
            }

            // Overlap: consume the new region.
            let region = match regions.pop_front() {
                Some(region) => region,
                None => break,
            };
            let mut scan = Scan::new(region, kind, elem_size)?;

            if !scan.region_mut().read_memory()? {
                continue;
            }

            let ov_start = r_start.max(p_start);
            let ov_end = r_end.min(p_end);
            let overlap = (ov_end - ov_start) as usize;
            let r_off = (ov_start - r_start) as usize;
            let p_off = (ov_start - p_start) as usize;

            let mut admitted = Vec::new();

            if prev.kind() == ScanKind::UnknownValue {
                // The prior snapshot is the baseline: every aligned element
                // in the overlap is compared old against new, and the
                // caller's first reference plays no part.
                let old = prev.region().raw_bytes();
                let new = scan.region().raw_bytes();

                if old.len() >= p_off + overlap {
                    let mut i = 0;

                    while i + elem_size <= overlap {
                        let old_value =
                            NativeEndian::read_uint(&old[p_off + i..p_off + i + elem_size], elem_size);
                        let new_value =
                            NativeEndian::read_uint(&new[r_off + i..r_off + i + elem_size], elem_size);

                        if cmp(new_value, old_value, ref2) {
                            admitted.push(ScanEntry {
                                value: new_value,
                                snapshot_value: new_value,
                                element_index: (r_off + i) / elem_size,
                            });
                        }

                        i += elem_size;
                    }
                }
            } else {
                let new = scan.region().raw_bytes();

                for entry in prev.results() {
                    let e_addr = p_start + (entry.element_index * elem_size) as u64;

                    if e_addr < ov_start || e_addr + elem_size as u64 > ov_end {
                        continue;
                    }

                    // The element keeps its absolute address; its index is
                    // rebased onto the new region.
                    let new_index = ((e_addr - r_start) / elem_size as u64) as usize;
                    let offset = new_index * elem_size;
                    let value =
                        NativeEndian::read_uint(&new[offset..offset + elem_size], elem_size);

                    let reference = if kind.compares_snapshot() {
                        entry.snapshot_value
                    } else {
                        ref1
                    };

                    if cmp(value, reference, ref2) {
                        admitted.push(ScanEntry {
                            value,
                            snapshot_value: value,
                            element_index: new_index,
                        });
                    }
                }
            }

            if !admitted.is_empty() {
                scan.set_valid();

                for entry in admitted {
                    scan.add_result(entry);
                }

                results.push(scan);
            }
        }

        results.sort_by_key(|s| s.region().base());

        log::debug!("next scan: {} scans survive", results.len());

        *scans = results;
        Ok(())
    }
}

static GLOBAL: Mutex<Option<Scanner>> = Mutex::new(None);

/// The process-wide scanner instance.
///
/// All state stays private behind a lock; access is serialised through
/// [`with`].
pub mod global {
    use super::{Scanner, ScannerBuilder, GLOBAL};
    use crate::error::Error;

    /// Initialise the process-wide scanner with default configuration.
    ///
    /// Keeps an already initialised instance.
    pub fn init() -> Result<(), Error> {
        init_with(Scanner::builder())
    }

    /// Initialise the process-wide scanner from `builder`.
    pub fn init_with(builder: ScannerBuilder) -> Result<(), Error> {
        let mut guard = GLOBAL.lock();

        if guard.is_none() {
            *guard = Some(builder.build()?);
        }

        Ok(())
    }

    /// Run `f` against the process-wide scanner, if initialised.
    pub fn with<T>(f: impl FnOnce(&mut Scanner) -> T) -> Option<T> {
        GLOBAL.lock().as_mut().map(f)
    }

    /// Drop the process-wide scanner, removing its dump file.
    pub fn teardown() {
        GLOBAL.lock().take();
    }
}
