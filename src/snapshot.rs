//! The store that snapshots of process memory are written through.

use std::{path::PathBuf, slice, sync::Arc};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::{
    backing_file::{BackingFile, Mapping},
    error::Error,
};

/// One snapshot's byte range inside a live mapping.
///
/// The span holds its mapping alive; the bytes it points at stay addressable
/// until the span and every other holder of the mapping are gone.
pub struct Span {
    map: Arc<Mapping>,
    ptr: *mut u8,
    len: usize,
}

// Each span is the exclusive owner of its byte range; the store carves
// ranges out of a mapping at most once.
unsafe impl Send for Span {}
unsafe impl Sync for Span {}

impl Span {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The snapshot bytes.
    pub fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Exclusive access for re-reading the snapshot in place.
    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// The mapping backing this span.
    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.map
    }
}

/// Façade over the backing file used by the scanner.
///
/// Owns the file plus the set of mappings that have been handed out and are
/// still alive, deduplicated by base pointer so consecutive writes into the
/// current mapping count as one reference.
pub struct SnapshotStore {
    file: BackingFile,
    maps: Mutex<HashMap<usize, Arc<Mapping>>>,
}

impl SnapshotStore {
    /// Create a store over a fresh backing file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<SnapshotStore, Error> {
        Ok(SnapshotStore {
            file: BackingFile::create(path)?,
            maps: Mutex::new(HashMap::new()),
        })
    }

    /// Append a copy of `src`, returning the span holding it.
    pub fn write(&self, src: &[u8]) -> Result<Span, Error> {
        self.span(Some(src), src.len())
    }

    /// Append `n` zero bytes, returning the span holding them.
    pub fn allocate_zero(&self, n: usize) -> Result<Span, Error> {
        self.span(None, n)
    }

    fn span(&self, src: Option<&[u8]>, n: usize) -> Result<Span, Error> {
        let (map, ptr) = self.file.write(src, n)?;

        self.maps
            .lock()
            .entry(map.as_ptr() as usize)
            .or_insert_with(|| Arc::clone(&map));

        Ok(Span { map, ptr, len: n })
    }

    /// Number of distinct live mappings handed out so far.
    pub fn live_mappings(&self) -> usize {
        self.maps.lock().len()
    }

    /// The underlying backing file.
    pub fn file(&self) -> &BackingFile {
        &self.file
    }
}

#[cfg(test)]
mod tests {
    use super::SnapshotStore;

    fn store() -> (tempfile::TempDir, SnapshotStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::create(dir.path().join("dump.bin")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_snapshot_stability_across_growth() {
        let (_dir, store) = store();

        let payload = (0..3000).map(|i| (i * 7 % 256) as u8).collect::<Vec<_>>();
        let span = store.write(&payload).unwrap();

        // Push the file through multiple growths and remaps.
        let mut later = Vec::new();
        for i in 0..6 {
            later.push(store.write(&vec![i as u8; 32 * 1024]).unwrap());
        }

        assert_eq!(span.bytes(), &payload[..]);

        for (i, span) in later.iter().enumerate() {
            assert!(span.bytes().iter().all(|b| *b == i as u8));
        }
    }

    #[test]
    fn test_allocate_zero() {
        let (_dir, store) = store();

        let span = store.allocate_zero(4096).unwrap();
        assert_eq!(span.len(), 4096);
        assert!(span.bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_mapping_identity_dedup() {
        let (_dir, store) = store();

        // Small writes land in the same current mapping and must not pile up
        // extra references.
        store.write(&[1, 2, 3]).unwrap();
        store.write(&[4, 5, 6]).unwrap();
        store.write(&[7, 8, 9]).unwrap();
        assert_eq!(store.live_mappings(), 1);

        // A write that outgrows the file creates a second mapping.
        store.allocate_zero(64 * 1024).unwrap();
        assert_eq!(store.live_mappings(), 2);
    }

    #[test]
    fn test_spans_can_be_read_concurrently() {
        let (_dir, store) = store();

        let a = store.write(&[0xAA; 1000]).unwrap();
        let b = store.write(&[0xBB; 1000]).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| assert!(a.bytes().iter().all(|v| *v == 0xAA)));
            s.spawn(|| assert!(b.bytes().iter().all(|v| *v == 0xBB)));
        });
    }
}
