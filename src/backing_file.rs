//! The append-only file that snapshots are spilled into.

use std::{fs, io, ops, path::PathBuf, ptr, sync::Arc};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::error::Error;

/// Growth quantum of the backing file.
pub const PAGE_SIZE: u64 = 0x1000;

/// Round up to the next multiple of [`PAGE_SIZE`].
fn page_ceil(n: u64) -> u64 {
    (n + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE
}

/// A scoped memory mapping over a byte range of the backing file.
///
/// Movable, not clonable; the underlying mapping is released when the last
/// [`Arc`] holding it drops. Dereferences to the mapped bytes.
pub struct Mapping {
    map: MmapMut,
    /// First mapped byte of the requested range. Mapping offsets must sit on
    /// a page boundary, so the request is aligned down and re-based here.
    base: *mut u8,
    delta: usize,
}

// Writes into a mapping only ever go through disjoint spans whose ranges are
// carved out under the file lock, so concurrent access never aliases.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    pub(crate) fn map(file: &fs::File, offset: u64, len: usize) -> Result<Mapping, Error> {
        let aligned = offset - offset % PAGE_SIZE;
        let delta = (offset - aligned) as usize;

        let mut map = unsafe {
            MmapOptions::new()
                .offset(aligned)
                .len(len + delta)
                .map_mut(file)
        }
        .map_err(|source| Error::MappingFailed {
            offset,
            size: len,
            source,
        })?;

        let base = unsafe { map.as_mut_ptr().add(delta) };

        Ok(Mapping { map, base, delta })
    }

    /// Number of mapped bytes, excluding the alignment slack.
    pub fn len(&self) -> usize {
        self.map.len() - self.delta
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }
}

impl ops::Deref for Mapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map[self.delta..]
    }
}

struct Inner {
    file: fs::File,
    path: PathBuf,
    /// Logical file length, always a multiple of [`PAGE_SIZE`].
    len: u64,
    /// Global write offset, never exceeds `len`.
    offset: u64,
    valid: bool,
    /// The mapping that accepts writes until the next growth.
    current: Option<Arc<Mapping>>,
    /// Write offset local to the current mapping.
    map_offset: usize,
}

impl Inner {
    /// Extend the file so another `n` bytes fit, then remap the tail.
    ///
    /// Doubling keeps the number of remaps logarithmic in the bytes written.
    /// Prior mappings stay valid; growth only ever extends the file.
    fn grow(&mut self, n: usize) -> Result<(), Error> {
        let required = self
            .len
            .checked_add(n as u64)
            .and_then(|v| v.checked_mul(2))
            .ok_or_else(|| {
                self.valid = false;
                Error::StoreUnavailable(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "file length overflow",
                ))
            })?;

        // A zero-length file cannot be mapped, so never shrink below one page.
        let new_len = page_ceil(required).max(PAGE_SIZE);

        if let Err(source) = self.file.set_len(new_len) {
            self.valid = false;
            return Err(Error::StoreUnavailable(source));
        }

        log::debug!(
            "growing backing file {} from {} to {} bytes",
            self.path.display(),
            self.len,
            new_len
        );
        self.len = new_len;

        match Mapping::map(&self.file, self.offset, (self.len - self.offset) as usize) {
            Ok(map) => {
                self.current = Some(Arc::new(map));
                self.map_offset = 0;
                Ok(())
            }
            Err(e) => {
                self.valid = false;
                Err(e)
            }
        }
    }
}

/// An on-disk byte store that only ever grows.
///
/// Writers are serialised by an internal lock; the mappings it hands out are
/// immutable from the outside and may be read concurrently. The file is
/// removed again when the store drops.
pub struct BackingFile {
    inner: Mutex<Inner>,
}

impl BackingFile {
    /// Create the backing file, replacing anything already at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<BackingFile, Error> {
        let path = path.into();

        let file = fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(Error::StoreUnavailable)?;

        Ok(BackingFile {
            inner: Mutex::new(Inner {
                file,
                path,
                len: 0,
                offset: 0,
                valid: true,
                current: None,
                map_offset: 0,
            }),
        })
    }

    /// Append `n` bytes, copied from `src` or zero-filled when `src` is
    /// `None`.
    ///
    /// Returns the current mapping together with a pointer to the start of
    /// the just-written bytes inside it. The mapping handle keeps those bytes
    /// alive for as long as the caller holds it.
    pub fn write(&self, src: Option<&[u8]>, n: usize) -> Result<(Arc<Mapping>, *mut u8), Error> {
        if let Some(src) = src {
            debug_assert_eq!(src.len(), n);
        }

        let mut inner = self.inner.lock();

        if !inner.valid {
            return Err(Error::StoreUnavailable(io::Error::new(
                io::ErrorKind::Other,
                "backing file previously failed",
            )));
        }

        let fits = inner
            .offset
            .checked_add(n as u64)
            .map_or(false, |end| end <= inner.len);

        if !fits || inner.current.is_none() {
            inner.grow(n)?;
        }

        let current = match &inner.current {
            Some(map) => Arc::clone(map),
            None => {
                return Err(Error::StoreUnavailable(io::Error::new(
                    io::ErrorKind::Other,
                    "no current mapping",
                )))
            }
        };

        let dst = unsafe { current.base().add(inner.map_offset) };

        // The destination range [dst, dst + n) lies inside the current
        // mapping and past every previously handed out span.
        unsafe {
            match src {
                Some(src) => ptr::copy_nonoverlapping(src.as_ptr(), dst, n),
                None => ptr::write_bytes(dst, 0, n),
            }
        }

        inner.map_offset += n;
        inner.offset += n as u64;

        Ok((current, dst))
    }

    /// Current logical length of the file.
    pub fn len(&self) -> u64 {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current global write offset.
    pub fn write_offset(&self) -> u64 {
        self.inner.lock().offset
    }

    /// Test if the file is still usable for writes.
    pub fn is_valid(&self) -> bool {
        self.inner.lock().valid
    }
}

impl Drop for BackingFile {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.valid = false;
        inner.current = None;

        // The dump has no value across sessions; failures to unlink are not
        // actionable here.
        let _ = fs::remove_file(&inner.path);
    }
}

#[cfg(test)]
mod tests {
    use super::{page_ceil, BackingFile, PAGE_SIZE};
    use std::slice;

    fn read_back(ptr: *mut u8, len: usize) -> Vec<u8> {
        unsafe { slice::from_raw_parts(ptr, len) }.to_vec()
    }

    #[test]
    fn test_page_ceil() {
        assert_eq!(page_ceil(0), 0);
        assert_eq!(page_ceil(1), PAGE_SIZE);
        assert_eq!(page_ceil(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_ceil(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_growth_is_append_only_and_page_aligned() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = BackingFile::create(dir.path().join("dump.bin")).unwrap();

        let mut last_len = 0;

        for n in [3000usize, 3000, 10000] {
            let payload = (0..n).map(|i| (i % 251) as u8).collect::<Vec<_>>();
            let (_map, ptr) = file.write(Some(&payload), n).unwrap();

            let len = file.len();
            assert!(len >= last_len, "length shrank: {} -> {}", last_len, len);
            assert_eq!(len % PAGE_SIZE, 0);
            assert!(file.write_offset() <= len);
            assert_eq!(read_back(ptr, n), payload);

            last_len = len;
        }
    }

    #[test]
    fn test_spans_survive_growth() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = BackingFile::create(dir.path().join("dump.bin")).unwrap();

        let first = vec![0xAB; 3000];
        let (map_a, ptr_a) = file.write(Some(&first), first.len()).unwrap();

        // Force several growths past the first mapping.
        for _ in 0..4 {
            file.write(None, 64 * 1024).unwrap();
        }

        assert_eq!(read_back(ptr_a, first.len()), first);
        assert!(map_a.len() >= first.len());
    }

    #[test]
    fn test_zero_fill_write() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = BackingFile::create(dir.path().join("dump.bin")).unwrap();

        let (_map, ptr) = file.write(None, 512).unwrap();
        assert!(read_back(ptr, 512).iter().all(|b| *b == 0));
    }

    #[test]
    fn test_file_removed_on_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dump.bin");

        let file = BackingFile::create(&path).unwrap();
        file.write(Some(b"abc"), 3).unwrap();
        assert!(path.exists());

        drop(file);
        assert!(!path.exists());
    }
}
