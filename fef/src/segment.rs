//! Named, file-backed segments that stand in for the named shared-memory
//! regions of the original system.
//!
//! Each segment is a single growable memory-mapped file living under a
//! store-wide temp directory, addressed by name. The store enforces the
//! single-allocation invariant a segment always had: `allocate` may only be
//! called once per name until the segment is freed, and `reallocate` always
//! goes through unload-truncate-reload rather than trying to grow the
//! mapping in place.
//!
//! Unlike the original, there is no ambient "current segment" global: every
//! operation takes a `&SegmentStore` (or the `&mut Segment` it hands back)
//! explicitly, so callers never have to reason about which segment is
//! "current" at a distance.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::error::{FefError, Result};

/// A single named, file-backed, growable memory mapping.
pub struct Segment {
    name: String,
    path: PathBuf,
    file: std::fs::File,
    mapping: Option<MmapMut>,
}

impl Segment {
    fn open_file(path: &Path) -> Result<std::fs::File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?)
    }

    /// Whether the backing file currently has nonzero length.
    pub fn exists(&self) -> Result<bool> {
        Ok(self.file.metadata()?.len() > 0)
    }

    /// Whether the segment is currently mapped into memory.
    pub fn loaded(&self) -> bool {
        self.mapping.is_some()
    }

    fn load(&mut self) -> Result<()> {
        // Safety: the backing file is exclusively owned by this `Segment`
        // for the lifetime of the mapping; nothing else truncates it.
        let mmap = unsafe { MmapMut::map_mut(&self.file) }
            .map_err(|_| FefError::SegmentAlloc(self.name.clone()))?;
        self.mapping = Some(mmap);
        Ok(())
    }

    /// Drops the mapping without touching the backing file, so a later
    /// `open_existing` or `allocate` can remap it.
    pub fn unload(&mut self) {
        self.mapping = None;
    }

    /// Maps the backing file at its current length, without truncating it.
    /// Used to reattach to a segment a previous `load` already populated,
    /// as opposed to `allocate`, which always (re)sizes first.
    pub fn open_existing(&mut self) -> Result<()> {
        if !self.loaded() {
            self.load()?;
        }
        Ok(())
    }

    /// Allocates `size` bytes for a segment that has never been allocated
    /// (or has been freed since). Mirrors the single-allocation assumption
    /// of the underlying store: calling this twice without an intervening
    /// `free` is a logic error in the caller, not a recoverable condition.
    pub fn allocate(&mut self, size: usize) -> Result<&mut [u8]> {
        if self.loaded() {
            return Err(FefError::InvariantViolated(format!(
                "segment '{}' already allocated",
                self.name
            )));
        }
        self.file.set_len(size as u64)?;
        self.load()?;
        Ok(self.mapping.as_mut().unwrap())
    }

    /// Resizes an already-loaded segment, unloading and reloading the
    /// mapping around the truncate the way the original's `realloc` does.
    pub fn reallocate(&mut self, size: usize) -> Result<&mut [u8]> {
        if !self.loaded() {
            return Err(FefError::SegmentNotLoaded(self.name.clone()));
        }
        self.unload();
        self.file.set_len(size as u64)?;
        self.load()?;
        Ok(self.mapping.as_mut().unwrap())
    }

    pub fn as_slice(&self) -> Result<&[u8]> {
        self.mapping
            .as_deref()
            .ok_or_else(|| FefError::SegmentNotLoaded(self.name.clone()))
    }

    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        self.mapping
            .as_deref_mut()
            .ok_or_else(|| FefError::SegmentNotLoaded(self.name.clone()))
    }

    pub fn size(&self) -> usize {
        self.mapping.as_ref().map_or(0, |m| m.len())
    }

    /// Unloads the mapping and deletes the backing file, matching the
    /// original's `free`: unload, then erase.
    pub fn free(&mut self) -> Result<()> {
        self.unload();
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// `/dev/shm` when it exists and is writable, since that keeps segments out
/// of page cache churn the way genuine shared memory would; otherwise falls
/// back to a `fef-segments` directory under the OS temp dir.
pub fn default_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        let probe = shm.join(".fef-write-probe");
        if std::fs::write(&probe, b"").is_ok() {
            let _ = std::fs::remove_file(&probe);
            return shm.join("fef-segments");
        }
    }
    std::env::temp_dir().join("fef-segments")
}

/// A registry of named segments, all backed by files under a single
/// directory. Threaded explicitly through the writer and reader instead of
/// living behind a process-global, as the Design Notes call for.
pub struct SegmentStore {
    directory: PathBuf,
    segments: Mutex<HashMap<String, Segment>>,
}

impl SegmentStore {
    /// Opens a store rooted at `directory`, creating it if necessary.
    pub fn new(directory: impl Into<PathBuf>) -> Result<SegmentStore> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(SegmentStore {
            directory,
            segments: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    /// Returns the segment for `name`, creating its backing file (but not
    /// allocating it) if this is the first time it has been seen, mirroring
    /// `createOrGetMemorySegment`'s `try_emplace`.
    pub fn create_or_get(&self, name: &str) -> Result<()> {
        let mut segments = self.segments.lock();
        if segments.contains_key(name) {
            return Ok(());
        }
        let path = self.path_for(name);
        let file = Segment::open_file(&path)?;
        segments.insert(
            name.to_string(),
            Segment {
                name: name.to_string(),
                path,
                file,
                mapping: None,
            },
        );
        Ok(())
    }

    /// Runs `f` with exclusive access to the named segment, creating it
    /// first if it does not yet exist.
    pub fn with_segment<R>(&self, name: &str, f: impl FnOnce(&mut Segment) -> Result<R>) -> Result<R> {
        self.create_or_get(name)?;
        let mut segments = self.segments.lock();
        let segment = segments
            .get_mut(name)
            .expect("segment was just created or already present");
        f(segment)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.segments
            .lock()
            .get(name)
            .map_or(false, Segment::loaded)
    }

    /// Drops the in-registry entry for `name` without touching the file on
    /// disk, used after `free` has already deleted it.
    pub fn forget(&self, name: &str) {
        self.segments.lock().remove(name);
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, SegmentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn allocate_then_reallocate_preserves_prefix() {
        let (_dir, store) = temp_store();
        store
            .with_segment("a", |seg| {
                let bytes = seg.allocate(16)?;
                bytes[0] = 7;
                bytes[1] = 9;
                Ok(())
            })
            .unwrap();

        store
            .with_segment("a", |seg| {
                let bytes = seg.reallocate(32)?;
                assert_eq!(bytes.len(), 32);
                assert_eq!(bytes[0], 7);
                assert_eq!(bytes[1], 9);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn double_allocate_is_rejected() {
        let (_dir, store) = temp_store();
        store
            .with_segment("a", |seg| seg.allocate(16).map(|_| ()))
            .unwrap();

        let err = store.with_segment("a", |seg| seg.allocate(16).map(|_| ()));
        assert!(err.is_err());
    }

    #[test]
    fn free_removes_backing_file() {
        let (_dir, store) = temp_store();
        store
            .with_segment("a", |seg| seg.allocate(16).map(|_| ()))
            .unwrap();
        let path = store.directory().join("a");
        assert!(path.exists());

        store.with_segment("a", |seg| seg.free()).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn unknown_segment_is_created_on_first_use() {
        let (_dir, store) = temp_store();
        assert!(!store.is_loaded("fresh"));
        store
            .with_segment("fresh", |seg| seg.allocate(8).map(|_| ()))
            .unwrap();
        assert!(store.is_loaded("fresh"));
    }
}
