//! Lazy, allocation-free reading of Flat Expression Format images produced
//! by [`fef::writer`].
//!
//! [`FefReader::open`] maps an already-loaded segment read-only by name,
//! mirroring the way `decodeme::ProfilingData::new` opens a named file
//! stem; [`FefReader::from_bytes`] wraps already-in-memory bytes, the way
//! `decodeme::EventDecoder::from_separate_buffers` does for tests and for
//! embedders who mapped the segment themselves through `fef::segment`.
//!
//! Once open, [`FefReader::root`] hands out a [`cursor::Cursor`] — the type
//! that does all the actual navigation.
#![deny(warnings)]

#[macro_use]
extern crate log;

pub mod cursor;

use std::fs::File;
use std::path::Path;

use fef::error::{FefError, Result};
use fef::layout;

pub use crate::cursor::{Cursor, Scalar, StringView};

fn read_counts(bytes: &[u8]) -> Result<(u64, u64)> {
    if bytes.len() < layout::HEADER_SIZE {
        return Err(FefError::InvariantViolated(
            "image shorter than the FEF header".to_string(),
        ));
    }
    Ok((
        layout::read_argument_count(bytes),
        layout::read_expression_count(bytes),
    ))
}

enum Backing {
    Mapped(memmap2::Mmap),
    Owned(Vec<u8>),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Mapped(mmap) => mmap,
            Backing::Owned(bytes) => bytes,
        }
    }
}

/// A read-only view of one frozen FEF image, either mapped from a named
/// segment file or owned in memory.
pub struct FefReader {
    backing: Backing,
    argument_count: u64,
    expression_count: u64,
}

impl FefReader {
    /// Maps `directory/segment_name` read-only. The segment must already
    /// have been populated by a prior `fef::writer::load`; this crate never
    /// writes to it.
    pub fn open(directory: &Path, segment_name: &str) -> Result<FefReader> {
        let path = directory.join(segment_name);
        let file = File::open(&path)?;
        // Safety: opened read-only and never truncated or written to for
        // the lifetime of this mapping.
        let mmap = unsafe { memmap2::Mmap::map(&file) }
            .map_err(|_| FefError::SegmentAlloc(segment_name.to_string()))?;
        let (argument_count, expression_count) = read_counts(&mmap)?;
        debug!(
            "opened segment '{}' read-only ({} args, {} exprs)",
            segment_name, argument_count, expression_count
        );
        Ok(FefReader {
            backing: Backing::Mapped(mmap),
            argument_count,
            expression_count,
        })
    }

    /// Wraps already-in-memory bytes, copying them in. Used by this crate's
    /// own tests and by embedders that already hold the bytes some other
    /// way (e.g. through `fef::segment::Segment::as_slice`).
    pub fn from_bytes(bytes: &[u8]) -> Result<FefReader> {
        let (argument_count, expression_count) = read_counts(bytes)?;
        Ok(FefReader {
            backing: Backing::Owned(bytes.to_vec()),
            argument_count,
            expression_count,
        })
    }

    /// The cursor for the document root.
    pub fn root(&self) -> Cursor<'_> {
        Cursor::root(self.backing.as_slice(), self.argument_count, self.expression_count)
    }

    pub fn argument_count(&self) -> u64 {
        self.argument_count
    }

    pub fn expression_count(&self) -> u64 {
        self.expression_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fef::segment::SegmentStore;
    use fef::writer::{self, LoadOptions};

    #[test]
    fn open_reads_back_what_the_writer_wrote() {
        let dir = tempfile::tempdir().unwrap();
        let segments_dir = dir.path().join("segments");
        let store = SegmentStore::new(&segments_dir).unwrap();
        let json_path = dir.path().join("doc.json");
        std::fs::write(&json_path, r#"{"a": 1}"#).unwrap();
        let handle = writer::load(
            &store,
            &json_path,
            "seg",
            dir.path(),
            &LoadOptions::default(),
        )
        .unwrap();
        writer::unload(&store, "seg").unwrap();

        let reader = FefReader::open(&segments_dir, "seg").unwrap();
        assert_eq!(reader.argument_count(), handle.argument_count);
        assert_eq!(reader.expression_count(), handle.expression_count);
        assert_eq!(reader.root().head().unwrap().as_str(), "Object");
    }

    #[test]
    fn from_bytes_matches_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path().join("segments")).unwrap();
        let json_path = dir.path().join("doc.json");
        std::fs::write(&json_path, r#"[1, 2, 3]"#).unwrap();
        writer::load(&store, &json_path, "seg", dir.path(), &LoadOptions::default()).unwrap();

        let owned = store
            .with_segment("seg", |segment| Ok(segment.as_slice()?.to_vec()))
            .unwrap();
        let reader = FefReader::from_bytes(&owned).unwrap();
        assert_eq!(reader.root().child_count().unwrap(), 3);
    }
}
