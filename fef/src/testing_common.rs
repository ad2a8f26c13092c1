//! Small JSON fixtures and temp-segment helpers shared by this crate's own
//! tests and by `fef-reader`'s round-trip tests.

use std::path::Path;

use tempfile::TempDir;

use crate::segment::SegmentStore;
use crate::writer::{self, FefHandle, LoadOptions};

/// A flat object of three scalar-typed fields, covering the plain,
/// no-RLE-run case.
pub const OBJECT_OF_SCALARS: &str = r#"{"name": "alpha", "count": 3, "ratio": 0.5}"#;

/// An array of five repeated longs, long enough to trigger an RLE run
/// (`RLE_MIN_RUN` is 5).
pub const RLE_RUN_OF_LONGS: &str = r#"{"values": [1, 1, 1, 1, 1]}"#;

/// Creates a fresh temp directory and `SegmentStore` rooted in it. The
/// directory is returned alongside the store so it stays alive for the
/// caller's scope; dropping it deletes every segment file underneath.
pub fn temp_store() -> (TempDir, SegmentStore) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let store = SegmentStore::new(dir.path()).expect("failed to create segment store");
    (dir, store)
}

/// Writes `json` to a temp file and loads it into a freshly created
/// segment named `name`, returning everything the caller needs to read it
/// back: the backing temp dir (keeps the JSON file and segment file
/// alive), the store, and the resulting handle.
pub fn load_fixture(name: &str, json: &str) -> (TempDir, SegmentStore, FefHandle) {
    let (dir, store) = temp_store();
    let json_path = dir.path().join(format!("{name}.json"));
    std::fs::write(&json_path, json).expect("failed to write fixture JSON");
    let handle = writer::load(
        &store,
        &json_path,
        name,
        dir.path(),
        &LoadOptions::default(),
    )
    .expect("failed to load fixture JSON");
    (dir, store, handle)
}

/// Same as [`load_fixture`] but lets the caller pick `csv_prefix` and
/// `options`, for scenarios that need CSV inlining or a non-default
/// `LoadOptions`.
pub fn load_fixture_with(
    name: &str,
    json: &str,
    csv_prefix: &Path,
    options: &LoadOptions,
) -> (TempDir, SegmentStore, FefHandle) {
    let (dir, store) = temp_store();
    let json_path = dir.path().join(format!("{name}.json"));
    std::fs::write(&json_path, json).expect("failed to write fixture JSON");
    let handle = writer::load(&store, &json_path, name, csv_prefix, options)
        .expect("failed to load fixture JSON");
    (dir, store, handle)
}
