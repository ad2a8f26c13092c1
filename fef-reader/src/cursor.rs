//! The lazy, allocation-free reader side of the Flat Expression Format.
//!
//! A [`Cursor`] is nothing but a borrowed byte slice and a position; moving
//! to a child or reading a value never copies or allocates, mirroring the
//! way `decodeme`'s `EventDecoder` derives byte addresses from indices
//! rather than building an intermediate tree.

use std::borrow::Cow;
use std::fmt;

use fef::error::{FefError, Result};
use fef::layout::{self, ArgumentKind};

/// A borrowed view of a pooled string, analogous to `measureme::StringRef`.
#[derive(Clone, Copy)]
pub struct StringView<'a>(&'a str);

impl<'a> StringView<'a> {
    pub fn as_str(&self) -> &'a str {
        self.0
    }

    pub fn to_string(&self) -> Cow<'a, str> {
        Cow::Borrowed(self.0)
    }
}

impl<'a> fmt::Display for StringView<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl<'a> fmt::Debug for StringView<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.0, f)
    }
}

/// Where a [`Cursor`] currently sits: either a regular argument slot (any
/// tag kind — only makes sense to navigate further if that slot's tag is
/// `Expression`), or the document root, which — unlike every other
/// expression — is not referenced by any parent argument slot.
#[derive(Clone, Copy)]
enum Position {
    Root,
    Argument(u64),
}

/// A position within a frozen FEF image. Cursors never own the memory they
/// read.
#[derive(Clone, Copy)]
pub struct Cursor<'a> {
    bytes: &'a [u8],
    argument_count: u64,
    expression_count: u64,
    position: Position,
}

impl<'a> Cursor<'a> {
    /// Builds the root cursor. Crate-internal: callers go through
    /// `FefReader::root`.
    pub(crate) fn root(bytes: &'a [u8], argument_count: u64, expression_count: u64) -> Cursor<'a> {
        Cursor {
            bytes,
            argument_count,
            expression_count,
            position: Position::Root,
        }
    }

    fn tag(&self) -> Option<u64> {
        match self.position {
            Position::Root => None,
            Position::Argument(idx) => Some(layout::read_tag(self.bytes, self.argument_count, idx)),
        }
    }

    fn expression_index(&self) -> Result<u64> {
        match self.position {
            Position::Root => Ok(0),
            Position::Argument(idx) => {
                let tag = layout::tag_kind(self.tag().unwrap());
                if tag != ArgumentKind::Expression.as_tag() {
                    return Err(FefError::InvariantViolated(format!(
                        "argument {idx} is not an Expression reference"
                    )));
                }
                Ok(layout::read_offset(self.bytes, self.argument_count, idx))
            }
        }
    }

    fn expression(&self) -> Result<layout::ExpressionTriple> {
        let expr_index = self.expression_index()?;
        Ok(layout::read_expression(
            self.bytes,
            self.argument_count,
            expr_index,
        ))
    }

    /// The head symbol of this cursor's expression (`"Object"`, `"List"`,
    /// `"Table"`, a key name, or a CSV column name). Fails if this cursor
    /// does not sit at an `Expression`-tagged slot.
    pub fn head(&self) -> Result<StringView<'a>> {
        let expr = self.expression()?;
        Ok(StringView(layout::read_string(
            self.bytes,
            self.argument_count,
            self.expression_count,
            expr.symbol_name_offset,
        )))
    }

    /// Number of direct children this expression has.
    pub fn child_count(&self) -> Result<u64> {
        let expr = self.expression()?;
        Ok(expr.end_child_offset - expr.start_child_offset)
    }

    /// The cursor for child `i`, in emission order. `i` must be less than
    /// `child_count()`.
    pub fn child_by_index(&self, i: u64) -> Result<Cursor<'a>> {
        let expr = self.expression()?;
        let count = expr.end_child_offset - expr.start_child_offset;
        if i >= count {
            return Err(FefError::InvariantViolated(format!(
                "child index {i} out of range (expression has {count} children)"
            )));
        }
        Ok(Cursor {
            bytes: self.bytes,
            argument_count: self.argument_count,
            expression_count: self.expression_count,
            position: Position::Argument(expr.start_child_offset + i),
        })
    }

    /// Scans this expression's `Expression`-typed children for one whose
    /// head equals `name`. Linear in the number of such children.
    ///
    /// Honors run-length-compressed tags: a run's body holds a length word,
    /// not a per-index tag, at `start+1 .. start+length-1`, so those
    /// indices are skipped rather than read.
    pub fn child_by_key(&self, name: &str) -> Result<Cursor<'a>> {
        let expr = self.expression()?;
        let mut idx = expr.start_child_offset;
        while idx < expr.end_child_offset {
            let tag = layout::read_tag(self.bytes, self.argument_count, idx);
            if layout::tag_has_rle(tag) {
                idx += layout::read_run_length(self.bytes, self.argument_count, idx);
                continue;
            }
            if layout::tag_kind(tag) == ArgumentKind::Expression.as_tag() {
                let child = Cursor {
                    bytes: self.bytes,
                    argument_count: self.argument_count,
                    expression_count: self.expression_count,
                    position: Position::Argument(idx),
                };
                if child.head()?.as_str() == name {
                    return Ok(child);
                }
            }
            idx += 1;
        }
        Err(FefError::KeyNotFound(name.to_string()))
    }

    /// A validity-tagged iterator over this expression's children as `T`,
    /// honoring RLE-compressed runs without re-reading every tag.
    pub fn iter<T: Scalar>(&self) -> Result<ScalarIter<'a, T>> {
        let expr = self.expression()?;
        Ok(ScalarIter {
            bytes: self.bytes,
            argument_count: self.argument_count,
            index: expr.start_child_offset,
            end: expr.end_child_offset,
            run_until: expr.start_child_offset,
            run_valid: false,
            _marker: std::marker::PhantomData,
        })
    }

    fn scalar_tag(&self) -> Result<u64> {
        match self.position {
            Position::Root => Err(FefError::InvariantViolated(
                "the document root is always an Expression, not a scalar".to_string(),
            )),
            Position::Argument(idx) => Ok(layout::tag_kind(layout::read_tag(
                self.bytes,
                self.argument_count,
                idx,
            ))),
        }
    }

    fn argument_index(&self) -> u64 {
        match self.position {
            Position::Root => unreachable!("scalar_tag already rejects Position::Root"),
            Position::Argument(idx) => idx,
        }
    }

    /// Reads this slot as a `Bool`. Fails if the slot holds another kind.
    pub fn as_bool(&self) -> Result<bool> {
        self.expect_tag(ArgumentKind::Bool)?;
        Ok(layout::read_bool(self.bytes, self.argument_count, self.argument_index()))
    }

    /// Reads this slot as a `Long`. Fails if the slot holds another kind.
    pub fn as_long(&self) -> Result<i64> {
        self.expect_tag(ArgumentKind::Long)?;
        Ok(layout::read_long(self.bytes, self.argument_count, self.argument_index()))
    }

    /// Reads this slot as a `Double`. Fails if the slot holds another kind.
    pub fn as_double(&self) -> Result<f64> {
        self.expect_tag(ArgumentKind::Double)?;
        Ok(layout::read_double(self.bytes, self.argument_count, self.argument_index()))
    }

    /// Reads this slot as a `String` or `Symbol` (both are pooled,
    /// zero-terminated strings; `Symbol` is how the writer represents
    /// `null` and CSV-missing cells).
    pub fn as_string(&self) -> Result<StringView<'a>> {
        let kind = self.scalar_tag()?;
        if kind != ArgumentKind::String.as_tag() && kind != ArgumentKind::Symbol.as_tag() {
            return Err(FefError::InvariantViolated(format!(
                "expected String or Symbol, found tag {kind}"
            )));
        }
        let offset = layout::read_offset(self.bytes, self.argument_count, self.argument_index());
        Ok(StringView(layout::read_string(
            self.bytes,
            self.argument_count,
            self.expression_count,
            offset,
        )))
    }

    /// Whether this slot holds the `Symbol("Missing")` sentinel the writer
    /// emits for empty numeric CSV cells.
    pub fn is_missing(&self) -> bool {
        matches!(self.as_string(), Ok(view) if view.as_str() == "Missing")
    }

    fn expect_tag(&self, kind: ArgumentKind) -> Result<()> {
        let actual = self.scalar_tag()?;
        if actual != kind.as_tag() {
            return Err(FefError::InvariantViolated(format!(
                "expected tag {:?} ({}), found {actual}",
                kind,
                kind.as_tag()
            )));
        }
        Ok(())
    }
}

impl<'a> fmt::Debug for Cursor<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Cursor");
        match (self.head(), self.child_count()) {
            (Ok(head), Ok(count)) => {
                dbg.field("head", &head.as_str()).field("children", &count);
            }
            _ => {
                dbg.field("tag", &self.tag());
            }
        }
        dbg.finish()
    }
}

impl<'a> fmt::Display for Cursor<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.head(), self.child_count()) {
            (Ok(head), Ok(count)) => write!(f, "{head}({count} children)"),
            _ => write!(f, "<scalar>"),
        }
    }
}

/// A scalar argument kind a [`Cursor::iter`] can yield: `Long` as `i64`,
/// `Double` as `f64`.
pub trait Scalar: Copy {
    const TAG: u64;
    fn read(bytes: &[u8], argument_count: u64, index: u64) -> Self;
}

impl Scalar for i64 {
    const TAG: u64 = ArgumentKind::Long as u64;
    fn read(bytes: &[u8], argument_count: u64, index: u64) -> Self {
        layout::read_long(bytes, argument_count, index)
    }
}

impl Scalar for f64 {
    const TAG: u64 = ArgumentKind::Double as u64;
    fn read(bytes: &[u8], argument_count: u64, index: u64) -> Self {
        layout::read_double(bytes, argument_count, index)
    }
}

/// Yields `Some(T)` at indices whose (possibly RLE-compressed) tag matches
/// `T::TAG`, `None` at indices that hold some other type — the caller skips
/// those rather than the iterator silently dropping them, so index
/// alignment with sibling columns is preserved.
pub struct ScalarIter<'a, T> {
    bytes: &'a [u8],
    argument_count: u64,
    index: u64,
    end: u64,
    run_until: u64,
    run_valid: bool,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T: Scalar> Iterator for ScalarIter<'a, T> {
    type Item = Option<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.end {
            return None;
        }
        let idx = self.index;
        if idx >= self.run_until {
            let tag = layout::read_tag(self.bytes, self.argument_count, idx);
            if layout::tag_has_rle(tag) {
                let len = layout::read_run_length(self.bytes, self.argument_count, idx);
                self.run_until = idx + len;
                self.run_valid = layout::tag_kind(tag) == T::TAG;
            } else {
                self.run_until = idx + 1;
                self.run_valid = tag == T::TAG;
            }
        }
        self.index += 1;
        Some(if self.run_valid {
            Some(T::read(self.bytes, self.argument_count, idx))
        } else {
            None
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fef::segment::SegmentStore;
    use fef::writer::{self, LoadOptions};

    fn root_bytes(json: &str) -> (tempfile::TempDir, Vec<u8>, u64, u64) {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path().join("segments")).unwrap();
        let json_path = dir.path().join("doc.json");
        std::fs::write(&json_path, json).unwrap();
        let handle = writer::load(
            &store,
            &json_path,
            "seg",
            dir.path(),
            &LoadOptions::default(),
        )
        .unwrap();
        let bytes = store
            .with_segment("seg", |segment| Ok(segment.as_slice()?.to_vec()))
            .unwrap();
        (dir, bytes, handle.argument_count, handle.expression_count)
    }

    #[test]
    fn child_by_key_and_index() {
        let (_dir, bytes, arg_count, expr_count) = root_bytes(r#"{"a": 1, "b": [2, 3]}"#);
        let root = Cursor::root(&bytes, arg_count, expr_count);
        assert_eq!(root.head().unwrap().as_str(), "Object");
        assert_eq!(root.child_count().unwrap(), 2);

        let a = root.child_by_key("a").unwrap();
        let a_value = a.child_by_index(0).unwrap();
        assert_eq!(a_value.as_long().unwrap(), 1);

        let b = root.child_by_key("b").unwrap();
        let b_value = b.child_by_index(0).unwrap();
        assert_eq!(b_value.head().unwrap().as_str(), "List");
        assert_eq!(b_value.child_count().unwrap(), 2);
        assert_eq!(b_value.child_by_index(0).unwrap().as_long().unwrap(), 2);

        let missing = root.child_by_key("missing");
        assert!(matches!(missing, Err(FefError::KeyNotFound(_))));
    }

    #[test]
    fn child_by_key_skips_over_rle_run_body() {
        let (_dir, bytes, arg_count, expr_count) = root_bytes("[1,1,1,1,1]");
        let root = Cursor::root(&bytes, arg_count, expr_count);
        // None of these children are keyed expressions, so every non-run
        // index and every skipped run body must be walked without the scan
        // mistaking the run-length word at start+1 for an expression index.
        let missing = root.child_by_key("anything");
        assert!(matches!(missing, Err(FefError::KeyNotFound(_))));
    }

    #[test]
    fn iter_long_with_rle_run() {
        let (_dir, bytes, arg_count, expr_count) = root_bytes("[1,1,1,1,1,1,1,1]");
        let root = Cursor::root(&bytes, arg_count, expr_count);
        let values: Vec<Option<i64>> = root.iter::<i64>().unwrap().collect();
        assert_eq!(values, vec![Some(1); 8]);
    }

    #[test]
    fn iter_skips_mismatched_type() {
        let (_dir, bytes, arg_count, expr_count) = root_bytes(r#"[1, 2.5, 3]"#);
        let root = Cursor::root(&bytes, arg_count, expr_count);
        let longs: Vec<Option<i64>> = root.iter::<i64>().unwrap().collect();
        assert_eq!(longs, vec![Some(1), None, Some(3)]);
    }

    #[test]
    fn missing_symbol_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path().join("segments")).unwrap();
        std::fs::write(dir.path().join("x.csv"), "n\n1\n\n").unwrap();
        let json_path = dir.path().join("doc.json");
        std::fs::write(&json_path, r#"{"t": "x.csv"}"#).unwrap();
        let handle = writer::load(
            &store,
            &json_path,
            "seg",
            dir.path(),
            &LoadOptions::default(),
        )
        .unwrap();
        let bytes = store
            .with_segment("seg", |segment| Ok(segment.as_slice()?.to_vec()))
            .unwrap();
        let root = Cursor::root(&bytes, handle.argument_count, handle.expression_count);
        let table = root.child_by_key("t").unwrap().child_by_index(0).unwrap();
        let n_column = table.child_by_key("n").unwrap();
        let second_cell = n_column.child_by_index(1).unwrap();
        assert!(second_cell.is_missing());
    }
}
