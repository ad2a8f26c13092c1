//! The two-pass JSON-to-FEF transducer.
//!
//! Pass 1 walks a parsed `serde_json::Value` tree once to compute, per tree
//! depth, how many argument slots that depth will need and how many
//! expressions the whole document opens — without writing a single byte.
//! Pass 2 walks the same tree again and emits values into a buffer sized
//! exactly from pass 1's counts, growing only the trailing string pool as
//! strings are appended.
//!
//! `.csv`-valued strings are expanded inline into a `Table` subtree rather
//! than stored as plain strings; see `infer_csv_columns` for the column
//! type ladder.

use std::path::Path;

use serde_json::Value;

use crate::error::{FefError, Result};
use crate::layout::{self, ArgumentKind, RLE_BIT, RLE_MIN_RUN};
use crate::segment::{Segment, SegmentStore};

/// Initial bytes reserved for the string pool beyond the fixed-size header
/// and sub-arrays; grown (by doubling) whenever a `store_string` call would
/// overflow it.
const INITIAL_STRING_RESERVE: usize = 256;

/// The three boolean knobs the original passed as trailing parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    pub disable_rle: bool,
    pub disable_csv_handling: bool,
    pub force_reload: bool,
}

/// A reference to a segment that now holds a frozen FEF image, along with
/// the counts a caller needs to hand a `fef-reader::Cursor` without it
/// having to re-read the header itself.
#[derive(Debug, Clone)]
pub struct FefHandle {
    pub segment_name: String,
    pub argument_count: u64,
    pub expression_count: u64,
}

/// Transduces `json_path` into `segment_name`, expanding any `.csv`-valued
/// strings found under `csv_prefix` into inline `Table` subtrees.
///
/// Idempotent when `options.force_reload` is false and the segment already
/// holds a frozen image: the existing header is read back and no bytes are
/// rewritten. Otherwise any existing image is erased and rebuilt from
/// scratch.
pub fn load(
    store: &SegmentStore,
    json_path: &Path,
    segment_name: &str,
    csv_prefix: &Path,
    options: &LoadOptions,
) -> Result<FefHandle> {
    store.create_or_get(segment_name)?;

    if options.force_reload {
        store.with_segment(segment_name, |segment| segment.free())?;
        store.forget(segment_name);
        store.create_or_get(segment_name)?;
    } else if let Some(handle) = try_reuse(store, segment_name)? {
        info!(
            "reused existing segment '{}' ({} args, {} exprs), forceReload=false",
            handle.segment_name, handle.argument_count, handle.expression_count
        );
        return Ok(handle);
    }

    let text = std::fs::read_to_string(json_path)?;
    let document: Value = serde_json::from_str(&text).map_err(|e| parse_error(&text, e))?;
    if !matches!(document, Value::Object(_) | Value::Array(_)) {
        return Err(FefError::UnsupportedValueKind(
            "top-level JSON value must be an object or array",
        ));
    }

    let mut counter = LayerCounter::default();
    counter.walk(&document, 0, csv_prefix, options.disable_csv_handling)?;
    let expression_count = counter.expression_count;
    let prefix = counter.prefix_sums();
    let argument_count = *prefix.last().unwrap_or(&0);
    let size = layout::image_size(argument_count, expression_count, INITIAL_STRING_RESERVE);

    store.with_segment(segment_name, |segment| {
        {
            let bytes = segment.allocate(size)?;
            layout::write_argument_count(bytes, argument_count);
            layout::write_expression_count(bytes, expression_count);
            layout::write_original_address(bytes, bytes.as_ptr() as u64);
            layout::write_string_fill_index(bytes, 0);
        }

        let mut pass2 = Transducer {
            segment,
            segment_name,
            argument_count,
            expression_count,
            layer_cursor: prefix[..prefix.len() - 1].to_vec(),
            next_expression_index: 0,
            rle_run_len: 0,
            disable_rle: options.disable_rle,
            disable_csv_handling: options.disable_csv_handling,
            csv_prefix,
        };
        pass2.emit_root(&document)
    })?;

    info!(
        "loaded '{}' ({} args, {} exprs) from {}",
        segment_name,
        argument_count,
        expression_count,
        json_path.display()
    );

    Ok(FefHandle {
        segment_name: segment_name.to_string(),
        argument_count,
        expression_count,
    })
}

/// Unmaps `segment_name`'s mapping without erasing the backing file.
pub fn unload(store: &SegmentStore, segment_name: &str) -> Result<()> {
    store.with_segment(segment_name, |segment| {
        if !segment.loaded() {
            return Err(FefError::SegmentNotLoaded(segment_name.to_string()));
        }
        segment.unload();
        Ok(())
    })
}

/// Unmaps and erases `segment_name` entirely. Callers use this to clean up
/// a partial write after a failed `load`, since the writer performs no
/// automatic rollback.
pub fn free(store: &SegmentStore, segment_name: &str) -> Result<()> {
    store.with_segment(segment_name, |segment| segment.free())?;
    store.forget(segment_name);
    Ok(())
}

fn try_reuse(store: &SegmentStore, segment_name: &str) -> Result<Option<FefHandle>> {
    store.with_segment(segment_name, |segment| {
        if !segment.exists()? {
            return Ok(None);
        }
        segment.open_existing()?;
        let bytes = segment.as_slice()?;
        if bytes.len() < layout::HEADER_SIZE {
            return Ok(None);
        }
        Ok(Some(FefHandle {
            segment_name: segment_name.to_string(),
            argument_count: layout::read_argument_count(bytes),
            expression_count: layout::read_expression_count(bytes),
        }))
    })
}

fn parse_error(source: &str, err: serde_json::Error) -> FefError {
    let position = byte_offset_for(source, err.line(), err.column());
    let last_token = extract_last_token(source, position);
    FefError::Parse {
        position,
        last_token,
        message: err.to_string(),
    }
}

fn byte_offset_for(source: &str, line: usize, column: usize) -> usize {
    let mut offset = 0;
    for (i, l) in source.split('\n').enumerate() {
        if i + 1 == line {
            return offset + column.saturating_sub(1);
        }
        offset += l.len() + 1;
    }
    source.len()
}

fn extract_last_token(source: &str, position: usize) -> String {
    let position = position.min(source.len());
    let start = source[..position]
        .rfind(|c: char| c.is_whitespace() || "{}[],:".contains(c))
        .map(|i| i + 1)
        .unwrap_or(0);
    let end = (position + 16).min(source.len());
    source[start..end].trim().to_string()
}

fn is_csv_path(s: &str) -> bool {
    Path::new(s)
        .extension()
        .is_some_and(|ext| ext == "csv")
}

// ----------------------------- Pass 1 ------------------------------------

/// Accumulates, per tree depth, how many argument slots that depth needs
/// and how many expressions the document opens, without materializing
/// anything. See spec §4.3's "Two-pass design".
#[derive(Default)]
struct LayerCounter {
    expression_count: u64,
    arg_count_per_layer: Vec<u64>,
}

impl LayerCounter {
    fn charge(&mut self, depth: usize, n: u64) {
        if self.arg_count_per_layer.len() <= depth {
            self.arg_count_per_layer.resize(depth + 1, 0);
        }
        self.arg_count_per_layer[depth] += n;
    }

    /// `depth` is this value's own nesting depth; a value never charges its
    /// own slot (the caller already did, except for the document root,
    /// which occupies no slot at all). Object keys open an implicit unary
    /// expression: the key-expression's slot lives at `depth + 1`, its
    /// single value child at `depth + 2`.
    fn walk(
        &mut self,
        value: &Value,
        depth: usize,
        csv_prefix: &Path,
        disable_csv_handling: bool,
    ) -> Result<()> {
        match value {
            Value::Object(map) => {
                self.expression_count += 1;
                for (_key, val) in map {
                    self.charge(depth + 1, 1);
                    self.expression_count += 1;
                    self.charge(depth + 2, 1);
                    self.walk(val, depth + 2, csv_prefix, disable_csv_handling)?;
                }
            }
            Value::Array(items) => {
                self.expression_count += 1;
                for item in items {
                    self.charge(depth + 1, 1);
                    self.walk(item, depth + 1, csv_prefix, disable_csv_handling)?;
                }
            }
            Value::String(s) if !disable_csv_handling && is_csv_path(s) => {
                let (rows, cols) = csv_dimensions(&csv_prefix.join(s))?;
                self.expression_count += 1 + cols;
                self.charge(depth + 1, cols);
                self.charge(depth + 2, cols * rows);
            }
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
        }
        Ok(())
    }

    fn prefix_sums(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.arg_count_per_layer.len() + 1);
        out.push(0);
        let mut running = 0u64;
        for &count in &self.arg_count_per_layer {
            running += count;
            out.push(running);
        }
        out
    }
}

fn csv_dimensions(path: &Path) -> Result<(u64, u64)> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let cols = reader.headers()?.len() as u64;
    let mut rows = 0u64;
    for record in reader.records() {
        record?;
        rows += 1;
    }
    Ok((rows, cols))
}

// ----------------------------- Pass 2 ------------------------------------

enum CsvColumn {
    Long { name: String, cells: Vec<Option<i64>> },
    Double { name: String, cells: Vec<Option<f64>> },
    Str { name: String, cells: Vec<String> },
}

fn read_csv_raw(path: &Path) -> Result<(Vec<String>, Vec<Vec<Option<String>>>)> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(String::from).collect();
    let mut columns: Vec<Vec<Option<String>>> = vec![Vec::new(); headers.len()];
    for record in reader.records() {
        let record = record?;
        for (i, cell) in record.iter().enumerate() {
            columns[i].push(if cell.is_empty() {
                None
            } else {
                Some(cell.to_string())
            });
        }
    }
    Ok((headers, columns))
}

fn try_parse_all<T: std::str::FromStr>(raw: &[Option<String>]) -> Option<Vec<Option<T>>> {
    let mut out = Vec::with_capacity(raw.len());
    for cell in raw {
        match cell {
            None => out.push(None),
            Some(s) => out.push(Some(s.parse::<T>().ok()?)),
        }
    }
    Some(out)
}

/// `Long` -> `Double` -> `String`, in that order; `String` always succeeds,
/// so `CsvTypeInferenceFailed` is unreachable here but is kept as a declared
/// error kind for the failure taxonomy.
fn infer_csv_columns(path: &Path) -> Result<Vec<CsvColumn>> {
    let (headers, raw_columns) = read_csv_raw(path)?;
    let mut columns = Vec::with_capacity(headers.len());
    for (name, raw) in headers.into_iter().zip(raw_columns.into_iter()) {
        if let Some(cells) = try_parse_all::<i64>(&raw) {
            columns.push(CsvColumn::Long { name, cells });
            continue;
        }
        if let Some(cells) = try_parse_all::<f64>(&raw) {
            columns.push(CsvColumn::Double { name, cells });
            continue;
        }
        let cells = raw.into_iter().map(Option::unwrap_or_default).collect();
        columns.push(CsvColumn::Str { name, cells });
    }
    Ok(columns)
}

/// Exercises the same `Long -> Double -> String` inference ladder `load`
/// uses for inline CSV expansion, without storing anything. Used by the
/// command line's raw `.csv` positional arguments, which only measure
/// inference cost rather than loading the file into a segment.
pub fn csv_dry_run(path: &Path) -> Result<usize> {
    Ok(infer_csv_columns(path)?.len())
}

/// Carries the mutable state of one `load` invocation's emitting pass: the
/// segment being written into, the per-depth layer cursors captured from
/// pass 1's prefix sums, the next free expression-table slot, and the
/// in-progress type-RLE run.
struct Transducer<'a> {
    segment: &'a mut Segment,
    segment_name: &'a str,
    argument_count: u64,
    expression_count: u64,
    layer_cursor: Vec<u64>,
    next_expression_index: u64,
    rle_run_len: u64,
    disable_rle: bool,
    disable_csv_handling: bool,
    csv_prefix: &'a Path,
}

impl<'a> Transducer<'a> {
    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        self.segment.as_mut_slice()
    }

    fn ensure_layer(&self, depth: usize) -> Result<()> {
        if depth >= self.layer_cursor.len() {
            return Err(FefError::InvariantViolated(format!(
                "pass 1/pass 2 layer-count mismatch at depth {depth}"
            )));
        }
        Ok(())
    }

    fn next_slot(&mut self, depth: usize) -> Result<u64> {
        self.ensure_layer(depth)?;
        let idx = self.layer_cursor[depth];
        self.layer_cursor[depth] += 1;
        Ok(idx)
    }

    fn ensure_string_capacity(&mut self, additional: usize) -> Result<()> {
        let pool_base = layout::strings_base(self.argument_count, self.expression_count);
        let fill = layout::read_string_fill_index(self.segment.as_slice()?) as usize;
        let required = pool_base + fill + additional;
        let current_size = self.segment.size();
        if required <= current_size {
            return Ok(());
        }
        let new_size = required.max(current_size.saturating_mul(2));
        trace!(
            "growing string pool of segment '{}' to {} bytes",
            self.segment_name,
            new_size
        );
        self.segment.reallocate(new_size)?;
        Ok(())
    }

    fn store_string(&mut self, s: &str) -> Result<u64> {
        self.ensure_string_capacity(s.len() + 1)?;
        let pool_base = layout::strings_base(self.argument_count, self.expression_count);
        let bytes = self.bytes_mut()?;
        let fill = layout::read_string_fill_index(bytes) as usize;
        bytes[pool_base + fill..pool_base + fill + s.len()].copy_from_slice(s.as_bytes());
        bytes[pool_base + fill + s.len()] = 0;
        layout::write_string_fill_index(bytes, (fill + s.len() + 1) as u64);
        Ok(fill as u64)
    }

    /// Flushes the in-progress run ending (exclusive) at `end_index`,
    /// stamping it RLE if it met the minimum length. Mirrors
    /// `resetTypeRLE`.
    fn flush_rle(&mut self, end_index: u64) -> Result<()> {
        if self.disable_rle {
            self.rle_run_len = 0;
            return Ok(());
        }
        if self.rle_run_len >= RLE_MIN_RUN {
            let start = end_index - self.rle_run_len;
            let bytes = self.bytes_mut()?;
            let tag = layout::tag_kind(layout::read_tag(bytes, self.argument_count, start));
            layout::write_tag(bytes, self.argument_count, start, tag | RLE_BIT);
            layout::write_run_length(bytes, self.argument_count, start, self.rle_run_len);
        }
        self.rle_run_len = 0;
        Ok(())
    }

    /// Mirrors `applyTypeRLE`: accumulate a run of `tag`-typed arguments at
    /// consecutive indices, flushing as soon as the type changes.
    fn apply_rle(&mut self, idx: u64, tag: u64) -> Result<()> {
        if self.disable_rle {
            self.rle_run_len = 0;
            return Ok(());
        }
        if self.rle_run_len == 0 {
            self.rle_run_len = 1;
            return Ok(());
        }
        let prev_tag = layout::read_tag(self.bytes_mut()?, self.argument_count, idx - 1);
        if prev_tag != tag {
            self.flush_rle(idx)?;
            self.rle_run_len = 1;
        } else {
            self.rle_run_len += 1;
        }
        Ok(())
    }

    fn write_long(&mut self, idx: u64, value: i64) -> Result<()> {
        let bytes = self.bytes_mut()?;
        layout::write_long(bytes, self.argument_count, idx, value);
        layout::write_tag(bytes, self.argument_count, idx, ArgumentKind::Long.as_tag());
        self.apply_rle(idx, ArgumentKind::Long.as_tag())
    }

    fn write_double(&mut self, idx: u64, value: f64) -> Result<()> {
        let bytes = self.bytes_mut()?;
        layout::write_double(bytes, self.argument_count, idx, value);
        layout::write_tag(bytes, self.argument_count, idx, ArgumentKind::Double.as_tag());
        self.apply_rle(idx, ArgumentKind::Double.as_tag())
    }

    fn write_string_leaf(&mut self, idx: u64, s: &str) -> Result<()> {
        let offset = self.store_string(s)?;
        let bytes = self.bytes_mut()?;
        layout::write_offset(bytes, self.argument_count, idx, offset);
        layout::write_tag(bytes, self.argument_count, idx, ArgumentKind::String.as_tag());
        self.apply_rle(idx, ArgumentKind::String.as_tag())
    }

    fn write_symbol_leaf(&mut self, idx: u64, s: &str) -> Result<()> {
        let offset = self.store_string(s)?;
        let bytes = self.bytes_mut()?;
        layout::write_offset(bytes, self.argument_count, idx, offset);
        layout::write_tag(bytes, self.argument_count, idx, ArgumentKind::Symbol.as_tag());
        self.apply_rle(idx, ArgumentKind::Symbol.as_tag())
    }

    fn write_expression_ref(&mut self, idx: u64, expr_index: u64) -> Result<()> {
        let bytes = self.bytes_mut()?;
        layout::write_offset(bytes, self.argument_count, idx, expr_index);
        layout::write_tag(
            bytes,
            self.argument_count,
            idx,
            ArgumentKind::Expression.as_tag(),
        );
        // RLE never spans an expression boundary: flush without starting a
        // new run.
        self.flush_rle(idx)
    }

    /// Allocates and writes the `(symbolNameOffset, startChildOffset, _)`
    /// triple for a fresh expression whose children will live at
    /// `own_depth + 1`. Does not touch the parent's argument slot; see
    /// `open_expression` for the non-root case that also writes the
    /// `Expression`-tagged reference argument.
    fn begin_expression(&mut self, head: &str, child_depth: usize) -> Result<u64> {
        let expr_index = self.next_expression_index;
        self.next_expression_index += 1;
        let symbol_offset = self.store_string(head)?;
        self.ensure_layer(child_depth)?;
        let start = self.layer_cursor[child_depth];
        let bytes = self.bytes_mut()?;
        layout::write_expression_symbol(bytes, self.argument_count, expr_index, symbol_offset);
        layout::write_expression_start(bytes, self.argument_count, expr_index, start);
        Ok(expr_index)
    }

    fn finish_expression(&mut self, expr_index: u64, child_depth: usize) -> Result<()> {
        let end = self.layer_cursor[child_depth];
        let bytes = self.bytes_mut()?;
        layout::write_expression_end(bytes, self.argument_count, expr_index, end);
        self.flush_rle(end)
    }

    fn open_expression(&mut self, global_idx: u64, head: &str, own_depth: usize) -> Result<u64> {
        let expr_index = self.next_expression_index;
        self.next_expression_index += 1;
        self.write_expression_ref(global_idx, expr_index)?;
        let symbol_offset = self.store_string(head)?;
        let child_depth = own_depth + 1;
        self.ensure_layer(child_depth)?;
        let start = self.layer_cursor[child_depth];
        let bytes = self.bytes_mut()?;
        layout::write_expression_symbol(bytes, self.argument_count, expr_index, symbol_offset);
        layout::write_expression_start(bytes, self.argument_count, expr_index, start);
        Ok(expr_index)
    }

    fn close_expression(&mut self, expr_index: u64, own_depth: usize) -> Result<()> {
        self.finish_expression(expr_index, own_depth + 1)
    }

    fn emit_root(&mut self, value: &Value) -> Result<()> {
        let head = match value {
            Value::Object(_) => "Object",
            Value::Array(_) => "List",
            _ => unreachable!("caller already rejected scalar roots"),
        };
        let expr_index = self.begin_expression(head, 1)?;
        match value {
            Value::Array(items) => {
                for item in items {
                    let idx = self.next_slot(1)?;
                    self.emit_child_slot(idx, item, 1)?;
                }
            }
            Value::Object(map) => {
                for (key, val) in map {
                    self.emit_object_entry(key, val, 0)?;
                }
            }
            _ => unreachable!(),
        }
        self.finish_expression(expr_index, 1)
    }

    fn emit_object_entry(&mut self, key: &str, value: &Value, own_depth: usize) -> Result<()> {
        let key_idx = self.next_slot(own_depth + 1)?;
        let key_expr = self.open_expression(key_idx, key, own_depth + 1)?;
        let val_idx = self.next_slot(own_depth + 2)?;
        self.emit_child_slot(val_idx, value, own_depth + 2)?;
        self.close_expression(key_expr, own_depth + 1)
    }

    fn emit_child_slot(&mut self, idx: u64, value: &Value, own_depth: usize) -> Result<()> {
        match value {
            Value::Null => self.write_symbol_leaf(idx, "Null"),
            Value::Bool(b) => self.write_symbol_leaf(idx, if *b { "True" } else { "False" }),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    self.write_long(idx, i)
                } else if let Some(u) = n.as_u64() {
                    self.write_long(idx, u as i64)
                } else if let Some(f) = n.as_f64() {
                    self.write_double(idx, f)
                } else {
                    Err(FefError::UnsupportedValueKind("number"))
                }
            }
            Value::String(s) => {
                if !self.disable_csv_handling && is_csv_path(s) {
                    self.emit_csv_table(idx, s, own_depth)
                } else {
                    self.write_string_leaf(idx, s)
                }
            }
            Value::Array(items) => {
                let expr_index = self.open_expression(idx, "List", own_depth)?;
                for item in items {
                    let child_idx = self.next_slot(own_depth + 1)?;
                    self.emit_child_slot(child_idx, item, own_depth + 1)?;
                }
                self.close_expression(expr_index, own_depth)
            }
            Value::Object(map) => {
                let expr_index = self.open_expression(idx, "Object", own_depth)?;
                for (key, val) in map {
                    self.emit_object_entry(key, val, own_depth)?;
                }
                self.close_expression(expr_index, own_depth)
            }
        }
    }

    fn emit_csv_table(&mut self, idx: u64, relative_path: &str, own_depth: usize) -> Result<()> {
        let full_path = self.csv_prefix.join(relative_path);
        let columns = infer_csv_columns(&full_path)?;
        let expr_index = self.open_expression(idx, "Table", own_depth)?;
        let child_depth = own_depth + 1;
        for column in &columns {
            let col_idx = self.next_slot(child_depth)?;
            self.emit_csv_column(col_idx, column, child_depth)?;
        }
        self.close_expression(expr_index, own_depth)
    }

    fn emit_csv_column(&mut self, idx: u64, column: &CsvColumn, own_depth: usize) -> Result<()> {
        let name = match column {
            CsvColumn::Long { name, .. } => name,
            CsvColumn::Double { name, .. } => name,
            CsvColumn::Str { name, .. } => name,
        };
        let expr_index = self.open_expression(idx, name, own_depth)?;
        let child_depth = own_depth + 1;
        match column {
            CsvColumn::Long { cells, .. } => {
                for cell in cells {
                    let cell_idx = self.next_slot(child_depth)?;
                    match cell {
                        Some(v) => self.write_long(cell_idx, *v)?,
                        None => self.write_symbol_leaf(cell_idx, "Missing")?,
                    }
                }
            }
            CsvColumn::Double { cells, .. } => {
                for cell in cells {
                    let cell_idx = self.next_slot(child_depth)?;
                    match cell {
                        Some(v) => self.write_double(cell_idx, *v)?,
                        None => self.write_symbol_leaf(cell_idx, "Missing")?,
                    }
                }
            }
            CsvColumn::Str { cells, .. } => {
                for cell in cells {
                    let cell_idx = self.next_slot(child_depth)?;
                    self.write_string_leaf(cell_idx, cell)?;
                }
            }
        }
        self.close_expression(expr_index, own_depth)
    }
}
