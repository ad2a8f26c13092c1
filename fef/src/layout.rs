//! Pure, stateless definition of the Flat Expression Format byte layout.
//!
//! A FEF image is a root header followed by four contiguous sub-arrays:
//! argument value cells, argument type tags, expression triples, and the
//! string pool. Every cross-reference inside the image is a byte offset, not
//! a host pointer, so the whole thing can be memory-mapped at any base
//! address (see `fef::segment`).
//!
//! All accessors here take and return plain byte slices and read/write
//! little-endian words through `byteorder`, the same technique the teacher
//! uses for its string table index entries. There is no `unsafe` in this
//! module: every field is reached through explicit offset arithmetic.

use byteorder::{ByteOrder, LittleEndian};

/// Size in bytes of the root header: `argumentCount`, `expressionCount`,
/// `originalAddress`, `stringArgumentsFillIndex`, each an 8-byte word.
pub const HEADER_SIZE: usize = 32;

/// Size in bytes of one argument value cell (the 8-byte union).
pub const ARG_VALUE_SIZE: usize = 8;

/// Size in bytes of one argument type tag. The tag is "one machine word"
/// per the format definition: large enough to hold `RLE_BIT` as a distinct
/// bit from the handful of type discriminants, and to double as a run-length
/// counter at `index + 1` of an RLE run without a second array.
pub const ARG_TAG_SIZE: usize = 8;

/// Size in bytes of one expression triple (`symbolNameOffset`,
/// `startChildOffset`, `endChildOffset`).
pub const EXPR_SIZE: usize = 24;

/// Minimum run length worth encoding as RLE; below this the length word
/// costs more than the repeated tags it would save.
pub const RLE_MIN_RUN: u64 = 5;

/// High bit of the type-tag word. Set on the tag at the start of an RLE run.
pub const RLE_BIT: u64 = 0x80;

/// The six argument kinds an FEF value cell can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ArgumentKind {
    Bool = 0,
    Long = 1,
    Double = 2,
    String = 3,
    Symbol = 4,
    Expression = 5,
}

impl ArgumentKind {
    pub fn from_tag(tag: u64) -> Option<ArgumentKind> {
        match tag & !RLE_BIT {
            0 => Some(ArgumentKind::Bool),
            1 => Some(ArgumentKind::Long),
            2 => Some(ArgumentKind::Double),
            3 => Some(ArgumentKind::String),
            4 => Some(ArgumentKind::Symbol),
            5 => Some(ArgumentKind::Expression),
            _ => None,
        }
    }

    #[inline]
    pub fn as_tag(self) -> u64 {
        self as u64
    }
}

#[inline]
pub fn tag_has_rle(tag: u64) -> bool {
    tag & RLE_BIT != 0
}

#[inline]
pub fn tag_kind(tag: u64) -> u64 {
    tag & !RLE_BIT
}

/// Byte offset of the argument value-cell sub-array (always right after
/// the header).
#[inline]
pub fn values_base() -> usize {
    HEADER_SIZE
}

/// Byte offset of the argument type-tag sub-array.
#[inline]
pub fn tags_base(argument_count: u64) -> usize {
    HEADER_SIZE + argument_count as usize * ARG_VALUE_SIZE
}

/// Byte offset of the expression-triple sub-array.
#[inline]
pub fn expressions_base(argument_count: u64) -> usize {
    tags_base(argument_count) + argument_count as usize * ARG_TAG_SIZE
}

/// Byte offset of the string pool (the first byte of the variable-length
/// tail region).
#[inline]
pub fn strings_base(argument_count: u64, expression_count: u64) -> usize {
    expressions_base(argument_count) + expression_count as usize * EXPR_SIZE
}

/// Total image size required to hold `argument_count` arguments,
/// `expression_count` expressions, and `string_reserve` bytes of string
/// pool, with no further growth.
#[inline]
pub fn image_size(argument_count: u64, expression_count: u64, string_reserve: usize) -> usize {
    strings_base(argument_count, expression_count) + string_reserve
}

// ----------------------------- Root header -----------------------------

#[inline]
pub fn read_argument_count(bytes: &[u8]) -> u64 {
    LittleEndian::read_u64(&bytes[0..8])
}

#[inline]
pub fn write_argument_count(bytes: &mut [u8], value: u64) {
    LittleEndian::write_u64(&mut bytes[0..8], value);
}

#[inline]
pub fn read_expression_count(bytes: &[u8]) -> u64 {
    LittleEndian::read_u64(&bytes[8..16])
}

#[inline]
pub fn write_expression_count(bytes: &mut [u8], value: u64) {
    LittleEndian::write_u64(&mut bytes[8..16], value);
}

/// Informational only; see Design Note on `originalAddress` in spec.md §9 —
/// never consulted to relocate the image.
#[inline]
pub fn read_original_address(bytes: &[u8]) -> u64 {
    LittleEndian::read_u64(&bytes[16..24])
}

#[inline]
pub fn write_original_address(bytes: &mut [u8], value: u64) {
    LittleEndian::write_u64(&mut bytes[16..24], value);
}

#[inline]
pub fn read_string_fill_index(bytes: &[u8]) -> u64 {
    LittleEndian::read_u64(&bytes[24..32])
}

#[inline]
pub fn write_string_fill_index(bytes: &mut [u8], value: u64) {
    LittleEndian::write_u64(&mut bytes[24..32], value);
}

// --------------------------- Argument values ----------------------------

#[inline]
pub fn value_cell_offset(argument_count: u64, index: u64) -> usize {
    debug_assert!(index < argument_count);
    values_base() + index as usize * ARG_VALUE_SIZE
}

#[inline]
pub fn read_bool(bytes: &[u8], argument_count: u64, index: u64) -> bool {
    let off = value_cell_offset(argument_count, index);
    bytes[off] != 0
}

#[inline]
pub fn write_bool(bytes: &mut [u8], argument_count: u64, index: u64, value: bool) {
    let off = value_cell_offset(argument_count, index);
    bytes[off..off + 8].fill(0);
    bytes[off] = value as u8;
}

#[inline]
pub fn read_long(bytes: &[u8], argument_count: u64, index: u64) -> i64 {
    let off = value_cell_offset(argument_count, index);
    LittleEndian::read_i64(&bytes[off..off + 8])
}

#[inline]
pub fn write_long(bytes: &mut [u8], argument_count: u64, index: u64, value: i64) {
    let off = value_cell_offset(argument_count, index);
    LittleEndian::write_i64(&mut bytes[off..off + 8], value);
}

#[inline]
pub fn read_double(bytes: &[u8], argument_count: u64, index: u64) -> f64 {
    let off = value_cell_offset(argument_count, index);
    LittleEndian::read_f64(&bytes[off..off + 8])
}

#[inline]
pub fn write_double(bytes: &mut [u8], argument_count: u64, index: u64, value: f64) {
    let off = value_cell_offset(argument_count, index);
    LittleEndian::write_f64(&mut bytes[off..off + 8], value);
}

/// Reads the raw 8-byte cell as an offset/index (shared representation for
/// `String`, `Symbol`, and `Expression` argument kinds).
#[inline]
pub fn read_offset(bytes: &[u8], argument_count: u64, index: u64) -> u64 {
    let off = value_cell_offset(argument_count, index);
    LittleEndian::read_u64(&bytes[off..off + 8])
}

#[inline]
pub fn write_offset(bytes: &mut [u8], argument_count: u64, index: u64, value: u64) {
    let off = value_cell_offset(argument_count, index);
    LittleEndian::write_u64(&mut bytes[off..off + 8], value);
}

// ----------------------------- Type tags --------------------------------

#[inline]
pub fn tag_offset(argument_count: u64, index: u64) -> usize {
    debug_assert!(index < argument_count);
    tags_base(argument_count) + index as usize * ARG_TAG_SIZE
}

#[inline]
pub fn read_tag(bytes: &[u8], argument_count: u64, index: u64) -> u64 {
    let off = tag_offset(argument_count, index);
    LittleEndian::read_u64(&bytes[off..off + 8])
}

#[inline]
pub fn write_tag(bytes: &mut [u8], argument_count: u64, index: u64, tag: u64) {
    let off = tag_offset(argument_count, index);
    LittleEndian::write_u64(&mut bytes[off..off + 8], tag);
}

/// Reads the run length stored at `index + 1` when the tag at `index` has
/// `RLE_BIT` set. The slot is reinterpreted as a plain count, not a tag.
#[inline]
pub fn read_run_length(bytes: &[u8], argument_count: u64, index: u64) -> u64 {
    read_tag(bytes, argument_count, index + 1)
}

#[inline]
pub fn write_run_length(bytes: &mut [u8], argument_count: u64, index: u64, length: u64) {
    write_tag(bytes, argument_count, index + 1, length);
}

// --------------------------- Expressions --------------------------------

#[inline]
pub fn expression_offset(expression_index: u64) -> usize {
    expression_index as usize * EXPR_SIZE
}

pub struct ExpressionTriple {
    pub symbol_name_offset: u64,
    pub start_child_offset: u64,
    pub end_child_offset: u64,
}

#[inline]
pub fn read_expression(
    bytes: &[u8],
    argument_count: u64,
    expression_index: u64,
) -> ExpressionTriple {
    let base = expressions_base(argument_count) + expression_offset(expression_index);
    ExpressionTriple {
        symbol_name_offset: LittleEndian::read_u64(&bytes[base..base + 8]),
        start_child_offset: LittleEndian::read_u64(&bytes[base + 8..base + 16]),
        end_child_offset: LittleEndian::read_u64(&bytes[base + 16..base + 24]),
    }
}

#[inline]
pub fn write_expression_symbol(
    bytes: &mut [u8],
    argument_count: u64,
    expression_index: u64,
    symbol_name_offset: u64,
) {
    let base = expressions_base(argument_count) + expression_offset(expression_index);
    LittleEndian::write_u64(&mut bytes[base..base + 8], symbol_name_offset);
}

#[inline]
pub fn write_expression_start(
    bytes: &mut [u8],
    argument_count: u64,
    expression_index: u64,
    start_child_offset: u64,
) {
    let base = expressions_base(argument_count) + expression_offset(expression_index);
    LittleEndian::write_u64(&mut bytes[base + 8..base + 16], start_child_offset);
}

#[inline]
pub fn write_expression_end(
    bytes: &mut [u8],
    argument_count: u64,
    expression_index: u64,
    end_child_offset: u64,
) {
    let base = expressions_base(argument_count) + expression_offset(expression_index);
    LittleEndian::write_u64(&mut bytes[base + 16..base + 24], end_child_offset);
}

// ----------------------------- String pool -------------------------------

/// Reads a zero-terminated string out of the pool at `offset`, relative to
/// the pool base derived from `argument_count`/`expression_count`.
pub fn read_string<'a>(
    bytes: &'a [u8],
    argument_count: u64,
    expression_count: u64,
    offset: u64,
) -> &'a str {
    let pool_base = strings_base(argument_count, expression_count);
    let start = pool_base + offset as usize;
    let end = bytes[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .expect("string pool entry is not zero-terminated");
    std::str::from_utf8(&bytes[start..end]).expect("string pool entry is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_array_offsets_follow_fixed_order() {
        let n = 10u64;
        let m = 3u64;
        assert_eq!(values_base(), HEADER_SIZE);
        assert_eq!(tags_base(n), HEADER_SIZE + 80);
        assert_eq!(expressions_base(n), HEADER_SIZE + 80 + 80);
        assert_eq!(strings_base(n, m), HEADER_SIZE + 80 + 80 + 72);
    }

    #[test]
    fn tag_rle_bit_roundtrip() {
        let tag = ArgumentKind::Long.as_tag() | RLE_BIT;
        assert!(tag_has_rle(tag));
        assert_eq!(tag_kind(tag), ArgumentKind::Long.as_tag());
        assert_eq!(ArgumentKind::from_tag(tag), Some(ArgumentKind::Long));
    }

    #[test]
    fn run_length_roundtrip() {
        let n = 8u64;
        let mut buf = vec![0u8; tags_base(n) + n as usize * ARG_TAG_SIZE];
        write_tag(&mut buf, n, 2, ArgumentKind::Long.as_tag() | RLE_BIT);
        write_run_length(&mut buf, n, 2, 6);
        assert!(tag_has_rle(read_tag(&buf, n, 2)));
        assert_eq!(read_run_length(&buf, n, 2), 6);
    }

    #[test]
    fn header_roundtrip() {
        let mut buf = vec![0u8; HEADER_SIZE];
        write_argument_count(&mut buf, 42);
        write_expression_count(&mut buf, 7);
        write_original_address(&mut buf, 0xdead_beef);
        write_string_fill_index(&mut buf, 100);

        assert_eq!(read_argument_count(&buf), 42);
        assert_eq!(read_expression_count(&buf), 7);
        assert_eq!(read_original_address(&buf), 0xdead_beef);
        assert_eq!(read_string_fill_index(&buf), 100);
    }
}
