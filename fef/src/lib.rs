//! This crate provides a library for transducing JSON (with inline CSV
//! expansion) into the Flat Expression Format, a self-describing binary tree
//! laid out in one contiguous buffer so a reader can walk it without parsing
//! or copying.
//!
//! The output of a [`writer::load`] call is a named [`segment::Segment`]
//! whose bytes are exactly four fixed-layout sub-arrays (argument values,
//! argument type tags, expression triples, string pool) as described in
//! [`layout`]. Every cross-reference inside the buffer is a byte offset
//! relative to that buffer, never a host pointer, so the same bytes can be
//! mapped at any base address.
//!
//! # Writing an FEF image
//!
//! The main entry point is [`writer::load`]. It takes a [`segment::SegmentStore`]
//! (the registry of named backing files), the path to a JSON document, the
//! name to give the resulting segment, a directory to resolve `.csv`-valued
//! strings against, and a [`writer::LoadOptions`] bundling the three
//! behavioral toggles the format supports (disabling RLE, disabling CSV
//! inlining, and forcing a rebuild of an already-populated segment).
//!
//! [`writer::unload`] drops a segment's mapping without erasing its backing
//! file; [`writer::free`] erases it.
#![deny(warnings)]

#[macro_use]
extern crate log;

pub mod error;
pub mod layout;
pub mod segment;
pub mod writer;

#[cfg(test)]
pub mod testing_common;

pub use crate::error::{FefError, Result};
pub use crate::segment::{Segment, SegmentStore};
pub use crate::writer::{FefHandle, LoadOptions};
