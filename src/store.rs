//! This module implements the frame structured chunk storage layer.
//!
//! # File format
//!
//! A GSD file starts with a fixed 256 byte header carrying a magic
//! number, the file format version, application and schema strings, and
//! the locations and capacities of two blocks: the index and the name
//! list.
//!
//! The index is an array of fixed 64 byte entries, one per chunk written,
//! filled as a contiguous prefix in frame order. An entry whose payload
//! location is zero is unused and terminates the prefix. When the index
//! fills up, a block of twice the size is written at the end of the file
//! and the header is pointed at it; the old block becomes dead space.
//!
//! The name list is an array of fixed 64 byte slots, each holding one
//! NUL terminated chunk name in insertion order. The slot position is
//! the name's id, which index entries reference and which never changes
//! for the lifetime of the file.
//!
//! Chunk payloads are appended at the end of the file, before the index
//! entries that describe them become durable.
//!
//! # Frames
//!
//! Writers group chunks into frames. [`GsdFile::end_frame`] seals the
//! open frame: new names are written and synced, then the frame's index
//! entries, then everything is synced. A crash before the seal leaves
//! the payload bytes in the file but unreachable, so the file stays
//! consistent; the frame is the atomicity unit.
//!
//! # Open modes
//!
//! Read-only handles map the index read-only and shared, so any number
//! of them can coexist on one file. Read/write handles keep the whole
//! index image in memory. Append handles determine the committed prefix
//! once at open and afterwards buffer only the entries of the open
//! frame.
//!
//! All integers are little endian on disk.

mod format;
pub use format::*;

mod name_table;

mod index;

mod file;
pub use file::*;
