//! Low level file helpers shared by the storage engine.

pub mod fd;
pub mod mmap;
