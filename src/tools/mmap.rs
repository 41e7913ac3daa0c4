//! Read-only shared mappings of file ranges.

use std::os::unix::io::RawFd;

use lazy_static::lazy_static;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use super::fd::io_err;
use crate::error::Error;

lazy_static! {
    static ref PAGE_SIZE: u64 = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|v| v as u64)
        .unwrap_or(4096);
}

/// A read-only `MAP_SHARED` mapping of a byte range of a file.
///
/// The requested offset does not need to be page aligned; the mapping
/// starts at the enclosing page boundary and [`data`](Self::data) skips
/// the leading slack.
pub struct Mapping {
    ptr: *mut libc::c_void,
    len: usize,
    skip: usize,
}

// The mapping is read-only and never remapped after construction.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    pub fn map_read(fd: RawFd, offset: u64, len: usize) -> Result<Self, Error> {
        let aligned = offset - (offset % *PAGE_SIZE);
        let skip = (offset - aligned) as usize;

        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len + skip,
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                fd,
                aligned as libc::off_t,
            )
        }
        .map_err(io_err)?;

        Ok(Self {
            ptr,
            len: len + skip,
            skip,
        })
    }

    /// The mapped bytes, starting at the requested offset.
    pub fn data(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts((self.ptr as *const u8).add(self.skip), self.len - self.skip)
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.ptr, self.len) } {
            log::warn!("unable to unmap file region - {}", err);
        }
    }
}
