//! Positional I/O with retry, and the small syscall wrappers the engine
//! consumes. Positional reads and writes never disturb the descriptor's
//! cursor, so a shared read-only mapping can coexist with them.

use std::io;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::sys::uio::{pread, pwrite};

use crate::error::Error;

// Some platforms reject or truncate single transfers above about 2 GiB.
const MAX_IO_BYTES: usize = 1 << 30;

/// Buffer size used for on-disk block copies and zero fills.
pub const COPY_BUFFER_SIZE: usize = 16 * 1024;

pub(crate) fn io_err(err: nix::Error) -> Error {
    match err.as_errno() {
        Some(errno) => Error::Io(io::Error::from_raw_os_error(errno as i32)),
        None => Error::Io(io::Error::new(io::ErrorKind::Other, err)),
    }
}

/// Positional read of up to `buf.len()` bytes at `offset`.
///
/// Retries on `EINTR` and chunks large transfers. The result is short only
/// when the end of the file is reached.
pub fn pread_all(fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
    let mut done = 0;
    while done < buf.len() {
        let len = (buf.len() - done).min(MAX_IO_BYTES);
        match pread(
            fd,
            &mut buf[done..done + len],
            (offset + done as u64) as libc::off_t,
        ) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(err) if err.as_errno() == Some(Errno::EINTR) => continue,
            Err(err) => return Err(io_err(err)),
        }
    }
    Ok(done)
}

/// Positional write of the whole buffer at `offset`.
///
/// Regular files never legitimately write short, so a zero-length result
/// is an error.
pub fn pwrite_all(fd: RawFd, buf: &[u8], offset: u64) -> Result<(), Error> {
    let mut done = 0;
    while done < buf.len() {
        let len = (buf.len() - done).min(MAX_IO_BYTES);
        match pwrite(
            fd,
            &buf[done..done + len],
            (offset + done as u64) as libc::off_t,
        ) {
            Ok(0) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "positional write returned zero",
                )));
            }
            Ok(n) => done += n,
            Err(err) if err.as_errno() == Some(Errno::EINTR) => continue,
            Err(err) => return Err(io_err(err)),
        }
    }
    Ok(())
}

/// Block until everything written to `fd` is durable on the backing device.
pub fn fsync(fd: RawFd) -> Result<(), Error> {
    nix::unistd::fsync(fd).map_err(io_err)
}

pub fn truncate(fd: RawFd, size: u64) -> Result<(), Error> {
    nix::unistd::ftruncate(fd, size as libc::off_t).map_err(io_err)
}

pub fn file_size(fd: RawFd) -> Result<u64, Error> {
    let stat = nix::sys::stat::fstat(fd).map_err(io_err)?;
    Ok(stat.st_size as u64)
}

/// Zero fill `len` bytes at `offset` through a bounded buffer.
pub fn write_zeros(fd: RawFd, offset: u64, len: u64) -> Result<(), Error> {
    let zeros = vec![0u8; COPY_BUFFER_SIZE];
    let mut done = 0u64;
    while done < len {
        let step = (len - done).min(COPY_BUFFER_SIZE as u64) as usize;
        pwrite_all(fd, &zeros[..step], offset + done)?;
        done += step as u64;
    }
    Ok(())
}

/// Copy `len` bytes from `src` to `dst` within the same file through a
/// bounded buffer. The ranges must not overlap.
pub fn copy_range(fd: RawFd, src: u64, dst: u64, len: u64) -> Result<(), Error> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut done = 0u64;
    while done < len {
        let step = (len - done).min(COPY_BUFFER_SIZE as u64) as usize;
        let got = pread_all(fd, &mut buffer[..step], src + done)?;
        if got < step {
            return Err(Error::FileCorrupt(format!(
                "unexpected end of file while copying a block ({} < {})",
                got, step
            )));
        }
        pwrite_all(fd, &buffer[..step], dst + done)?;
        done += step as u64;
    }
    Ok(())
}
