//! The file handle: layout management, the open and commit protocol,
//! and the public chunk operations.

use std::convert::TryFrom;
use std::fs::{File, OpenOptions};
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::tools::fd::{self, COPY_BUFFER_SIZE};
use crate::tools::mmap::Mapping;

use super::format::{self, ChunkType, FileHeader, IndexEntry};
use super::index::{FrameIndex, IndexStorage};
use super::name_table::NameTable;

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// No mutation; the index is mapped rather than copied when the
    /// platform allows it.
    ReadOnly,
    /// Reading and writing; the whole index image is kept in memory.
    ReadWrite,
    /// Writing only; memory holds just the entries of the open frame.
    Append,
}

/// Handle to an open GSD file.
///
/// All operations expect to be called from one thread at a time. Any
/// number of read-only handles can share a file; a writer tolerates no
/// other handle. Dropping the handle unmaps and closes without flushing:
/// chunks not sealed by [`end_frame`](Self::end_frame) stay unreachable.
pub struct GsdFile {
    file: File,
    path: PathBuf,
    mode: OpenMode,
    header: FileHeader,
    index: FrameIndex,
    names: NameTable,
    file_size: u64,
    cur_frame: u64,
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value + (alignment - value % alignment) % alignment
}

fn write_header(fd: RawFd, header: &FileHeader) -> Result<(), Error> {
    let le = header.to_le();
    fd::pwrite_all(fd, format::struct_bytes(&le), 0)
}

fn read_header(fd: RawFd) -> Result<FileHeader, Error> {
    let mut buffer = [0u8; format::HEADER_SIZE as usize];
    let got = fd::pread_all(fd, &mut buffer, 0)?;
    if got < buffer.len() {
        return Err(Error::NotAGsdFile);
    }

    let header = format::struct_from_bytes::<FileHeader>(&buffer).from_le();
    if header.magic != format::GSD_MAGIC {
        return Err(Error::NotAGsdFile);
    }
    if !format::version_is_supported(header.gsd_version) {
        return Err(Error::InvalidGsdFileVersion(header.gsd_version));
    }
    Ok(header)
}

/// Lay out an empty file: header, zeroed index block, zeroed name list,
/// one sync.
fn initialize_file(
    file: &File,
    application: &str,
    schema: &str,
    schema_version: u32,
) -> Result<(), Error> {
    let fd = file.as_raw_fd();
    fd::truncate(fd, 0)?;

    let mut header = FileHeader::zeroed();
    header.magic = format::GSD_MAGIC;
    header.gsd_version = format::GSD_VERSION;
    header.schema_version = schema_version;
    header.index_location = format::HEADER_SIZE;
    header.index_allocated_entries = format::INITIAL_INDEX_ENTRIES;
    header.namelist_location =
        format::HEADER_SIZE + format::INITIAL_INDEX_ENTRIES * format::INDEX_ENTRY_SIZE;
    header.namelist_allocated_entries = format::INITIAL_NAME_ENTRIES;
    format::set_fixed_str(&mut header.application, application);
    format::set_fixed_str(&mut header.schema, schema);

    write_header(fd, &header)?;
    fd::write_zeros(
        fd,
        header.index_location,
        header.index_allocated_entries * format::INDEX_ENTRY_SIZE,
    )?;
    fd::write_zeros(
        fd,
        header.namelist_location,
        header.namelist_allocated_entries * format::NAME_ENTRY_SIZE,
    )?;
    fd::fsync(fd)
}

fn check_block(
    location: u64,
    count: u64,
    entry_size: u64,
    file_size: u64,
    what: &str,
    path: &Path,
) -> Result<(), Error> {
    if location < format::HEADER_SIZE {
        return Err(Error::FileCorrupt(format!(
            "{} block of {:?} overlaps the header",
            what, path
        )));
    }
    let end = count
        .checked_mul(entry_size)
        .and_then(|len| location.checked_add(len))
        .ok_or_else(|| {
            Error::FileCorrupt(format!("{} block extent of {:?} overflows", what, path))
        })?;
    if end > file_size {
        return Err(Error::FileCorrupt(format!(
            "{} block of {:?} extends past the end of the file",
            what, path
        )));
    }
    Ok(())
}

fn load_index_owned(fd: RawFd, header: &FileHeader, path: &Path) -> Result<Vec<IndexEntry>, Error> {
    let count = header.index_allocated_entries as usize;
    let mut image: Vec<IndexEntry> = Vec::new();
    image
        .try_reserve_exact(count)
        .map_err(|_| Error::MemoryAllocationFailed)?;
    image.resize(count, IndexEntry::zeroed());

    let expected = count * size_of::<IndexEntry>();
    let got = fd::pread_all(
        fd,
        format::entries_bytes_mut(&mut image),
        header.index_location,
    )?;
    if got < expected {
        return Err(Error::FileCorrupt(format!(
            "short read of the index block of {:?}",
            path
        )));
    }

    for entry in image.iter_mut() {
        *entry = entry.from_le();
    }
    Ok(image)
}

fn load_index_readonly(fd: RawFd, header: &FileHeader, path: &Path) -> Result<IndexStorage, Error> {
    let len = (header.index_allocated_entries * format::INDEX_ENTRY_SIZE) as usize;
    match Mapping::map_read(fd, header.index_location, len) {
        Ok(map) => Ok(IndexStorage::Mapped(map)),
        Err(err) => {
            log::debug!(
                "unable to map the index block of {:?}, reading it instead - {}",
                path,
                err
            );
            Ok(IndexStorage::Owned(load_index_owned(fd, header, path)?))
        }
    }
}

/// Write index entries at `offset`, converting to little endian through
/// a bounded scratch buffer.
fn write_entries(fd: RawFd, entries: &[IndexEntry], offset: u64) -> Result<(), Error> {
    let step = COPY_BUFFER_SIZE / size_of::<IndexEntry>();
    let mut scratch: Vec<IndexEntry> = Vec::with_capacity(step.min(entries.len()));
    let mut pos = offset;
    for chunk in entries.chunks(step) {
        scratch.clear();
        scratch.extend(chunk.iter().map(|entry| entry.to_le()));
        fd::pwrite_all(fd, format::entries_bytes(&scratch), pos)?;
        pos += (chunk.len() * size_of::<IndexEntry>()) as u64;
    }
    Ok(())
}

impl GsdFile {
    /// Create an empty file and close it again.
    pub fn create(
        path: &Path,
        application: &str,
        schema: &str,
        schema_version: u32,
    ) -> Result<(), Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        initialize_file(&file, application, schema, schema_version)
    }

    /// Create an empty file and open it in `mode`. With `exclusive` the
    /// call fails if the path already exists.
    pub fn create_and_open(
        path: &Path,
        application: &str,
        schema: &str,
        schema_version: u32,
        mode: OpenMode,
        exclusive: bool,
    ) -> Result<Self, Error> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        if exclusive {
            options.create_new(true);
        } else {
            options.truncate(true);
        }
        let file = options.open(path)?;
        initialize_file(&file, application, schema, schema_version)?;
        Self::from_file(file, path.to_owned(), mode)
    }

    /// Open an existing file in `mode`.
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self, Error> {
        let file = match mode {
            OpenMode::ReadOnly => OpenOptions::new().read(true).open(path)?,
            OpenMode::ReadWrite | OpenMode::Append => {
                OpenOptions::new().read(true).write(true).open(path)?
            }
        };
        Self::from_file(file, path.to_owned(), mode)
    }

    fn from_file(file: File, path: PathBuf, mode: OpenMode) -> Result<Self, Error> {
        let fd = file.as_raw_fd();
        let header = read_header(fd)?;
        let file_size = fd::file_size(fd)?;

        if header.index_allocated_entries == 0 || header.namelist_allocated_entries == 0 {
            return Err(Error::FileCorrupt(format!(
                "empty block allocation in {:?}",
                path
            )));
        }
        if header.namelist_allocated_entries > format::INITIAL_NAME_ENTRIES {
            return Err(Error::FileCorrupt(format!(
                "name list of {:?} larger than the id space",
                path
            )));
        }
        check_block(
            header.index_location,
            header.index_allocated_entries,
            format::INDEX_ENTRY_SIZE,
            file_size,
            "index",
            &path,
        )?;
        check_block(
            header.namelist_location,
            header.namelist_allocated_entries,
            format::NAME_ENTRY_SIZE,
            file_size,
            "name list",
            &path,
        )?;

        // the name list is small; always keep a copy in memory
        let namelist_len = (header.namelist_allocated_entries * format::NAME_ENTRY_SIZE) as usize;
        let mut namelist = Vec::new();
        namelist
            .try_reserve_exact(namelist_len)
            .map_err(|_| Error::MemoryAllocationFailed)?;
        namelist.resize(namelist_len, 0u8);
        let got = fd::pread_all(fd, &mut namelist[..], header.namelist_location)?;
        if got < namelist_len {
            return Err(Error::FileCorrupt(format!(
                "short read of the name list of {:?}",
                path
            )));
        }
        let names = NameTable::load(namelist, header.namelist_allocated_entries as usize);

        let storage = match mode {
            OpenMode::ReadOnly | OpenMode::Append => load_index_readonly(fd, &header, &path)?,
            OpenMode::ReadWrite => IndexStorage::Owned(load_index_owned(fd, &header, &path)?),
        };
        let mut index = FrameIndex {
            storage,
            allocated: header.index_allocated_entries,
            entries: 0,
            written: 0,
        };
        let cur_frame = index.validate(file_size, names.committed() as u64)?;

        if mode == OpenMode::Append {
            // the committed prefix is known now; drop the mapping and
            // buffer only what the open frame appends
            index.storage = IndexStorage::Tail(Vec::new());
        }

        log::debug!(
            "opened {:?} ({:?}, {} frames, {} index entries, {} names)",
            path,
            mode,
            cur_frame,
            index.entries,
            names.committed()
        );

        Ok(Self {
            file,
            path,
            mode,
            header,
            index,
            names,
            file_size,
            cur_frame,
        })
    }

    /// Number of sealed frames; also the number of the open frame.
    pub fn nframes(&self) -> u64 {
        self.cur_frame
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn application(&self) -> &str {
        format::fixed_str(&self.header.application)
    }

    pub fn schema(&self) -> &str {
        format::fixed_str(&self.header.schema)
    }

    pub fn schema_version(&self) -> u32 {
        self.header.schema_version
    }

    pub fn gsd_version(&self) -> u32 {
        self.header.gsd_version
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Write a chunk of `n` rows and `m` columns into the open frame.
    ///
    /// The payload goes to the end of the file immediately; it becomes
    /// visible to readers once the frame is sealed by
    /// [`end_frame`](Self::end_frame).
    pub fn write_chunk(
        &mut self,
        name: &str,
        chunk_type: ChunkType,
        n: u64,
        m: u32,
        flags: u8,
        data: &[u8],
    ) -> Result<(), Error> {
        if self.mode == OpenMode::ReadOnly {
            return Err(Error::FileMustBeWritable);
        }
        if name.is_empty() {
            return Err(Error::InvalidArgument("empty chunk name"));
        }
        if n == 0 || m == 0 {
            return Err(Error::InvalidArgument("zero chunk extent"));
        }
        if flags != 0 {
            return Err(Error::InvalidArgument("nonzero flags"));
        }
        let len = n
            .checked_mul(m as u64)
            .and_then(|v| v.checked_mul(chunk_type.size() as u64))
            .ok_or(Error::InvalidArgument("chunk extent overflows"))?;
        if data.len() as u64 != len {
            return Err(Error::InvalidArgument(
                "data length does not match the chunk extent",
            ));
        }

        let id = self.names.lookup_or_append(name.as_bytes())?;

        // payload first: if anything later fails, these bytes are
        // unreachable dead space and the file stays consistent
        let location = self.file_size;
        fd::pwrite_all(self.file.as_raw_fd(), data, location)?;
        self.file_size += len;

        let entry = IndexEntry::new(self.cur_frame, location, n, m, id, chunk_type.code());
        match self.mode {
            OpenMode::ReadWrite => {
                if self.index.entries == self.index.allocated {
                    self.grow_index_image()?;
                }
                self.index.push_image(entry);
            }
            OpenMode::Append => {
                self.index.push_tail(entry)?;
            }
            OpenMode::ReadOnly => unreachable!(),
        }
        Ok(())
    }

    /// Seal the open frame: make its names, index entries, and payloads
    /// durable and its chunks visible.
    ///
    /// With nothing new to flush this leaves the file untouched.
    pub fn end_frame(&mut self) -> Result<(), Error> {
        if self.mode == OpenMode::ReadOnly {
            return Err(Error::FileMustBeWritable);
        }
        self.cur_frame += 1;

        // names first: an index entry on disk must never reference a
        // name that is not
        self.flush_names()?;

        if !self.index.unwritten().is_empty() {
            if self.mode == OpenMode::Append {
                let needed = self.index.written + self.index.unwritten().len() as u64;
                if needed > self.index.allocated {
                    self.grow_index_on_disk(needed)?;
                }
            }
            let offset =
                self.header.index_location + self.index.written * format::INDEX_ENTRY_SIZE;
            write_entries(self.file.as_raw_fd(), self.index.unwritten(), offset)?;
            fd::fsync(self.file.as_raw_fd())?;
            self.index.mark_written();
        }

        self.names.publish();
        Ok(())
    }

    /// Entry for `name` in `frame`, if that chunk exists. Append handles
    /// cannot look anything up and always get `None`.
    pub fn find_chunk(&self, frame: u64, name: &str) -> Option<IndexEntry> {
        if self.mode == OpenMode::Append {
            return None;
        }
        let id = self.names.lookup(name.as_bytes())?;
        self.index.find(frame, id)
    }

    /// Read the payload of `entry` into `buffer`, replacing its
    /// contents. The extent is revalidated against the current file
    /// size.
    pub fn read_chunk(&self, entry: &IndexEntry, buffer: &mut Vec<u8>) -> Result<(), Error> {
        if self.mode == OpenMode::Append {
            return Err(Error::FileMustBeReadable);
        }
        let len = entry
            .data_len()
            .ok_or(Error::InvalidArgument("unknown type code"))?;
        if entry.location == 0 {
            return Err(Error::InvalidArgument("entry has no payload"));
        }
        let end = entry.location.checked_add(len).ok_or_else(|| {
            Error::FileCorrupt(format!("payload extent in {:?} overflows", self.path))
        })?;
        if end > self.file_size {
            return Err(Error::FileCorrupt(format!(
                "payload extends past the end of {:?}",
                self.path
            )));
        }

        let len = usize::try_from(len).map_err(|_| Error::MemoryAllocationFailed)?;
        buffer.clear();
        buffer
            .try_reserve_exact(len)
            .map_err(|_| Error::MemoryAllocationFailed)?;
        buffer.resize(len, 0u8);

        let got = fd::pread_all(self.file.as_raw_fd(), &mut buffer[..], entry.location)?;
        if got < len {
            return Err(Error::FileCorrupt(format!(
                "unexpected end of file reading a chunk of {:?}",
                self.path
            )));
        }
        Ok(())
    }

    /// Committed names starting with `prefix`, in name order. Pass the
    /// previously returned name to continue the enumeration.
    pub fn find_matching_chunk_name(&self, prefix: &str, prev: Option<&str>) -> Option<&str> {
        self.names
            .find_matching(prefix.as_bytes(), prev.map(|s| s.as_bytes()))
    }

    /// Check every committed index entry instead of only the probes the
    /// open path examines.
    pub fn validate_all(&self) -> Result<(), Error> {
        if self.mode == OpenMode::Append {
            return Err(Error::FileMustBeReadable);
        }
        self.index
            .validate_deep(self.file_size, self.names.committed() as u64)
    }

    /// Discard every frame and chunk, keeping the application and schema
    /// metadata, and leave the handle open on the empty file.
    pub fn truncate(&mut self) -> Result<(), Error> {
        if self.mode == OpenMode::ReadOnly {
            return Err(Error::FileMustBeWritable);
        }
        let application = self.application().to_owned();
        let schema = self.schema().to_owned();
        let schema_version = self.header.schema_version;

        // release any mapping before the block it covers disappears
        self.index.storage = IndexStorage::Tail(Vec::new());

        initialize_file(&self.file, &application, &schema, schema_version)?;

        *self = Self::from_file(self.file.try_clone()?, self.path.clone(), self.mode)?;
        Ok(())
    }

    /// Write pending names at their slots and make them durable. They
    /// stay invisible to lookup until the frame ends.
    fn flush_names(&mut self) -> Result<(), Error> {
        let fd = self.file.as_raw_fd();
        match self.names.pending() {
            None => return Ok(()),
            Some((first_slot, bytes)) => {
                let offset =
                    self.header.namelist_location + first_slot as u64 * format::NAME_ENTRY_SIZE;
                fd::pwrite_all(fd, bytes, offset)?;
            }
        }
        fd::fsync(fd)?;
        self.names.mark_committed();
        Ok(())
    }

    /// Double the index (read/write mode): rewrite the grown image at
    /// the end of the file, sync it, then swing the header over and sync
    /// again. A crash between the two syncs leaves the old header and
    /// the old, still valid index in effect.
    fn grow_index_image(&mut self) -> Result<(), Error> {
        let fd = self.file.as_raw_fd();

        // entries in the new image may reference names from the open
        // frame; those must reach the disk first
        self.flush_names()?;

        let new_allocated = self.index.allocated * 2;
        self.index.grow_image(new_allocated)?;

        // keep mapped readers aligned: start the block on an entry
        // boundary
        let location = align_up(self.file_size, format::INDEX_ENTRY_SIZE);
        write_entries(fd, self.index.image(), location)?;
        fd::fsync(fd)?;

        self.header.index_location = location;
        self.header.index_allocated_entries = new_allocated;
        write_header(fd, &self.header)?;
        fd::fsync(fd)?;

        self.index.written = self.index.entries;
        self.file_size = location + new_allocated * format::INDEX_ENTRY_SIZE;
        log::debug!(
            "relocated the index of {:?} to offset {} ({} slots)",
            self.path,
            location,
            new_allocated
        );
        Ok(())
    }

    /// Grow the index without an in-memory image (append mode): copy the
    /// old block to the end of the file through a bounded buffer, zero
    /// the new tail, then swing the header over with the same two-sync
    /// ordering as the read/write path.
    fn grow_index_on_disk(&mut self, needed: u64) -> Result<(), Error> {
        let fd = self.file.as_raw_fd();

        let mut new_allocated = self.index.allocated;
        while new_allocated < needed {
            new_allocated *= 2;
        }

        let location = align_up(self.file_size, format::INDEX_ENTRY_SIZE);
        let old_len = self.index.allocated * format::INDEX_ENTRY_SIZE;
        fd::copy_range(fd, self.header.index_location, location, old_len)?;
        fd::write_zeros(
            fd,
            location + old_len,
            (new_allocated - self.index.allocated) * format::INDEX_ENTRY_SIZE,
        )?;
        fd::fsync(fd)?;

        self.header.index_location = location;
        self.header.index_allocated_entries = new_allocated;
        write_header(fd, &self.header)?;
        fd::fsync(fd)?;

        self.index.allocated = new_allocated;
        self.file_size = location + new_allocated * format::INDEX_ENTRY_SIZE;
        log::debug!(
            "relocated the index of {:?} to offset {} ({} slots)",
            self.path,
            location,
            new_allocated
        );
        Ok(())
    }
}
