//! The frame index: in-memory representations of the on-disk index
//! block, lookup by frame, and the structural checks run at open time.

use crate::error::Error;
use crate::tools::mmap::Mapping;

use super::format::{IndexEntry, INDEX_ENTRY_SIZE};

/// In-memory representation of the index block, one variant per open
/// mode.
pub(crate) enum IndexStorage {
    /// Read-only mapping of the on-disk block.
    Mapped(Mapping),
    /// Full image in memory; the tail past the used prefix stays zeroed.
    Owned(Vec<IndexEntry>),
    /// Only the entries not yet written (append mode).
    Tail(Vec<IndexEntry>),
}

pub(crate) struct FrameIndex {
    pub storage: IndexStorage,
    /// Slots allocated on disk.
    pub allocated: u64,
    /// Entries in memory, written or not.
    pub entries: u64,
    /// Entries durably on disk.
    pub written: u64,
}

pub(crate) fn entry_is_valid(
    entry: &IndexEntry,
    file_size: u64,
    allocated: u64,
    committed_names: u64,
) -> bool {
    let len = match entry.data_len() {
        Some(len) => len,
        None => return false,
    };
    entry.location != 0
        && entry.flags == 0
        && entry
            .location
            .checked_add(len)
            .map_or(false, |end| end <= file_size)
        && entry.frame < allocated
        && (entry.id as u64) < committed_names
}

impl FrameIndex {
    /// The entry in slot `pos`, converted to native byte order.
    pub fn entry_at(&self, pos: u64) -> IndexEntry {
        match &self.storage {
            IndexStorage::Mapped(map) => {
                let data = map.data();
                let offset = (pos * INDEX_ENTRY_SIZE) as usize;
                if offset + INDEX_ENTRY_SIZE as usize > data.len() {
                    panic!("index slot out of range");
                }
                let entry: IndexEntry =
                    unsafe { std::ptr::read_unaligned(data.as_ptr().add(offset) as *const IndexEntry) };
                entry.from_le()
            }
            IndexStorage::Owned(image) => image[pos as usize],
            IndexStorage::Tail(_) => panic!("index not loaded"),
        }
    }

    /// Determine the used prefix and the next frame number.
    ///
    /// Binary search for the first unused slot. Every probed entry must
    /// be valid and non-decreasing in frame; only the probes are
    /// examined, so the cost is logarithmic in the allocation.
    pub fn validate(&mut self, file_size: u64, committed_names: u64) -> Result<u64, Error> {
        if self.allocated == 0 {
            self.entries = 0;
            self.written = 0;
            return Ok(0);
        }

        let first = self.entry_at(0);
        if first.location == 0 {
            self.entries = 0;
            self.written = 0;
            return Ok(0);
        }
        if !entry_is_valid(&first, file_size, self.allocated, committed_names) {
            return Err(Error::FileCorrupt("invalid first index entry".to_string()));
        }

        let mut lo = 0u64;
        let mut hi = self.allocated;
        let mut left_frame = first.frame;
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            let entry = self.entry_at(mid);
            if entry.location == 0 {
                hi = mid;
            } else {
                if !entry_is_valid(&entry, file_size, self.allocated, committed_names) {
                    return Err(Error::FileCorrupt(format!(
                        "invalid index entry in slot {}",
                        mid
                    )));
                }
                if entry.frame < left_frame {
                    return Err(Error::FileCorrupt(format!(
                        "frame numbers decrease at index slot {}",
                        mid
                    )));
                }
                left_frame = entry.frame;
                lo = mid;
            }
        }

        self.entries = hi;
        self.written = hi;
        Ok(self.entry_at(lo).frame + 1)
    }

    /// Check every entry of the used prefix, not only the probes the
    /// open path examines.
    pub fn validate_deep(&self, file_size: u64, committed_names: u64) -> Result<(), Error> {
        let mut last_frame = 0u64;
        for pos in 0..self.written {
            let entry = self.entry_at(pos);
            if !entry_is_valid(&entry, file_size, self.allocated, committed_names) {
                return Err(Error::FileCorrupt(format!(
                    "invalid index entry in slot {}",
                    pos
                )));
            }
            if entry.frame < last_frame {
                return Err(Error::FileCorrupt(format!(
                    "frame numbers decrease at index slot {}",
                    pos
                )));
            }
            last_frame = entry.frame;
        }
        Ok(())
    }

    /// Entry for name `id` in `frame`: binary search the committed
    /// prefix for the rightmost slot with `frame <= target`, then scan
    /// leftward while the frame matches.
    ///
    /// Entries buffered for the open frame are not searched; a chunk
    /// becomes observable when its frame is sealed.
    pub fn find(&self, frame: u64, id: u16) -> Option<IndexEntry> {
        let mut lo = 0u64;
        let mut hi = self.written;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.entry_at(mid).frame <= frame {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        let mut pos = lo;
        while pos > 0 {
            let entry = self.entry_at(pos - 1);
            if entry.frame != frame {
                break;
            }
            if entry.id == id {
                return Some(entry);
            }
            pos -= 1;
        }
        None
    }

    /// Append to the in-memory image (read/write mode). The caller grows
    /// the image first when it is full.
    pub fn push_image(&mut self, entry: IndexEntry) {
        match &mut self.storage {
            IndexStorage::Owned(image) => {
                image[self.entries as usize] = entry;
                self.entries += 1;
            }
            _ => panic!("index image not writable"),
        }
    }

    /// Append to the uncommitted tail (append mode).
    pub fn push_tail(&mut self, entry: IndexEntry) -> Result<(), Error> {
        match &mut self.storage {
            IndexStorage::Tail(buffer) => {
                buffer
                    .try_reserve(1)
                    .map_err(|_| Error::MemoryAllocationFailed)?;
                buffer.push(entry);
                self.entries += 1;
                Ok(())
            }
            _ => panic!("index has no tail buffer"),
        }
    }

    /// Entries that still need to reach the disk.
    pub fn unwritten(&self) -> &[IndexEntry] {
        match &self.storage {
            IndexStorage::Owned(image) => &image[self.written as usize..self.entries as usize],
            IndexStorage::Tail(buffer) => buffer,
            IndexStorage::Mapped(_) => &[],
        }
    }

    pub fn mark_written(&mut self) {
        self.written = self.entries;
        if let IndexStorage::Tail(buffer) = &mut self.storage {
            buffer.clear();
        }
    }

    /// Grow the owned image to `new_allocated` slots, zero filled.
    pub fn grow_image(&mut self, new_allocated: u64) -> Result<(), Error> {
        match &mut self.storage {
            IndexStorage::Owned(image) => {
                let additional = new_allocated as usize - image.len();
                image
                    .try_reserve_exact(additional)
                    .map_err(|_| Error::MemoryAllocationFailed)?;
                image.resize(new_allocated as usize, IndexEntry::zeroed());
                self.allocated = new_allocated;
                Ok(())
            }
            _ => panic!("index image not growable"),
        }
    }

    /// The whole owned image, used slots and zeroed tail.
    pub fn image(&self) -> &[IndexEntry] {
        match &self.storage {
            IndexStorage::Owned(image) => image,
            _ => panic!("index image not loaded"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::format::ChunkType;

    // one u8 chunk per entry, payloads packed from offset 1024
    fn index_with(frames: &[u64]) -> FrameIndex {
        let mut image = vec![IndexEntry::zeroed(); 16];
        for (i, &frame) in frames.iter().enumerate() {
            image[i] = IndexEntry::new(frame, 1024 + i as u64, 1, 1, 0, ChunkType::U8.code());
        }
        FrameIndex {
            storage: IndexStorage::Owned(image),
            allocated: 16,
            entries: 0,
            written: 0,
        }
    }

    #[test]
    fn validate_empty() {
        let mut index = index_with(&[]);
        assert_eq!(index.validate(4096, 1).unwrap(), 0);
        assert_eq!(index.entries, 0);
    }

    #[test]
    fn validate_prefix() {
        let mut index = index_with(&[0, 0, 1, 3, 3]);
        assert_eq!(index.validate(4096, 1).unwrap(), 4);
        assert_eq!(index.entries, 5);
        assert_eq!(index.written, 5);
        index.validate_deep(4096, 1).unwrap();
    }

    #[test]
    fn validate_rejects_bad_id() {
        let mut index = index_with(&[0, 1]);
        // no names committed, so id 0 is out of range
        assert!(matches!(
            index.validate(4096, 0),
            Err(Error::FileCorrupt(_))
        ));
    }

    #[test]
    fn deep_validate_rejects_regression() {
        let mut index = index_with(&[0, 1, 2, 1]);
        index.entries = 4;
        index.written = 4;
        assert!(matches!(
            index.validate_deep(4096, 1),
            Err(Error::FileCorrupt(_))
        ));
    }

    #[test]
    fn find_by_frame_and_id() {
        let mut image = vec![IndexEntry::zeroed(); 16];
        image[0] = IndexEntry::new(0, 1024, 1, 1, 0, ChunkType::U8.code());
        image[1] = IndexEntry::new(0, 1025, 1, 1, 1, ChunkType::U8.code());
        image[2] = IndexEntry::new(2, 1026, 1, 1, 0, ChunkType::U8.code());
        let index = FrameIndex {
            storage: IndexStorage::Owned(image),
            allocated: 16,
            entries: 3,
            written: 3,
        };

        assert_eq!(index.find(0, 1).unwrap().location, 1025);
        assert_eq!(index.find(0, 0).unwrap().location, 1024);
        assert_eq!(index.find(2, 0).unwrap().location, 1026);
        // frame 1 holds nothing
        assert_eq!(index.find(1, 0), None);
        // name never written in frame 2
        assert_eq!(index.find(2, 1), None);
        // past the last frame
        assert_eq!(index.find(7, 0), None);
    }

    #[test]
    fn find_ignores_unwritten_entries() {
        let mut image = vec![IndexEntry::zeroed(); 16];
        image[0] = IndexEntry::new(0, 1024, 1, 1, 0, ChunkType::U8.code());
        image[1] = IndexEntry::new(1, 1025, 1, 1, 0, ChunkType::U8.code());
        let index = FrameIndex {
            storage: IndexStorage::Owned(image),
            allocated: 16,
            entries: 2,
            written: 1,
        };

        assert_eq!(index.find(0, 0).unwrap().location, 1024);
        // buffered for the open frame, not sealed yet
        assert_eq!(index.find(1, 0), None);
    }
}
