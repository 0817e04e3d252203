//! Shared tensor-reader contract and the region-scoped read helper.

use std::borrow::Cow;

use crate::error::{Error, StorageError};
use crate::models::TensorInfo;
use crate::storage::{want_len, ReadFlags, Storage};

/// Uniform iteration surface over a parsed tensor container.
///
/// A reader yields buffers in the order its format dictates; within the
/// current buffer, [`TensorReader::read`] behaves like a storage read
/// scoped to the buffer's byte range (lengths clamp to what remains of
/// the region, and the end-of-region follows the `allow_empty` /
/// `allow_partial` rules).
pub trait TensorReader: std::fmt::Debug {
    /// Advances to the next buffer; `false` once none remain.
    fn read_next_buffer(&mut self) -> Result<bool, Error>;

    /// Tensors whose data lies entirely within the current buffer, with
    /// buffer-relative offsets, sorted by `offset_start`.
    fn tensors_in_buffer(&self) -> &[TensorInfo];

    /// Byte length of the current buffer.
    fn buffer_size(&self) -> u64;

    /// Reads from the current buffer at the reader's cursor.
    fn read(&mut self, length: u64, flags: ReadFlags) -> Result<Cow<'_, [u8]>, Error>;

    /// Metadata for every tensor in the buffers not yet iterated, with
    /// offsets set to [`TensorInfo::UNKNOWN_OFFSET`] because they cross
    /// buffers. Consumes the remaining iteration.
    fn read_all_tensor_infos(&mut self) -> Result<Vec<TensorInfo>, Error>;
}

/// Iteration state shared by the single-buffer readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferState {
    Pending,
    Current,
    Finished,
}

/// A `(offset, size)` sub-view of a storage, with its own cursor.
///
/// Performs the clamp-and-delegate that gives each buffer storage-like
/// read semantics.
#[derive(Debug, Clone)]
pub(crate) struct Region {
    pub offset: u64,
    pub size: u64,
    pub position: u64,
}

impl Region {
    pub fn new(offset: u64, size: u64) -> Self {
        Region {
            offset,
            size,
            position: 0,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.size - self.position
    }

    /// Region-scoped read: clamps `length` to what remains and delegates
    /// to the underlying storage.
    pub fn read<'a>(
        &mut self,
        storage: &'a mut dyn Storage,
        length: u64,
        flags: ReadFlags,
    ) -> Result<Cow<'a, [u8]>, StorageError> {
        want_len(length)?;
        let clamped = length.min(self.remaining());
        if clamped == 0 {
            if length > 0 && self.remaining() == 0 && !flags.allow_empty && !flags.allow_partial
            {
                return Err(StorageError::UnexpectedEof);
            }
            return Ok(Cow::Borrowed(&[]));
        }
        let out = storage.read(clamped, flags)?;
        if !flags.peek {
            self.position += out.len() as u64;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_region_clamps_and_delegates() {
        let mut storage = MemoryStorage::new((0u8..100).collect());
        storage.seek_to(10).unwrap();
        let mut region = Region::new(10, 5);

        // A long read clamps to the region, no flag needed.
        let out = region.read(&mut storage, 100, ReadFlags::NONE).unwrap();
        assert_eq!(&*out, &[10, 11, 12, 13, 14]);
        assert_eq!(region.remaining(), 0);

        // Past the end: empty only when flagged.
        assert!(matches!(
            region.read(&mut storage, 1, ReadFlags::NONE),
            Err(StorageError::UnexpectedEof)
        ));
        assert!(region
            .read(&mut storage, 1, ReadFlags::ALLOW_EMPTY)
            .unwrap()
            .is_empty());
        assert!(region
            .read(&mut storage, 1, ReadFlags::ALLOW_PARTIAL)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_region_peek() {
        let mut storage = MemoryStorage::new((0u8..100).collect());
        let mut region = Region::new(0, 10);
        let out = region.read(&mut storage, 4, ReadFlags::PEEK).unwrap();
        assert_eq!(&*out, &[0, 1, 2, 3]);
        assert_eq!(region.position, 0);
        let out = region.read(&mut storage, 4, ReadFlags::NONE).unwrap();
        assert_eq!(&*out, &[0, 1, 2, 3]);
        assert_eq!(region.position, 4);
    }

    #[test]
    fn test_region_zero_length_read() {
        let mut storage = MemoryStorage::new(vec![1, 2, 3]);
        let mut region = Region::new(0, 3);
        assert!(region.read(&mut storage, 0, ReadFlags::NONE).unwrap().is_empty());
        assert_eq!(region.position, 0);
    }
}
