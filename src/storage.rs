//! Byte-source abstraction shared by every format parser.
//!
//! A [`Storage`] gives parsers a uniform view of a byte stream: sequential
//! reads, peeking, partial reads, backward seeking where the source allows
//! it, and borrowed "temporary" results that avoid copies. Four concrete
//! sources live here (file, memory map, in-memory buffer, gzip stream);
//! the ZIP reader in [`crate::zip_reader`] implements the same trait on
//! top of another storage.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::GzDecoder;
use memmap2::{Mmap, MmapOptions};

use crate::error::StorageError;

/// Flags controlling a single [`Storage::read`] call.
///
/// Combine with `|`: `ReadFlags::PEEK | ReadFlags::ALLOW_PARTIAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadFlags {
    /// The returned bytes may be invalidated by the next non-peek read.
    pub temporary: bool,
    /// Do not advance the cursor; a subsequent read re-observes the bytes.
    pub peek: bool,
    /// At end-of-stream, return an empty slice instead of failing.
    pub allow_empty: bool,
    /// When fewer bytes than requested remain, return what is there.
    pub allow_partial: bool,
}

impl ReadFlags {
    pub const NONE: ReadFlags = ReadFlags {
        temporary: false,
        peek: false,
        allow_empty: false,
        allow_partial: false,
    };
    pub const TEMPORARY: ReadFlags = ReadFlags {
        temporary: true,
        peek: false,
        allow_empty: false,
        allow_partial: false,
    };
    /// Peeked slices live in the lookahead buffer, so a peek is also
    /// temporary by construction.
    pub const PEEK: ReadFlags = ReadFlags {
        temporary: true,
        peek: true,
        allow_empty: false,
        allow_partial: false,
    };
    pub const ALLOW_EMPTY: ReadFlags = ReadFlags {
        temporary: false,
        peek: false,
        allow_empty: true,
        allow_partial: false,
    };
    pub const ALLOW_PARTIAL: ReadFlags = ReadFlags {
        temporary: false,
        peek: false,
        allow_empty: false,
        allow_partial: true,
    };
}

impl std::ops::BitOr for ReadFlags {
    type Output = ReadFlags;

    fn bitor(self, rhs: ReadFlags) -> ReadFlags {
        ReadFlags {
            temporary: self.temporary || rhs.temporary,
            peek: self.peek || rhs.peek,
            allow_empty: self.allow_empty || rhs.allow_empty,
            allow_partial: self.allow_partial || rhs.allow_partial,
        }
    }
}

/// A readable byte source with optional backward seeking.
///
/// `current_position` is the logical offset consumed by the caller;
/// wrappers (a ZIP member) may report a different `original_position`
/// for the backing source. `seek_to` with a target at or past the current
/// position always works (streams emulate it by reading and discarding);
/// backward seeks and `seek_from_back` need `can_seek_back`.
pub trait Storage {
    /// Logical offset of the next byte this storage will serve.
    fn current_position(&self) -> u64;

    /// Position in the backing source; differs for wrapping storages.
    fn original_position(&self) -> u64 {
        self.current_position()
    }

    /// Reads `length` bytes according to `flags`.
    ///
    /// Without `allow_partial` the result is exactly `length` bytes or an
    /// error; `allow_empty` additionally permits an empty result at
    /// end-of-stream. Borrowed results from stream-like sources are only
    /// valid until the next non-peek read.
    fn read(&mut self, length: u64, flags: ReadFlags) -> Result<Cow<'_, [u8]>, StorageError>;

    /// Whether this storage supports backward seeks. With `allow_detect`
    /// the storage may probe its handle once and cache the answer.
    fn can_seek_back(&mut self, allow_detect: bool) -> bool;

    /// Moves the cursor to an absolute logical position.
    fn seek_to(&mut self, position: u64) -> Result<(), StorageError>;

    /// Moves the cursor to `offset_from_end` bytes before the end.
    fn seek_from_back(&mut self, offset_from_end: u64) -> Result<(), StorageError>;

    /// Releases the underlying OS handle, if any. Reads after `close`
    /// fail with [`StorageError::Closed`].
    fn close(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Applies the end-of-stream rules to a read request.
///
/// Returns how many bytes to serve given what is available.
pub(crate) fn checked_read_len(
    available: usize,
    want: usize,
    flags: ReadFlags,
) -> Result<usize, StorageError> {
    if available >= want {
        return Ok(want);
    }
    if flags.allow_partial {
        return Ok(available);
    }
    if available == 0 && flags.allow_empty {
        return Ok(0);
    }
    Err(StorageError::UnexpectedEof)
}

pub(crate) fn want_len(length: u64) -> Result<usize, StorageError> {
    usize::try_from(length).map_err(|_| StorageError::LengthOverflow { length })
}

// ---- Streaming base ----

/// Lookahead state shared by the stream-like sources.
///
/// Satisfies `peek` and `temporary` reads out of an internal buffer and
/// copies into caller-owned memory when `temporary` is not set.
#[derive(Default)]
struct StreamState {
    buf: Vec<u8>,
    start: usize,
    position: u64,
}

impl StreamState {
    fn available(&self) -> usize {
        self.buf.len() - self.start
    }

    fn reset_to(&mut self, position: u64) {
        self.buf.clear();
        self.start = 0;
        self.position = position;
    }

    /// Grows the lookahead until `want` bytes are buffered or the source
    /// is exhausted.
    fn fill(&mut self, src: &mut dyn Read, want: usize) -> Result<usize, StorageError> {
        if self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        } else if self.start >= 8192 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        while self.available() < want {
            let missing = want - self.available();
            let old_len = self.buf.len();
            self.buf.resize(old_len + missing, 0);
            let n = src.read(&mut self.buf[old_len..])?;
            self.buf.truncate(old_len + n);
            if n == 0 {
                break;
            }
        }
        Ok(self.available())
    }

    fn read(
        &mut self,
        src: &mut dyn Read,
        length: u64,
        flags: ReadFlags,
    ) -> Result<Cow<'_, [u8]>, StorageError> {
        let want = want_len(length)?;

        // Fast path: a plain owned read with nothing buffered.
        if !flags.peek && self.available() == 0 && !flags.temporary {
            let mut out = vec![0u8; want];
            let mut filled = 0;
            while filled < want {
                let n = src.read(&mut out[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            return match checked_read_len(filled, want, flags) {
                Ok(n) => {
                    out.truncate(n);
                    self.position += n as u64;
                    Ok(Cow::Owned(out))
                }
                Err(e) => {
                    // Keep the short read observable by later calls.
                    out.truncate(filled);
                    self.buf = out;
                    self.start = 0;
                    Err(e)
                }
            };
        }

        let available = self.fill(src, want)?;
        let n = checked_read_len(available, want, flags)?;
        let start = self.start;
        if !flags.peek {
            self.start += n;
            self.position += n as u64;
        }
        let slice = &self.buf[start..start + n];
        if flags.temporary {
            Ok(Cow::Borrowed(slice))
        } else {
            Ok(Cow::Owned(slice.to_vec()))
        }
    }

    /// Consumes `count` bytes, emulating a forward seek.
    fn skip(&mut self, src: &mut dyn Read, mut count: u64) -> Result<(), StorageError> {
        let buffered = (self.available() as u64).min(count);
        self.start += buffered as usize;
        self.position += buffered;
        count -= buffered;
        let mut scratch = [0u8; 8192];
        while count > 0 {
            let chunk = count.min(scratch.len() as u64) as usize;
            let n = src.read(&mut scratch[..chunk])?;
            if n == 0 {
                return Err(StorageError::UnexpectedEof);
            }
            self.position += n as u64;
            count -= n as u64;
        }
        Ok(())
    }
}

// ---- File ----

/// Storage backed by a plain file handle.
///
/// Seekability is detected lazily with a no-op seek and cached, so pipes
/// and FIFOs opened by path degrade to forward-only streams.
pub struct FileStorage {
    file: Option<File>,
    stream: StreamState,
    seekable: Option<bool>,
}

/// Opens a file as a sequential storage.
pub fn open_file(path: impl AsRef<Path>) -> Result<FileStorage, StorageError> {
    let file = File::open(path)?;
    Ok(FileStorage {
        file: Some(file),
        stream: StreamState::default(),
        seekable: None,
    })
}

impl FileStorage {
    fn file_mut(&mut self) -> Result<&mut File, StorageError> {
        self.file.as_mut().ok_or(StorageError::Closed)
    }
}

impl Storage for FileStorage {
    fn current_position(&self) -> u64 {
        self.stream.position
    }

    fn read(&mut self, length: u64, flags: ReadFlags) -> Result<Cow<'_, [u8]>, StorageError> {
        let file = self.file.as_mut().ok_or(StorageError::Closed)?;
        self.stream.read(file, length, flags)
    }

    fn can_seek_back(&mut self, allow_detect: bool) -> bool {
        if let Some(known) = self.seekable {
            return known;
        }
        if !allow_detect {
            return false;
        }
        let probed = match self.file.as_mut() {
            Some(file) => file.seek(SeekFrom::Current(0)).is_ok(),
            None => false,
        };
        self.seekable = Some(probed);
        probed
    }

    fn seek_to(&mut self, position: u64) -> Result<(), StorageError> {
        let current = self.stream.position;
        if position == current {
            return Ok(());
        }
        if position < current {
            if !self.can_seek_back(true) {
                return Err(StorageError::SeekBackwardUnsupported {
                    target: position,
                    position: current,
                });
            }
            let file = self.file_mut()?;
            file.seek(SeekFrom::Start(position))?;
            self.stream.reset_to(position);
            return Ok(());
        }
        if self.seekable == Some(true) {
            let file = self.file_mut()?;
            file.seek(SeekFrom::Start(position))?;
            self.stream.reset_to(position);
            Ok(())
        } else {
            let file = self.file.as_mut().ok_or(StorageError::Closed)?;
            self.stream.skip(file, position - current)
        }
    }

    fn seek_from_back(&mut self, offset_from_end: u64) -> Result<(), StorageError> {
        if !self.can_seek_back(true) {
            return Err(StorageError::SeekFromEndUnsupported);
        }
        let file = self.file_mut()?;
        let end = file.seek(SeekFrom::End(0))?;
        let target = end
            .checked_sub(offset_from_end)
            .ok_or(StorageError::UnexpectedEof)?;
        file.seek(SeekFrom::Start(target))?;
        self.stream.reset_to(target);
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.file = None;
        Ok(())
    }
}

// ---- Memory map ----

/// Storage over a memory-mapped file. All reads are zero-copy.
pub struct MmapStorage {
    mmap: Option<Mmap>,
    position: u64,
}

/// Memory-maps a file as a fully seekable storage.
pub fn open_mmap(path: impl AsRef<Path>) -> Result<MmapStorage, StorageError> {
    let file = File::open(path)?;
    let mmap = unsafe { MmapOptions::new().map(&file)? };
    Ok(MmapStorage {
        mmap: Some(mmap),
        position: 0,
    })
}

impl Storage for MmapStorage {
    fn current_position(&self) -> u64 {
        self.position
    }

    fn read(&mut self, length: u64, flags: ReadFlags) -> Result<Cow<'_, [u8]>, StorageError> {
        let want = want_len(length)?;
        let data: &[u8] = self.mmap.as_deref().ok_or(StorageError::Closed)?;
        let start = (self.position as usize).min(data.len());
        let n = checked_read_len(data.len() - start, want, flags)?;
        if !flags.peek {
            self.position += n as u64;
        }
        let data: &[u8] = self.mmap.as_deref().expect("checked above");
        Ok(Cow::Borrowed(&data[start..start + n]))
    }

    fn can_seek_back(&mut self, _allow_detect: bool) -> bool {
        true
    }

    fn seek_to(&mut self, position: u64) -> Result<(), StorageError> {
        self.position = position;
        Ok(())
    }

    fn seek_from_back(&mut self, offset_from_end: u64) -> Result<(), StorageError> {
        let len = self.mmap.as_deref().ok_or(StorageError::Closed)?.len() as u64;
        self.position = len
            .checked_sub(offset_from_end)
            .ok_or(StorageError::UnexpectedEof)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.mmap = None;
        Ok(())
    }
}

// ---- In-memory buffer ----

/// Storage over an owned byte buffer; mmap semantics without a file.
#[derive(Debug)]
pub struct MemoryStorage {
    data: Vec<u8>,
    position: u64,
}

/// Wraps a byte buffer as a fully seekable storage.
pub fn from_memory(data: Vec<u8>) -> MemoryStorage {
    MemoryStorage::new(data)
}

impl MemoryStorage {
    pub fn new(data: Vec<u8>) -> Self {
        MemoryStorage { data, position: 0 }
    }
}

impl Storage for MemoryStorage {
    fn current_position(&self) -> u64 {
        self.position
    }

    fn read(&mut self, length: u64, flags: ReadFlags) -> Result<Cow<'_, [u8]>, StorageError> {
        let want = want_len(length)?;
        let start = (self.position as usize).min(self.data.len());
        let n = checked_read_len(self.data.len() - start, want, flags)?;
        if !flags.peek {
            self.position += n as u64;
        }
        Ok(Cow::Borrowed(&self.data[start..start + n]))
    }

    fn can_seek_back(&mut self, _allow_detect: bool) -> bool {
        true
    }

    fn seek_to(&mut self, position: u64) -> Result<(), StorageError> {
        self.position = position;
        Ok(())
    }

    fn seek_from_back(&mut self, offset_from_end: u64) -> Result<(), StorageError> {
        self.position = (self.data.len() as u64)
            .checked_sub(offset_from_end)
            .ok_or(StorageError::UnexpectedEof)?;
        Ok(())
    }
}

// ---- Gzip ----

/// Storage over a gzip-compressed file, decompressed on the fly.
///
/// Never seekable backward; forward seeks read and discard.
pub struct GzipStorage {
    decoder: Option<GzDecoder<BufReader<File>>>,
    stream: StreamState,
}

/// Opens a gzip file as a forward-only storage over its decompressed bytes.
pub fn open_gzip(path: impl AsRef<Path>) -> Result<GzipStorage, StorageError> {
    let file = File::open(path)?;
    Ok(GzipStorage {
        decoder: Some(GzDecoder::new(BufReader::new(file))),
        stream: StreamState::default(),
    })
}

impl Storage for GzipStorage {
    fn current_position(&self) -> u64 {
        self.stream.position
    }

    fn read(&mut self, length: u64, flags: ReadFlags) -> Result<Cow<'_, [u8]>, StorageError> {
        let decoder = self.decoder.as_mut().ok_or(StorageError::Closed)?;
        self.stream.read(decoder, length, flags)
    }

    fn can_seek_back(&mut self, _allow_detect: bool) -> bool {
        false
    }

    fn seek_to(&mut self, position: u64) -> Result<(), StorageError> {
        let current = self.stream.position;
        if position < current {
            return Err(StorageError::SeekBackwardUnsupported {
                target: position,
                position: current,
            });
        }
        let decoder = self.decoder.as_mut().ok_or(StorageError::Closed)?;
        self.stream.skip(decoder, position - current)
    }

    fn seek_from_back(&mut self, _offset_from_end: u64) -> Result<(), StorageError> {
        Err(StorageError::SeekFromEndUnsupported)
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.decoder = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample() -> Vec<u8> {
        (0u8..200).collect()
    }

    #[test]
    fn test_memory_read_exact_and_eof() {
        let mut s = MemoryStorage::new(vec![1, 2, 3]);
        assert_eq!(&*s.read(2, ReadFlags::NONE).unwrap(), &[1, 2]);
        assert_eq!(s.current_position(), 2);
        // Exact read past the end fails without flags.
        assert!(matches!(
            s.read(2, ReadFlags::NONE),
            Err(StorageError::UnexpectedEof)
        ));
        // The failed read did not consume the remaining byte.
        assert_eq!(&*s.read(1, ReadFlags::NONE).unwrap(), &[3]);
        // At end-of-stream: empty only with allow_empty.
        assert!(matches!(
            s.read(1, ReadFlags::NONE),
            Err(StorageError::UnexpectedEof)
        ));
        assert!(s.read(1, ReadFlags::ALLOW_EMPTY).unwrap().is_empty());
    }

    #[test]
    fn test_memory_allow_partial() {
        let mut s = MemoryStorage::new(vec![1, 2, 3]);
        let out = s.read(10, ReadFlags::ALLOW_PARTIAL).unwrap();
        assert_eq!(&*out, &[1, 2, 3]);
        assert_eq!(s.current_position(), 3);
        assert!(s.read(10, ReadFlags::ALLOW_PARTIAL).unwrap().is_empty());
    }

    #[test]
    fn test_memory_peek_does_not_advance() {
        let mut s = MemoryStorage::new(vec![9, 8, 7]);
        assert_eq!(&*s.read(2, ReadFlags::PEEK).unwrap(), &[9, 8]);
        assert_eq!(s.current_position(), 0);
        assert_eq!(&*s.read(2, ReadFlags::NONE).unwrap(), &[9, 8]);
    }

    #[test]
    fn test_memory_seek() {
        let mut s = MemoryStorage::new(sample());
        s.seek_to(100).unwrap();
        assert_eq!(&*s.read(2, ReadFlags::NONE).unwrap(), &[100, 101]);
        s.seek_to(10).unwrap();
        assert_eq!(&*s.read(1, ReadFlags::NONE).unwrap(), &[10]);
        s.seek_from_back(1).unwrap();
        assert_eq!(&*s.read(1, ReadFlags::NONE).unwrap(), &[199]);
    }

    #[test]
    fn test_seek_then_read_equals_read_at() {
        let data = sample();
        let mut a = MemoryStorage::new(data.clone());
        a.seek_to(42).unwrap();
        let want = a.read(8, ReadFlags::NONE).unwrap().into_owned();
        let mut b = MemoryStorage::new(data);
        b.seek_to(42).unwrap();
        assert_eq!(b.read(8, ReadFlags::NONE).unwrap().into_owned(), want);
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&sample()).unwrap();
        tmp.flush().unwrap();

        let mut s = open_file(tmp.path()).unwrap();
        assert!(s.can_seek_back(true));
        assert_eq!(&*s.read(3, ReadFlags::NONE).unwrap(), &[0, 1, 2]);
        // Peek, then confirm the cursor did not move.
        assert_eq!(&*s.read(2, ReadFlags::PEEK).unwrap(), &[3, 4]);
        assert_eq!(&*s.read(2, ReadFlags::NONE).unwrap(), &[3, 4]);
        // Backward seek.
        s.seek_to(1).unwrap();
        assert_eq!(&*s.read(2, ReadFlags::NONE).unwrap(), &[1, 2]);
        // Seek relative to the end.
        s.seek_from_back(4).unwrap();
        assert_eq!(&*s.read(4, ReadFlags::NONE).unwrap(), &[196, 197, 198, 199]);
    }

    #[test]
    fn test_file_storage_failed_read_keeps_bytes() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&[1, 2, 3]).unwrap();
        tmp.flush().unwrap();

        let mut s = open_file(tmp.path()).unwrap();
        assert!(matches!(
            s.read(10, ReadFlags::NONE),
            Err(StorageError::UnexpectedEof)
        ));
        // The short read is still served afterwards.
        assert_eq!(&*s.read(3, ReadFlags::NONE).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn test_file_storage_close() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&[1]).unwrap();
        tmp.flush().unwrap();

        let mut s = open_file(tmp.path()).unwrap();
        s.close().unwrap();
        assert!(matches!(
            s.read(1, ReadFlags::NONE),
            Err(StorageError::Closed)
        ));
    }

    #[test]
    fn test_mmap_storage() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&sample()).unwrap();
        tmp.flush().unwrap();

        let mut s = open_mmap(tmp.path()).unwrap();
        assert!(s.can_seek_back(false));
        assert_eq!(&*s.read(4, ReadFlags::NONE).unwrap(), &[0, 1, 2, 3]);
        s.seek_from_back(2).unwrap();
        assert_eq!(&*s.read(2, ReadFlags::NONE).unwrap(), &[198, 199]);
        assert!(matches!(
            s.read(1, ReadFlags::NONE),
            Err(StorageError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_gzip_storage_streaming() {
        let raw = sample();
        let mut tmp = NamedTempFile::new().unwrap();
        {
            let mut enc =
                flate2::write::GzEncoder::new(&mut tmp, flate2::Compression::default());
            enc.write_all(&raw).unwrap();
            enc.finish().unwrap();
        }
        tmp.flush().unwrap();

        let mut s = open_gzip(tmp.path()).unwrap();
        assert!(!s.can_seek_back(true));
        // Peek is served from the lookahead buffer.
        assert_eq!(&*s.read(4, ReadFlags::PEEK).unwrap(), &[0, 1, 2, 3]);
        assert_eq!(&*s.read(4, ReadFlags::NONE).unwrap(), &[0, 1, 2, 3]);
        // Forward seek is emulated by read-and-discard.
        s.seek_to(100).unwrap();
        assert_eq!(s.current_position(), 100);
        assert_eq!(&*s.read(2, ReadFlags::NONE).unwrap(), &[100, 101]);
        // Backward seek is refused.
        assert!(matches!(
            s.seek_to(0),
            Err(StorageError::SeekBackwardUnsupported { .. })
        ));
        assert!(matches!(
            s.seek_from_back(1),
            Err(StorageError::SeekFromEndUnsupported)
        ));
    }

    #[test]
    fn test_flag_composition() {
        let flags = ReadFlags::PEEK | ReadFlags::ALLOW_PARTIAL;
        assert!(flags.peek && flags.allow_partial && flags.temporary);
        assert!(!flags.allow_empty);
    }
}
