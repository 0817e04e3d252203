//! ZIP archive reader that itself implements the storage contract.
//!
//! PyTorch checkpoints are stored-only ZIP archives, so this reader only
//! accepts compression method 0 and unencrypted members. It runs in one of
//! two modes: when the backing storage can seek backward it walks the
//! central directory (including the ZIP64 records), otherwise it streams
//! local headers in file order. Streamed members whose local header sets
//! the length-at-end flag are delimited by scanning for a `PK\x07\x08`
//! data descriptor whose CRC32 matches the running CRC32 of the payload;
//! bytes are withheld from the caller until a candidate is accepted.
//!
//! Within a member the reader exposes member-relative positions, so a
//! format parser can consume a member exactly as it would a plain file.

use std::borrow::Cow;
use std::collections::VecDeque;

use log::debug;

use crate::error::{Error, StorageError};
use crate::storage::{checked_read_len, want_len, ReadFlags, Storage};
use crate::utils::{u16_at, u32_at, u64_at, Crc32};

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;
const EOCD64_LOCATOR_SIG: u32 = 0x0706_4b50;
const EOCD64_SIG: u32 = 0x0606_4b50;
const DATA_DESCRIPTOR_SIG: &[u8; 4] = b"PK\x07\x08";

const FLAG_ENCRYPTED: u16 = 0x0001;
const FLAG_LENGTH_AT_END: u16 = 0x0008;
const METHOD_STORED: u16 = 0;
const ZIP64_EXTRA_ID: u16 = 0x0001;

const EOCD_LEN: u64 = 22;
const EOCD64_LOCATOR_LEN: u64 = 20;
const EOCD64_LEN: u64 = 56;
const LOCAL_HEADER_LEN: usize = 30;
const CENTRAL_HEADER_LEN: usize = 46;

/// Metadata for one archive member.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    pub filename: String,
    pub local_header_offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub general_purpose_flags: u16,
    /// Whether the sizes are known before the member is read to its end.
    pub has_length: bool,
    pub is_zip64: bool,
    /// Whether the metadata above is trustworthy; length-at-end members
    /// become valid once their data descriptor has been located.
    pub valid: bool,
}

impl ZipEntry {
    fn length_at_end(&self) -> bool {
        self.general_purpose_flags & FLAG_LENGTH_AT_END != 0
    }
}

impl std::fmt::Debug for ZipReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipReader").finish_non_exhaustive()
    }
}

/// Reader over a stored-only ZIP archive.
pub struct ZipReader {
    storage: Box<dyn Storage>,
    seekable: bool,
    /// Remaining central-directory entries (seekable mode only).
    entries: VecDeque<ZipEntry>,
    current: Option<ZipEntry>,
    /// Absolute payload offset of the current member (seekable mode).
    data_offset: u64,
    /// Member-relative bytes released to the caller.
    member_pos: u64,
    member_done: bool,
    finished: bool,
    // Streaming-mode lookahead over the backing storage. Offsets below
    // (`verified`, `descriptor_at`) are relative to `start`.
    buf: Vec<u8>,
    start: usize,
    source_eof: bool,
    /// CRC32 over the payload bytes already released to the caller.
    crc: Crc32,
    /// Prefix of the lookahead confirmed to be payload (no accepted
    /// descriptor candidate can start inside it).
    verified: usize,
    /// Offset of an accepted data descriptor, once found.
    descriptor_at: Option<usize>,
}

impl ZipReader {
    /// Opens an archive over `storage`, probing it for seekability.
    pub fn new(mut storage: Box<dyn Storage>) -> Result<Self, Error> {
        let seekable = storage.can_seek_back(true);
        let entries = if seekable {
            parse_central_directory(&mut *storage)?
        } else {
            VecDeque::new()
        };
        debug!(
            "zip: {} mode, {} central-directory entries",
            if seekable { "seekable" } else { "streaming" },
            entries.len()
        );
        Ok(ZipReader {
            storage,
            seekable,
            entries,
            current: None,
            data_offset: 0,
            member_pos: 0,
            member_done: false,
            finished: false,
            buf: Vec::new(),
            start: 0,
            source_eof: false,
            crc: Crc32::new(),
            verified: 0,
            descriptor_at: None,
        })
    }

    /// The member currently open for reading, if any.
    pub fn current_entry(&self) -> Option<&ZipEntry> {
        self.current.as_ref()
    }

    /// Advances to the next member, consuming whatever remains of the
    /// current one. Returns `None` once all members are exhausted.
    pub fn read_next_file(&mut self) -> Result<Option<&ZipEntry>, Error> {
        if self.finished {
            return Ok(None);
        }
        if self.seekable {
            match self.entries.pop_front() {
                Some(entry) => {
                    self.open_seekable_entry(entry)?;
                    Ok(self.current.as_ref())
                }
                None => {
                    self.finished = true;
                    self.current = None;
                    Ok(None)
                }
            }
        } else {
            self.finish_streaming_member()?;
            self.open_streaming_entry()
        }
    }

    /// Consumes the rest of the current member, leaving the cursor at its
    /// end. In streaming mode this is how an unknown length gets resolved.
    pub fn seek_to_end(&mut self) -> Result<(), StorageError> {
        let Some(entry) = self.current.as_ref() else {
            return Ok(());
        };
        if entry.has_length {
            let size = entry.uncompressed_size;
            self.seek_to(size)
        } else {
            while !self.member_done {
                let n = self
                    .read(65536, ReadFlags::TEMPORARY | ReadFlags::ALLOW_PARTIAL)?
                    .len();
                if n == 0 && !self.member_done {
                    return Err(StorageError::UnexpectedEof);
                }
            }
            Ok(())
        }
    }

    // ---- Seekable mode ----

    fn open_seekable_entry(&mut self, entry: ZipEntry) -> Result<(), Error> {
        self.storage.seek_to(entry.local_header_offset)?;
        let fixed = self
            .storage
            .read(LOCAL_HEADER_LEN as u64, ReadFlags::NONE)?
            .into_owned();
        if u32_at(&fixed, 0) != LOCAL_HEADER_SIG {
            return Err(Error::InvalidFileStructure(format!(
                "local file header signature mismatch for '{}'",
                entry.filename
            )));
        }
        let flags = u16_at(&fixed, 6);
        let method = u16_at(&fixed, 8);
        if flags & FLAG_ENCRYPTED != 0 {
            return Err(Error::EncryptedEntry);
        }
        if method != METHOD_STORED {
            return Err(Error::UnsupportedCompression(method));
        }
        let mut local_compressed = u32_at(&fixed, 18) as u64;
        let mut local_uncompressed = u32_at(&fixed, 22) as u64;
        let name_len = u16_at(&fixed, 26) as u64;
        let extra_len = u16_at(&fixed, 28) as u64;

        let after_name = self.storage.current_position() + name_len;
        self.storage.seek_to(after_name)?;
        let extra = self.storage.read(extra_len, ReadFlags::NONE)?.into_owned();
        let mut local_zip64 = false;
        parse_zip64_extra(
            &extra,
            &mut local_uncompressed,
            &mut local_compressed,
            None,
            &mut local_zip64,
        )?;

        if entry.length_at_end() {
            // Local sizes are written as zero; trust the central directory.
        } else if local_compressed != entry.compressed_size
            || local_uncompressed != entry.uncompressed_size
        {
            return Err(Error::InvalidFileStructure(format!(
                "local header sizes for '{}' disagree with the central directory",
                entry.filename
            )));
        }

        self.data_offset = self.storage.current_position();
        self.member_pos = 0;
        self.member_done = false;
        self.current = Some(entry);
        Ok(())
    }

    // ---- Streaming mode ----

    fn finish_streaming_member(&mut self) -> Result<(), Error> {
        if self.member_done {
            return Ok(());
        }
        let Some(entry) = self.current.as_ref() else {
            return Ok(());
        };
        let length_at_end = entry.length_at_end();
        let has_length = entry.has_length;
        let is_zip64 = entry.is_zip64;
        if has_length {
            let size = entry.uncompressed_size;
            let remaining = size - self.member_pos;
            self.stream_discard(remaining)?;
            if length_at_end {
                // A descriptor trails the payload even though the local
                // header already carried the sizes.
                self.skip_trailing_descriptor(is_zip64)?;
            }
        } else {
            self.seek_to_end()?;
        }
        self.member_done = true;
        Ok(())
    }

    fn skip_trailing_descriptor(&mut self, is_zip64: bool) -> Result<(), StorageError> {
        let fields = if is_zip64 { 20 } else { 12 };
        let head = self.stream_fill(4)?;
        if head >= 4 && self.lookahead()[..4] == *DATA_DESCRIPTOR_SIG {
            self.stream_consume_exact(4 + fields)?;
        } else {
            // Old writers omit the signature.
            self.stream_consume_exact(fields)?;
        }
        Ok(())
    }

    fn open_streaming_entry(&mut self) -> Result<Option<&ZipEntry>, Error> {
        let header_offset = self.stream_position();
        let got = self.stream_fill(4)?;
        if got == 0 {
            self.finished = true;
            self.current = None;
            return Ok(None);
        }
        if got < 4 {
            return Err(Error::InvalidFileStructure(
                "truncated ZIP signature".to_string(),
            ));
        }
        let sig = u32_at(self.lookahead(), 0);
        if sig != LOCAL_HEADER_SIG {
            if sig == CENTRAL_HEADER_SIG
                || sig == EOCD_SIG
                || sig == EOCD64_SIG
                || sig == EOCD64_LOCATOR_SIG
            {
                // Start of the central directory: no more members.
                self.finished = true;
                self.current = None;
                return Ok(None);
            }
            return Err(Error::InvalidFileStructure(format!(
                "unexpected ZIP signature 0x{:08x}",
                sig
            )));
        }

        let fixed = self.stream_read_exact(LOCAL_HEADER_LEN)?;
        let flags = u16_at(&fixed, 6);
        let method = u16_at(&fixed, 8);
        if flags & FLAG_ENCRYPTED != 0 {
            return Err(Error::EncryptedEntry);
        }
        if method != METHOD_STORED {
            return Err(Error::UnsupportedCompression(method));
        }
        let mut compressed = u32_at(&fixed, 18) as u64;
        let mut uncompressed = u32_at(&fixed, 22) as u64;
        let name_len = u16_at(&fixed, 26) as usize;
        let extra_len = u16_at(&fixed, 28) as usize;

        let name_bytes = self.stream_read_exact(name_len)?;
        let filename = String::from_utf8_lossy(&name_bytes).into_owned();
        let extra = self.stream_read_exact(extra_len)?;
        let mut is_zip64 = false;
        parse_zip64_extra(
            &extra,
            &mut uncompressed,
            &mut compressed,
            None,
            &mut is_zip64,
        )?;

        let length_at_end = flags & FLAG_LENGTH_AT_END != 0;
        // A length-at-end member may still carry real sizes in a ZIP64
        // extra field; only the plain zero-size form is unknown.
        let has_length = !length_at_end || (is_zip64 && uncompressed != 0);
        debug!(
            "zip: streaming member '{}' (sizes {}known)",
            filename,
            if has_length { "" } else { "un" }
        );

        self.current = Some(ZipEntry {
            filename,
            local_header_offset: header_offset,
            compressed_size: compressed,
            uncompressed_size: uncompressed,
            general_purpose_flags: flags,
            has_length,
            is_zip64,
            valid: has_length,
        });
        self.member_pos = 0;
        self.member_done = false;
        self.crc = Crc32::new();
        self.verified = 0;
        self.descriptor_at = None;
        Ok(self.current.as_ref())
    }

    /// Logical offset within the backing stream, accounting for bytes
    /// buffered but not yet consumed.
    fn stream_position(&self) -> u64 {
        self.storage.current_position() - self.lookahead_len() as u64
    }

    fn lookahead(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    fn lookahead_len(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Grows the lookahead to `want` bytes if the source allows, returning
    /// how many are available.
    fn stream_fill(&mut self, want: usize) -> Result<usize, StorageError> {
        if self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        } else if self.start >= 8192 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        while self.lookahead_len() < want && !self.source_eof {
            let missing = want - self.lookahead_len();
            let chunk = missing.max(4096) as u64;
            let bytes = self
                .storage
                .read(chunk, ReadFlags::TEMPORARY | ReadFlags::ALLOW_PARTIAL)?;
            if bytes.is_empty() {
                self.source_eof = true;
                break;
            }
            let owned = bytes.into_owned();
            self.buf.extend_from_slice(&owned);
        }
        Ok(self.lookahead_len())
    }

    fn stream_read_exact(&mut self, count: usize) -> Result<Vec<u8>, StorageError> {
        if self.stream_fill(count)? < count {
            return Err(StorageError::UnexpectedEof);
        }
        let out = self.buf[self.start..self.start + count].to_vec();
        self.start += count;
        Ok(out)
    }

    fn stream_consume_exact(&mut self, count: usize) -> Result<(), StorageError> {
        if self.stream_fill(count)? < count {
            return Err(StorageError::UnexpectedEof);
        }
        self.start += count;
        Ok(())
    }

    fn stream_discard(&mut self, mut count: u64) -> Result<(), StorageError> {
        while count > 0 {
            let chunk = count.min(65536) as usize;
            self.stream_consume_exact(chunk)?;
            self.member_pos += chunk as u64;
            count -= chunk as u64;
        }
        Ok(())
    }

    fn read_streaming_known(
        &mut self,
        length: u64,
        flags: ReadFlags,
    ) -> Result<Cow<'_, [u8]>, StorageError> {
        let want = want_len(length)?;
        let size = self.current.as_ref().map(|e| e.uncompressed_size).unwrap_or(0);
        let remaining = (size - self.member_pos).min(usize::MAX as u64) as usize;
        let n = checked_read_len(remaining, want, flags)?;
        if self.stream_fill(n)? < n {
            return Err(StorageError::UnexpectedEof);
        }
        let start = self.start;
        if !flags.peek {
            self.start += n;
            self.member_pos += n as u64;
        }
        let slice = &self.buf[start..start + n];
        if flags.temporary {
            Ok(Cow::Borrowed(slice))
        } else {
            Ok(Cow::Owned(slice.to_vec()))
        }
    }

    /// Serves payload from a member whose length is only known once its
    /// data descriptor is found.
    fn read_streaming_unknown(
        &mut self,
        length: u64,
        flags: ReadFlags,
    ) -> Result<Cow<'_, [u8]>, StorageError> {
        let want = want_len(length)?;
        loop {
            if self.member_done {
                break;
            }
            if let Some(0) = self.descriptor_at {
                // Payload exhausted: absorb the descriptor and commit.
                self.consume_descriptor()?;
                break;
            }
            if self.descriptor_at.is_some() || self.verified >= want {
                break;
            }
            self.scan_descriptor()?;
        }

        let payload_available = if self.member_done {
            0
        } else {
            self.descriptor_at.unwrap_or(self.verified)
        };
        let n = checked_read_len(payload_available, want, flags)?;
        let start = self.start;
        if !flags.peek && n > 0 {
            self.crc.update(&self.buf[start..start + n]);
            self.start += n;
            self.member_pos += n as u64;
            self.verified -= n;
            if let Some(k) = self.descriptor_at.as_mut() {
                *k -= n;
            }
        }
        let slice = &self.buf[start..start + n];
        if flags.temporary {
            Ok(Cow::Borrowed(slice))
        } else {
            Ok(Cow::Owned(slice.to_vec()))
        }
    }

    fn descriptor_fields_len(&self) -> usize {
        match self.current.as_ref() {
            Some(e) if e.is_zip64 => 20,
            _ => 12,
        }
    }

    /// Extends the verified-payload prefix or locates the data descriptor.
    ///
    /// A candidate `PK\x07\x08` is only accepted when the CRC32 that
    /// follows it matches the running CRC32 of every payload byte before
    /// it AND the recorded compressed size matches the byte count; failed
    /// candidates are reclassified as payload.
    fn scan_descriptor(&mut self) -> Result<(), StorageError> {
        let fields = self.descriptor_fields_len();
        let descriptor_len = 4 + fields;
        let target = self.verified + descriptor_len + 4096;
        let available = self.stream_fill(target)?;

        let mut i = self.verified;
        loop {
            if i + 4 > available {
                if self.source_eof {
                    // The member can no longer end in a valid descriptor.
                    return Err(StorageError::InvalidData(
                        "ZIP member with length-at-end flag ended without a data descriptor"
                            .to_string(),
                    ));
                }
                // The last three bytes could still start a signature.
                self.verified = self.verified.max(available.saturating_sub(3));
                return Ok(());
            }
            let window = &self.buf[self.start..self.start + available];
            if window[i..i + 4] != *DATA_DESCRIPTOR_SIG {
                i += 1;
                continue;
            }
            if i + descriptor_len > available {
                if self.source_eof {
                    return Err(StorageError::InvalidData(
                        "truncated ZIP data descriptor at end of stream".to_string(),
                    ));
                }
                // Candidate found but incomplete; remember the progress
                // and let the next fill complete it.
                self.verified = i;
                return Ok(());
            }
            let stored_crc = u32_at(window, i + 4);
            let stored_compressed = if fields == 20 {
                u64_at(window, i + 8)
            } else {
                u32_at(window, i + 8) as u64
            };
            let mut candidate = self.crc.clone();
            candidate.update(&window[..i]);
            if candidate.value() == stored_crc
                && stored_compressed == self.member_pos + i as u64
            {
                self.descriptor_at = Some(i);
                self.verified = i;
                return Ok(());
            }
            // CRC or size mismatch: those four bytes are payload.
            i += 1;
        }
    }

    fn consume_descriptor(&mut self) -> Result<(), StorageError> {
        let fields = self.descriptor_fields_len();
        let descriptor_len = 4 + fields;
        if self.stream_fill(descriptor_len)? < descriptor_len {
            return Err(StorageError::UnexpectedEof);
        }
        self.start += descriptor_len;
        self.descriptor_at = None;
        self.member_done = true;
        if let Some(entry) = self.current.as_mut() {
            entry.compressed_size = self.member_pos;
            entry.uncompressed_size = self.member_pos;
            entry.has_length = true;
            entry.valid = true;
        }
        Ok(())
    }
}

impl Storage for ZipReader {
    fn current_position(&self) -> u64 {
        self.member_pos
    }

    fn original_position(&self) -> u64 {
        self.storage.current_position()
    }

    fn read(&mut self, length: u64, flags: ReadFlags) -> Result<Cow<'_, [u8]>, StorageError> {
        if self.seekable {
            let Some(entry) = self.current.as_ref() else {
                checked_read_len(0, want_len(length)?, flags)?;
                return Ok(Cow::Borrowed(&[]));
            };
            let want = want_len(length)?;
            let remaining =
                (entry.uncompressed_size - self.member_pos).min(usize::MAX as u64) as usize;
            let n = checked_read_len(remaining, want, flags)?;
            if n == 0 {
                return Ok(Cow::Borrowed(&[]));
            }
            let out = self.storage.read(n as u64, flags)?;
            if !flags.peek {
                self.member_pos += out.len() as u64;
            }
            Ok(out)
        } else {
            match self.current.as_ref() {
                None => {
                    checked_read_len(0, want_len(length)?, flags)?;
                    Ok(Cow::Borrowed(&[]))
                }
                Some(entry) if entry.has_length => self.read_streaming_known(length, flags),
                Some(_) => self.read_streaming_unknown(length, flags),
            }
        }
    }

    fn can_seek_back(&mut self, _allow_detect: bool) -> bool {
        self.seekable
    }

    fn seek_to(&mut self, position: u64) -> Result<(), StorageError> {
        if self.seekable {
            self.storage.seek_to(self.data_offset + position)?;
            self.member_pos = position;
            return Ok(());
        }
        if position < self.member_pos {
            return Err(StorageError::SeekBackwardUnsupported {
                target: position,
                position: self.member_pos,
            });
        }
        let mut remaining = position - self.member_pos;
        while remaining > 0 {
            let n = self
                .read(
                    remaining.min(65536),
                    ReadFlags::TEMPORARY | ReadFlags::ALLOW_PARTIAL,
                )?
                .len() as u64;
            if n == 0 {
                return Err(StorageError::UnexpectedEof);
            }
            remaining -= n;
        }
        Ok(())
    }

    fn seek_from_back(&mut self, offset_from_end: u64) -> Result<(), StorageError> {
        if !self.seekable {
            return Err(StorageError::SeekFromEndUnsupported);
        }
        let Some(entry) = self.current.as_ref() else {
            return Err(StorageError::SeekFromEndUnsupported);
        };
        let target = entry
            .uncompressed_size
            .checked_sub(offset_from_end)
            .ok_or(StorageError::UnexpectedEof)?;
        self.seek_to(target)
    }
}

/// Reads the end-of-central-directory records and returns the member list.
fn parse_central_directory(storage: &mut dyn Storage) -> Result<VecDeque<ZipEntry>, Error> {
    storage.seek_from_back(EOCD_LEN)?;
    let eocd = storage.read(EOCD_LEN, ReadFlags::NONE)?.into_owned();
    if u32_at(&eocd, 0) != EOCD_SIG {
        return Err(Error::InvalidFileStructure(
            "ZIP end-of-central-directory record not found".to_string(),
        ));
    }
    let mut entry_count = u16_at(&eocd, 10) as u64;
    let mut cd_offset = u32_at(&eocd, 16) as u64;

    // A ZIP64 locator, when present, sits immediately before the EOCD.
    let mut have_zip64 = false;
    if storage.seek_from_back(EOCD_LEN + EOCD64_LOCATOR_LEN).is_ok() {
        let locator = storage
            .read(EOCD64_LOCATOR_LEN, ReadFlags::NONE)?
            .into_owned();
        if u32_at(&locator, 0) == EOCD64_LOCATOR_SIG {
            let eocd64_offset = u64_at(&locator, 8);
            storage.seek_to(eocd64_offset)?;
            let record = storage.read(EOCD64_LEN, ReadFlags::NONE)?.into_owned();
            if u32_at(&record, 0) != EOCD64_SIG {
                return Err(Error::InvalidFileStructure(
                    "ZIP64 end-of-central-directory signature mismatch".to_string(),
                ));
            }
            entry_count = u64_at(&record, 32);
            cd_offset = u64_at(&record, 48);
            have_zip64 = true;
        }
    }
    if !have_zip64 && (entry_count == 0xFFFF || cd_offset == 0xFFFF_FFFF) {
        return Err(Error::InvalidFileStructure(
            "ZIP central directory requires a missing ZIP64 record".to_string(),
        ));
    }

    storage.seek_to(cd_offset)?;
    let mut entries = VecDeque::with_capacity(entry_count.min(65536) as usize);
    for _ in 0..entry_count {
        let fixed = storage
            .read(CENTRAL_HEADER_LEN as u64, ReadFlags::NONE)?
            .into_owned();
        if u32_at(&fixed, 0) != CENTRAL_HEADER_SIG {
            return Err(Error::InvalidFileStructure(
                "ZIP central-directory header signature mismatch".to_string(),
            ));
        }
        let flags = u16_at(&fixed, 8);
        let mut compressed = u32_at(&fixed, 20) as u64;
        let mut uncompressed = u32_at(&fixed, 24) as u64;
        let name_len = u16_at(&fixed, 28) as u64;
        let extra_len = u16_at(&fixed, 30) as u64;
        let comment_len = u16_at(&fixed, 32) as u64;
        let mut header_offset = u32_at(&fixed, 42) as u64;

        let name_bytes = storage.read(name_len, ReadFlags::NONE)?.into_owned();
        let filename = String::from_utf8_lossy(&name_bytes).into_owned();
        let extra = storage.read(extra_len, ReadFlags::NONE)?.into_owned();
        let mut is_zip64 = false;
        parse_zip64_extra(
            &extra,
            &mut uncompressed,
            &mut compressed,
            Some(&mut header_offset),
            &mut is_zip64,
        )?;
        if comment_len > 0 {
            let after = storage.current_position() + comment_len;
            storage.seek_to(after)?;
        }

        entries.push_back(ZipEntry {
            filename,
            local_header_offset: header_offset,
            compressed_size: compressed,
            uncompressed_size: uncompressed,
            general_purpose_flags: flags,
            has_length: true,
            is_zip64,
            valid: true,
        });
    }
    Ok(entries)
}

/// Applies a ZIP64 extended-information extra field (0x0001).
///
/// Fields are present only for the values saturated to `0xFFFFFFFF` in
/// the fixed record, in the order uncompressed, compressed, offset.
fn parse_zip64_extra(
    extra: &[u8],
    uncompressed: &mut u64,
    compressed: &mut u64,
    mut header_offset: Option<&mut u64>,
    is_zip64: &mut bool,
) -> Result<(), Error> {
    let mut pos = 0usize;
    while pos + 4 <= extra.len() {
        let id = u16_at(extra, pos);
        let size = u16_at(extra, pos + 2) as usize;
        let body_start = pos + 4;
        let body_end = body_start + size;
        if body_end > extra.len() {
            break;
        }
        if id == ZIP64_EXTRA_ID {
            *is_zip64 = true;
            let body = &extra[body_start..body_end];
            let mut off = 0usize;
            let mut take = |slot: &mut u64| -> Result<(), Error> {
                if *slot == 0xFFFF_FFFF {
                    if off + 8 > body.len() {
                        return Err(Error::InvalidFileStructure(
                            "truncated ZIP64 extra field".to_string(),
                        ));
                    }
                    *slot = u64_at(body, off);
                    off += 8;
                }
                Ok(())
            };
            take(uncompressed)?;
            take(compressed)?;
            if let Some(slot) = header_offset.as_deref_mut() {
                take(slot)?;
            }
        }
        pos = body_end;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    /// Forces streaming mode by refusing backward seeks.
    struct ForwardOnly(MemoryStorage);

    impl Storage for ForwardOnly {
        fn current_position(&self) -> u64 {
            self.0.current_position()
        }
        fn read(
            &mut self,
            length: u64,
            flags: ReadFlags,
        ) -> Result<Cow<'_, [u8]>, StorageError> {
            self.0.read(length, flags)
        }
        fn can_seek_back(&mut self, _allow_detect: bool) -> bool {
            false
        }
        fn seek_to(&mut self, position: u64) -> Result<(), StorageError> {
            if position < self.0.current_position() {
                return Err(StorageError::SeekBackwardUnsupported {
                    target: position,
                    position: self.0.current_position(),
                });
            }
            self.0.seek_to(position)
        }
        fn seek_from_back(&mut self, _offset_from_end: u64) -> Result<(), StorageError> {
            Err(StorageError::SeekFromEndUnsupported)
        }
    }

    /// Minimal stored-ZIP writer for fixtures.
    pub(crate) struct TestZip {
        bytes: Vec<u8>,
        central: Vec<u8>,
        count: u16,
    }

    impl TestZip {
        pub(crate) fn new() -> Self {
            TestZip {
                bytes: Vec::new(),
                central: Vec::new(),
                count: 0,
            }
        }

        pub(crate) fn add(&mut self, name: &str, payload: &[u8]) {
            self.add_with_flags(name, payload, 0, true);
        }

        /// `sizes_in_header = false` writes a length-at-end member whose
        /// local sizes are zero and whose payload is followed by a
        /// signed data descriptor.
        pub(crate) fn add_with_flags(
            &mut self,
            name: &str,
            payload: &[u8],
            flags: u16,
            sizes_in_header: bool,
        ) {
            let offset = self.bytes.len() as u32;
            let crc = crc32fast::hash(payload);
            let size = payload.len() as u32;
            let (header_crc, header_size) = if sizes_in_header {
                (crc, size)
            } else {
                (0, 0)
            };

            // Local file header.
            self.bytes.extend_from_slice(&LOCAL_HEADER_SIG.to_le_bytes());
            self.bytes.extend_from_slice(&20u16.to_le_bytes()); // version
            self.bytes.extend_from_slice(&flags.to_le_bytes());
            self.bytes.extend_from_slice(&0u16.to_le_bytes()); // stored
            self.bytes.extend_from_slice(&0u32.to_le_bytes()); // time+date
            self.bytes.extend_from_slice(&header_crc.to_le_bytes());
            self.bytes.extend_from_slice(&header_size.to_le_bytes());
            self.bytes.extend_from_slice(&header_size.to_le_bytes());
            self.bytes
                .extend_from_slice(&(name.len() as u16).to_le_bytes());
            self.bytes.extend_from_slice(&0u16.to_le_bytes()); // extra
            self.bytes.extend_from_slice(name.as_bytes());
            self.bytes.extend_from_slice(payload);

            if flags & FLAG_LENGTH_AT_END != 0 {
                self.bytes.extend_from_slice(DATA_DESCRIPTOR_SIG);
                self.bytes.extend_from_slice(&crc.to_le_bytes());
                self.bytes.extend_from_slice(&size.to_le_bytes());
                self.bytes.extend_from_slice(&size.to_le_bytes());
            }

            // Central directory entry.
            self.central
                .extend_from_slice(&CENTRAL_HEADER_SIG.to_le_bytes());
            self.central.extend_from_slice(&20u16.to_le_bytes()); // made by
            self.central.extend_from_slice(&20u16.to_le_bytes()); // needed
            self.central.extend_from_slice(&flags.to_le_bytes());
            self.central.extend_from_slice(&0u16.to_le_bytes()); // stored
            self.central.extend_from_slice(&0u32.to_le_bytes()); // time+date
            self.central.extend_from_slice(&crc.to_le_bytes());
            self.central.extend_from_slice(&size.to_le_bytes());
            self.central.extend_from_slice(&size.to_le_bytes());
            self.central
                .extend_from_slice(&(name.len() as u16).to_le_bytes());
            self.central.extend_from_slice(&0u16.to_le_bytes()); // extra
            self.central.extend_from_slice(&0u16.to_le_bytes()); // comment
            self.central.extend_from_slice(&0u16.to_le_bytes()); // disk
            self.central.extend_from_slice(&0u16.to_le_bytes()); // int attrs
            self.central.extend_from_slice(&0u32.to_le_bytes()); // ext attrs
            self.central.extend_from_slice(&offset.to_le_bytes());
            self.central.extend_from_slice(name.as_bytes());
            self.count += 1;
        }

        pub(crate) fn finish(mut self) -> Vec<u8> {
            let cd_offset = self.bytes.len() as u32;
            let cd_size = self.central.len() as u32;
            self.bytes.extend_from_slice(&self.central);
            self.bytes.extend_from_slice(&EOCD_SIG.to_le_bytes());
            self.bytes.extend_from_slice(&0u16.to_le_bytes()); // disk
            self.bytes.extend_from_slice(&0u16.to_le_bytes()); // cd disk
            self.bytes.extend_from_slice(&self.count.to_le_bytes());
            self.bytes.extend_from_slice(&self.count.to_le_bytes());
            self.bytes.extend_from_slice(&cd_size.to_le_bytes());
            self.bytes.extend_from_slice(&cd_offset.to_le_bytes());
            self.bytes.extend_from_slice(&0u16.to_le_bytes()); // comment
            self.bytes
        }
    }

    fn read_member(zip: &mut ZipReader) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let chunk = zip
                .read(4096, ReadFlags::ALLOW_PARTIAL)
                .unwrap()
                .into_owned();
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn test_central_directory_mode() {
        let mut builder = TestZip::new();
        builder.add("a.txt", b"hello");
        builder.add("dir/b.bin", &[0u8; 300]);
        let data = builder.finish();

        let mut zip = ZipReader::new(Box::new(MemoryStorage::new(data))).unwrap();
        assert!(zip.can_seek_back(false));

        let entry = zip.read_next_file().unwrap().unwrap();
        assert_eq!(entry.filename, "a.txt");
        assert_eq!(entry.uncompressed_size, 5);
        assert!(entry.has_length && entry.valid && !entry.is_zip64);
        assert_eq!(read_member(&mut zip), b"hello");

        let entry = zip.read_next_file().unwrap().unwrap();
        assert_eq!(entry.filename, "dir/b.bin");
        assert_eq!(entry.uncompressed_size, 300);
        assert_eq!(read_member(&mut zip).len(), 300);

        assert!(zip.read_next_file().unwrap().is_none());
        assert!(zip.read_next_file().unwrap().is_none());
    }

    #[test]
    fn test_member_relative_positions_and_seek() {
        let mut builder = TestZip::new();
        builder.add("x", b"0123456789");
        let data = builder.finish();

        let mut zip = ZipReader::new(Box::new(MemoryStorage::new(data))).unwrap();
        zip.read_next_file().unwrap().unwrap();
        assert_eq!(zip.current_position(), 0);
        assert_eq!(&*zip.read(3, ReadFlags::NONE).unwrap(), b"012");
        assert_eq!(zip.current_position(), 3);
        assert_ne!(zip.original_position(), zip.current_position());
        // Backward member seek in seekable mode.
        zip.seek_to(1).unwrap();
        assert_eq!(&*zip.read(2, ReadFlags::NONE).unwrap(), b"12");
        zip.seek_from_back(2).unwrap();
        assert_eq!(&*zip.read(2, ReadFlags::NONE).unwrap(), b"89");
        // Reading past the member end honors the flags.
        assert!(matches!(
            zip.read(1, ReadFlags::NONE),
            Err(StorageError::UnexpectedEof)
        ));
        assert!(zip.read(1, ReadFlags::ALLOW_EMPTY).unwrap().is_empty());
    }

    #[test]
    fn test_streaming_mode_known_lengths() {
        let mut builder = TestZip::new();
        builder.add("first", b"abcdef");
        builder.add("second", b"xyz");
        let data = builder.finish();

        let mut zip =
            ZipReader::new(Box::new(ForwardOnly(MemoryStorage::new(data)))).unwrap();
        assert!(!zip.can_seek_back(false));

        let entry = zip.read_next_file().unwrap().unwrap();
        assert_eq!(entry.filename, "first");
        // Only read part of the first member; the reader must skip the rest.
        assert_eq!(&*zip.read(2, ReadFlags::NONE).unwrap(), b"ab");

        let entry = zip.read_next_file().unwrap().unwrap();
        assert_eq!(entry.filename, "second");
        assert_eq!(read_member(&mut zip), b"xyz");
        assert!(zip.read_next_file().unwrap().is_none());
    }

    #[test]
    fn test_streaming_length_at_end() {
        let payload = b"some payload without tricky bytes".to_vec();
        let mut builder = TestZip::new();
        builder.add_with_flags("stream.bin", &payload, FLAG_LENGTH_AT_END, false);
        builder.add("after", b"tail");
        let data = builder.finish();

        let mut zip =
            ZipReader::new(Box::new(ForwardOnly(MemoryStorage::new(data)))).unwrap();
        let entry = zip.read_next_file().unwrap().unwrap();
        assert_eq!(entry.filename, "stream.bin");
        assert!(!entry.has_length);
        assert!(!entry.valid);
        assert_eq!(read_member(&mut zip), payload);
        // Sizes are committed once the descriptor is accepted.
        let entry = zip.current_entry().unwrap();
        assert!(entry.has_length && entry.valid);
        assert_eq!(entry.uncompressed_size, payload.len() as u64);

        let entry = zip.read_next_file().unwrap().unwrap();
        assert_eq!(entry.filename, "after");
        assert_eq!(read_member(&mut zip), b"tail");
    }

    #[test]
    fn test_streaming_descriptor_false_positives() {
        // Payload consisting of ZIP signatures, including PK\x07\x08:
        // only the candidate whose CRC matches may terminate the member.
        let mut payload = Vec::new();
        for _ in 0..8 {
            payload.extend_from_slice(b"PK\x03\x04");
            payload.extend_from_slice(b"PK\x05\x06");
            payload.extend_from_slice(b"PK\x07\x08");
            payload.extend_from_slice(b"PK\x01\x02");
        }
        let mut builder = TestZip::new();
        builder.add_with_flags("tricky", &payload, FLAG_LENGTH_AT_END, false);
        let data = builder.finish();

        let mut zip =
            ZipReader::new(Box::new(ForwardOnly(MemoryStorage::new(data)))).unwrap();
        zip.read_next_file().unwrap().unwrap();
        assert_eq!(read_member(&mut zip), payload);
        assert_eq!(
            zip.current_entry().unwrap().uncompressed_size,
            payload.len() as u64
        );
        assert!(zip.read_next_file().unwrap().is_none());
    }

    #[test]
    fn test_streaming_partial_reads_withhold_unverified_bytes() {
        let payload = vec![0x50u8; 64]; // all 'P', plenty of near-signatures
        let mut builder = TestZip::new();
        builder.add_with_flags("p", &payload, FLAG_LENGTH_AT_END, false);
        let data = builder.finish();

        let mut zip =
            ZipReader::new(Box::new(ForwardOnly(MemoryStorage::new(data)))).unwrap();
        zip.read_next_file().unwrap().unwrap();
        let mut collected = Vec::new();
        loop {
            let chunk = zip.read(7, ReadFlags::ALLOW_PARTIAL).unwrap().into_owned();
            if chunk.is_empty() {
                break;
            }
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, payload);
    }

    #[test]
    fn test_encrypted_member_rejected() {
        let mut builder = TestZip::new();
        builder.add_with_flags("enc", b"secret", FLAG_ENCRYPTED, true);
        let data = builder.finish();

        let mut zip = ZipReader::new(Box::new(MemoryStorage::new(data))).unwrap();
        assert!(matches!(
            zip.read_next_file(),
            Err(Error::EncryptedEntry)
        ));
    }

    #[test]
    fn test_compressed_member_rejected() {
        // Patch the method field to 8 (deflate) in both headers.
        let mut builder = TestZip::new();
        builder.add("c", b"zz");
        let mut data = builder.finish();
        data[8] = 8; // local header method
        let cd = data
            .windows(4)
            .position(|w| w == CENTRAL_HEADER_SIG.to_le_bytes())
            .unwrap();
        data[cd + 10] = 8;

        let mut zip = ZipReader::new(Box::new(MemoryStorage::new(data))).unwrap();
        assert!(matches!(
            zip.read_next_file(),
            Err(Error::UnsupportedCompression(8))
        ));
    }

    #[test]
    fn test_zip64_extra_field_parsing() {
        let mut uncompressed = 0xFFFF_FFFFu64;
        let mut compressed = 0xFFFF_FFFFu64;
        let mut offset = 0xFFFF_FFFFu64;
        let mut extra = Vec::new();
        extra.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
        extra.extend_from_slice(&24u16.to_le_bytes());
        extra.extend_from_slice(&(1u64 << 40).to_le_bytes());
        extra.extend_from_slice(&(1u64 << 40).to_le_bytes());
        extra.extend_from_slice(&(1u64 << 33).to_le_bytes());

        let mut is_zip64 = false;
        parse_zip64_extra(
            &extra,
            &mut uncompressed,
            &mut compressed,
            Some(&mut offset),
            &mut is_zip64,
        )
        .unwrap();
        assert!(is_zip64);
        assert_eq!(uncompressed, 1 << 40);
        assert_eq!(compressed, 1 << 40);
        assert_eq!(offset, 1 << 33);
    }

    #[test]
    fn test_zip64_extra_only_replaces_saturated_fields() {
        let mut uncompressed = 100u64;
        let mut compressed = 0xFFFF_FFFFu64;
        let mut extra = Vec::new();
        extra.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
        extra.extend_from_slice(&8u16.to_le_bytes());
        extra.extend_from_slice(&(1u64 << 35).to_le_bytes());

        let mut is_zip64 = false;
        parse_zip64_extra(&extra, &mut uncompressed, &mut compressed, None, &mut is_zip64)
            .unwrap();
        assert_eq!(uncompressed, 100);
        assert_eq!(compressed, 1 << 35);
    }

    #[test]
    fn test_not_a_zip() {
        let err = ZipReader::new(Box::new(MemoryStorage::new(vec![0u8; 100]))).unwrap_err();
        assert!(matches!(err, Error::InvalidFileStructure(_)));
    }
}
