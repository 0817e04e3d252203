//! Little-endian decoding helpers, hex formatting and the CRC32 wrapper.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::StorageError;
use crate::storage::{ReadFlags, Storage};

/// Reads a single byte from a storage.
pub fn read_u8(storage: &mut dyn Storage) -> Result<u8, StorageError> {
    let bytes = storage.read(1, ReadFlags::TEMPORARY)?;
    Ok(bytes[0])
}

/// Reads a little-endian u16 from a storage.
pub fn read_u16_le(storage: &mut dyn Storage) -> Result<u16, StorageError> {
    let bytes = storage.read(2, ReadFlags::TEMPORARY)?;
    Ok(LittleEndian::read_u16(&bytes))
}

/// Reads a little-endian u32 from a storage.
pub fn read_u32_le(storage: &mut dyn Storage) -> Result<u32, StorageError> {
    let bytes = storage.read(4, ReadFlags::TEMPORARY)?;
    Ok(LittleEndian::read_u32(&bytes))
}

/// Reads a little-endian u64 from a storage.
pub fn read_u64_le(storage: &mut dyn Storage) -> Result<u64, StorageError> {
    let bytes = storage.read(8, ReadFlags::TEMPORARY)?;
    Ok(LittleEndian::read_u64(&bytes))
}

// Packed-struct accessors for fixed binary headers already in memory.

pub fn u16_at(buf: &[u8], offset: usize) -> u16 {
    LittleEndian::read_u16(&buf[offset..offset + 2])
}

pub fn u32_at(buf: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&buf[offset..offset + 4])
}

pub fn u64_at(buf: &[u8], offset: usize) -> u64 {
    LittleEndian::read_u64(&buf[offset..offset + 8])
}

/// Renders bytes as space-separated lowercase hex, for error messages.
pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rounds `offset` up to the next multiple of `alignment`.
pub fn align_up(offset: u64, alignment: u64) -> u64 {
    let remainder = offset % alignment;
    if remainder == 0 {
        offset
    } else {
        offset + (alignment - remainder)
    }
}

/// Incremental CRC32 (IEEE, the ZIP polynomial).
///
/// Cloning preserves the running state, which the ZIP streaming reader
/// uses to test data-descriptor candidates without committing bytes.
#[derive(Clone, Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
}

impl Crc32 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Current checksum without consuming the running state.
    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}
