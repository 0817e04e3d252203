//! Error types for tensorfile operations.
//!
//! Three layers mirror the crate structure: [`StorageError`] for byte-source
//! failures, [`PickleError`] for the pickle virtual machine, and [`Error`]
//! for everything a tensor reader can report. The lower layers convert
//! upward via `From`, so `?` composes across module boundaries.

use thiserror::Error;

use crate::utils::format_hex;

/// Errors raised by the storage layer (files, mmaps, gzip streams, ZIP
/// members and in-memory buffers).
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error from the underlying OS handle.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Required bytes were not available and the read flags did not permit
    /// an empty or partial result.
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Operation on a storage after `close()`.
    #[error("Storage has been closed")]
    Closed,

    /// A backward seek was requested on a storage that cannot rewind.
    #[error("Backward seek to {target} from {position} is not supported by this storage")]
    SeekBackwardUnsupported { target: u64, position: u64 },

    /// `seek_from_back` on a storage that cannot seek relative to its end.
    #[error("Seeking relative to the end is not supported by this storage")]
    SeekFromEndUnsupported,

    /// A read length that does not fit in addressable memory.
    #[error("Read length {length} exceeds addressable memory")]
    LengthOverflow { length: u64 },

    /// A wrapping storage (ZIP member) found its framing corrupt while
    /// serving a read.
    #[error("Corrupt wrapped stream: {0}")]
    InvalidData(String),
}

/// Errors raised by the pickle virtual machine.
#[derive(Debug, Error)]
pub enum PickleError {
    /// Truncated pickle stream or failing byte source.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Opcode byte outside the supported protocol 0-5 set.
    #[error("Unknown pickle opcode 0x{opcode:02x} at position {position}")]
    UnknownOpcode { opcode: u8, position: u64 },

    /// An opcode popped more items than the stack holds.
    #[error("Pickle stack underflow")]
    StackUnderflow,

    /// An opcode needed an active MARK but none was set.
    #[error("Pickle MARK expected but none is active")]
    MissingMark,

    /// GET/BINGET referenced a memo id never PUT.
    #[error("Pickle memo entry {0} not found")]
    MissingMemo(u32),

    /// Bad quoting or escapes in a textual string opcode.
    #[error("Malformed pickle string literal: {0}")]
    BadString(String),

    /// Unparseable textual number, or a length prefix over the limit.
    #[error("Malformed pickle number: {0}")]
    BadNumber(String),

    /// An opcode that requires a specific item type found something else.
    #[error("Pickle opcode {opcode} requires a {expected} on the stack")]
    TypeMismatch {
        opcode: &'static str,
        expected: &'static str,
    },

    /// STOP reached with more or less than exactly one item on the stack.
    #[error("Pickle stream stopped with {0} items on the stack")]
    UnbalancedStack(usize),

    /// STOP reached while a MARK was still open.
    #[error("Pickle stream stopped with an unclosed MARK")]
    UnclosedMark,
}

/// All errors a tensor reader can surface to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Failure in the underlying byte source.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Failure interpreting a PyTorch `data.pkl`.
    #[error("Pickle error: {0}")]
    Pickle(#[from] PickleError),

    /// The first bytes match none of the known container formats.
    #[error("Unrecognized tensor container (leading bytes: {})", format_hex(.found))]
    UnknownFormat { found: Vec<u8> },

    /// A format-specific magic number did not match.
    #[error("Invalid magic number (found: {})", format_hex(.found))]
    InvalidMagicNumber { found: Vec<u8> },

    /// A known container with a version this reader does not handle.
    #[error("Unsupported {format} version {version}")]
    UnsupportedVersion { format: &'static str, version: u32 },

    /// Element-type string or tag outside the supported set.
    #[error("Unsupported dtype: {0}")]
    UnsupportedDType(String),

    /// GGUF `general.alignment` that is zero or not a multiple of 8.
    #[error("Unsupported alignment {0}: must be a non-zero multiple of 8")]
    UnsupportedAlignment(u64),

    /// Structural invariant of a container violated.
    #[error("Invalid file structure: {0}")]
    InvalidFileStructure(String),

    /// A pickle storage key with no matching archive member.
    #[error("Storage '{0}' has no matching archive member")]
    MissingStorage(String),

    /// The first ZIP member of a PyTorch archive was not `data.pkl`.
    #[error("Unexpected first archive member '{0}' (expected <prefix>/data.pkl)")]
    UnexpectedPickleEntry(String),

    /// A ZIP member stored with a compression method other than 0.
    #[error("Unsupported ZIP compression method {0} (only stored entries are supported)")]
    UnsupportedCompression(u16),

    /// A ZIP member with the encryption flag set.
    #[error("Encrypted ZIP members are not supported")]
    EncryptedEntry,

    /// Arithmetic overflow computing a tensor byte size.
    #[error("Tensor '{name}' size computation overflows")]
    SizeOverflow { name: String },

    /// Shape and stride ranks disagree.
    #[error("Tensor '{name}' has shape rank {shape} but stride rank {stride}")]
    ShapeStrideMismatch {
        name: String,
        shape: usize,
        stride: usize,
    },
}
