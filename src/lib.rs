//! # tensorfile
//!
//! Read-only, format-unified access to the three tensor container
//! formats in common use: **Safetensors**, **PyTorch** `.pt` archives
//! and **GGUF**. A byte source of any kind (file, memory map, in-memory
//! buffer, gzip stream, or a ZIP member nested in one of those) is
//! wrapped in a [`Storage`], and a [`TensorReader`] iterates the
//! container's data buffers together with the metadata of every tensor
//! inside them.
//!
//! ## Listing tensors
//!
//! ```no_run
//! use tensorfile::{open_mmap, read_tensors};
//!
//! let storage = Box::new(open_mmap("model.safetensors")?);
//! let mut reader = read_tensors(storage, false)?;
//! for tensor in reader.read_all_tensor_infos()? {
//!     println!("{} {:?} {}", tensor.name, tensor.shape, tensor.value_type);
//! }
//! # Ok::<(), tensorfile::Error>(())
//! ```
//!
//! ## Reading tensor bytes
//!
//! ```no_run
//! use tensorfile::{open_file, read_tensors, ReadFlags};
//!
//! let storage = Box::new(open_file("model.pt")?);
//! let mut reader = read_tensors(storage, true)?;
//! while reader.read_next_buffer()? {
//!     let buffer_size = reader.buffer_size();
//!     let bytes = reader.read(buffer_size, ReadFlags::NONE)?.into_owned();
//!     for tensor in reader.tensors_in_buffer() {
//!         let start = tensor.offset_start as usize;
//!         let end = start + tensor.size_bytes as usize;
//!         println!("{}: {} bytes", tensor.name, bytes[start..end].len());
//!     }
//! }
//! # Ok::<(), tensorfile::Error>(())
//! ```
//!
//! The `small_buffers` flag of [`read_tensors`] wraps the reader in a
//! [`BufferSplitter`], which re-partitions each format-level buffer into
//! the smallest byte ranges covering groups of overlapping tensors.

pub mod compat;
pub mod error;
pub mod gguf_reader;
pub mod models;
pub mod pickle_vm;
pub mod pytorch_reader;
pub mod reader;
pub mod safetensors_reader;
pub mod splitter;
pub mod storage;
pub mod utils;
pub mod zip_reader;

use log::debug;

pub use error::{Error, PickleError, StorageError};
pub use gguf_reader::GgufReader;
pub use models::{TensorInfo, ValueType};
pub use pickle_vm::{Item, ItemArena, ItemId, ItemType, PickleOptions, StringEncoding};
pub use pytorch_reader::PyTorchReader;
pub use reader::TensorReader;
pub use safetensors_reader::SafeTensorsReader;
pub use splitter::BufferSplitter;
pub use storage::{
    from_memory, open_file, open_gzip, open_mmap, FileStorage, GzipStorage, MemoryStorage,
    MmapStorage, ReadFlags, Storage,
};
pub use zip_reader::{ZipEntry, ZipReader};

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];

/// Opens a tensor reader over `storage`, detecting the container format
/// from its leading bytes.
///
/// Detection peeks so the chosen parser sees the stream from position 0:
/// `"GGUF"` selects the GGUF parser, the ZIP local-header signature
/// selects the PyTorch parser, and a `{` at byte 8 selects Safetensors
/// (the JSON object right after the u64 header length). When
/// `small_buffers` is set the reader is wrapped in a [`BufferSplitter`].
pub fn read_tensors(
    mut storage: Box<dyn Storage>,
    small_buffers: bool,
) -> Result<Box<dyn TensorReader>, Error> {
    let head = storage
        .read(12, ReadFlags::PEEK | ReadFlags::ALLOW_PARTIAL)?
        .into_owned();
    let reader: Box<dyn TensorReader> = if head.len() >= 4 && head[..4] == *b"GGUF" {
        debug!("detected GGUF container");
        Box::new(GgufReader::new(storage)?)
    } else if head.len() >= 4 && head[..4] == ZIP_MAGIC {
        debug!("detected ZIP container, assuming PyTorch");
        Box::new(PyTorchReader::new(storage)?)
    } else if head.len() >= 9 && head[8] == b'{' {
        debug!("detected safetensors container");
        Box::new(SafeTensorsReader::new(storage)?)
    } else {
        return Err(Error::UnknownFormat { found: head });
    };
    Ok(if small_buffers {
        Box::new(BufferSplitter::new(reader))
    } else {
        reader
    })
}

/// Opens a Safetensors reader without auto-detection.
pub fn safetensors_reader(storage: Box<dyn Storage>) -> Result<SafeTensorsReader, Error> {
    SafeTensorsReader::new(storage)
}

/// Opens a GGUF reader without auto-detection.
pub fn gguf_reader(storage: Box<dyn Storage>) -> Result<GgufReader, Error> {
    GgufReader::new(storage)
}

/// Opens a PyTorch reader without auto-detection.
pub fn pytorch_reader(storage: Box<dyn Storage>) -> Result<PyTorchReader, Error> {
    PyTorchReader::new(storage)
}
