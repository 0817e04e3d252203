//! GGUF v3 container parser.
//!
//! Layout: `"GGUF"` magic, u32 version, u64 tensor count, u64 metadata KV
//! count, the typed KV entries, the tensor infos, then padding up to the
//! data alignment and a single tensor data region. All integers are
//! little-endian.
//!
//! The only metadata key interpreted here is `general.alignment`; every
//! other value is walked and discarded. Quantized ggml element types are
//! listed with [`ValueType::Unknown`] and a computed size of zero; their
//! block layout is not this crate's business.

use std::borrow::Cow;

use log::debug;

use crate::error::Error;
use crate::models::{TensorInfo, ValueType};
use crate::reader::{BufferState, Region, TensorReader};
use crate::storage::{ReadFlags, Storage};
use crate::utils;

const GGUF_MAGIC: &[u8; 4] = b"GGUF";
const GGUF_VERSION: u32 = 3;
const DEFAULT_ALIGNMENT: u64 = 32;
const MAX_DIMS: u32 = 64;

// GGUF metadata value type tags.
const META_UINT8: u32 = 0;
const META_INT8: u32 = 1;
const META_UINT16: u32 = 2;
const META_INT16: u32 = 3;
const META_UINT32: u32 = 4;
const META_INT32: u32 = 5;
const META_FLOAT32: u32 = 6;
const META_BOOL: u32 = 7;
const META_STRING: u32 = 8;
const META_ARRAY: u32 = 9;
const META_UINT64: u32 = 10;
const META_INT64: u32 = 11;
const META_FLOAT64: u32 = 12;

/// Maps a ggml type tag to an element type.
///
/// Quantized and unrecognized tags yield [`ValueType::Unknown`]; the
/// numeric tag itself stays visible to callers through the tensor name
/// listing only, by design.
fn ggml_type_to_value_type(type_id: u32) -> ValueType {
    match type_id {
        0 => ValueType::F32,
        1 => ValueType::F16,
        24 => ValueType::I8,
        25 => ValueType::I16,
        26 => ValueType::I32,
        27 => ValueType::I64,
        28 => ValueType::F64,
        30 => ValueType::BF16,
        _ => ValueType::Unknown,
    }
}

impl std::fmt::Debug for GgufReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GgufReader").finish_non_exhaustive()
    }
}

/// Reader for `.gguf` containers, version 3 only.
pub struct GgufReader {
    storage: Box<dyn Storage>,
    tensors: Vec<TensorInfo>,
    region: Region,
    state: BufferState,
}

impl GgufReader {
    /// Parses the header from `storage`, which must be positioned at the
    /// start of the container.
    pub fn new(mut storage: Box<dyn Storage>) -> Result<Self, Error> {
        let magic = storage.read(4, ReadFlags::NONE)?.into_owned();
        if magic != GGUF_MAGIC {
            return Err(Error::InvalidMagicNumber { found: magic });
        }
        let version = utils::read_u32_le(&mut *storage)?;
        if version != GGUF_VERSION {
            return Err(Error::UnsupportedVersion {
                format: "GGUF",
                version,
            });
        }
        let tensor_count = utils::read_u64_le(&mut *storage)?;
        let kv_count = utils::read_u64_le(&mut *storage)?;

        let mut alignment = DEFAULT_ALIGNMENT;
        for _ in 0..kv_count {
            let key = read_string(&mut *storage)?;
            let value_type = utils::read_u32_le(&mut *storage)?;
            if key == "general.alignment" {
                if value_type != META_UINT32 {
                    return Err(Error::InvalidFileStructure(
                        "general.alignment must be a u32".to_string(),
                    ));
                }
                let value = utils::read_u32_le(&mut *storage)? as u64;
                if value == 0 || value % 8 != 0 {
                    return Err(Error::UnsupportedAlignment(value));
                }
                debug!("gguf: alignment override {}", value);
                alignment = value;
            } else {
                skip_value(&mut *storage, value_type, 0)?;
            }
        }

        let mut tensors = Vec::with_capacity(tensor_count.min(65536) as usize);
        for _ in 0..tensor_count {
            let name = read_string(&mut *storage)?;
            let n_dims = utils::read_u32_le(&mut *storage)?;
            if n_dims > MAX_DIMS {
                return Err(Error::InvalidFileStructure(format!(
                    "tensor '{}' has {} dimensions (max {})",
                    name, n_dims, MAX_DIMS
                )));
            }
            let mut shape = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                shape.push(utils::read_u64_le(&mut *storage)?);
            }
            // GGUF writes extents innermost first; flip to innermost last.
            shape.reverse();
            let type_id = utils::read_u32_le(&mut *storage)?;
            let rel_offset = utils::read_u64_le(&mut *storage)?;

            let value_type = ggml_type_to_value_type(type_id);
            let mut info = TensorInfo::from_row_major(name, value_type, shape)?;
            info.offset_start = rel_offset;
            tensors.push(info);
        }
        tensors.sort_by_key(|t| t.offset_start);

        let data_start = utils::align_up(storage.current_position(), alignment);
        let data_size = tensors.iter().map(TensorInfo::end_offset).max().unwrap_or(0);
        debug!(
            "gguf: {} tensors, data region at {} ({} bytes, alignment {})",
            tensors.len(),
            data_start,
            data_size,
            alignment
        );
        Ok(GgufReader {
            storage,
            tensors,
            region: Region::new(data_start, data_size),
            state: BufferState::Pending,
        })
    }
}

/// Upper bound on one GGUF string, to bound memory on corrupt lengths.
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

fn read_string(storage: &mut dyn Storage) -> Result<String, Error> {
    let len = utils::read_u64_le(storage)?;
    if len > MAX_STRING_LEN {
        return Err(Error::InvalidFileStructure(format!(
            "GGUF string of {} bytes exceeds the {} byte cap",
            len, MAX_STRING_LEN
        )));
    }
    let bytes = storage.read(len, ReadFlags::NONE)?.into_owned();
    String::from_utf8(bytes).map_err(|e| {
        Error::InvalidFileStructure(format!("invalid UTF-8 in GGUF string: {}", e))
    })
}

/// Walks past a metadata value of the given type tag.
fn skip_value(storage: &mut dyn Storage, value_type: u32, depth: u32) -> Result<(), Error> {
    if depth > 32 {
        return Err(Error::InvalidFileStructure(
            "GGUF metadata nesting too deep".to_string(),
        ));
    }
    let fixed = match value_type {
        META_UINT8 | META_INT8 | META_BOOL => Some(1),
        META_UINT16 | META_INT16 => Some(2),
        META_UINT32 | META_INT32 | META_FLOAT32 => Some(4),
        META_UINT64 | META_INT64 | META_FLOAT64 => Some(8),
        _ => None,
    };
    match (fixed, value_type) {
        (Some(width), _) => {
            storage.read(width, ReadFlags::TEMPORARY)?;
        }
        (None, META_STRING) => {
            read_string(storage)?;
        }
        (None, META_ARRAY) => {
            let element_type = utils::read_u32_le(storage)?;
            let count = utils::read_u64_le(storage)?;
            for _ in 0..count {
                skip_value(storage, element_type, depth + 1)?;
            }
        }
        _ => {
            return Err(Error::InvalidFileStructure(format!(
                "unknown GGUF metadata value type {}",
                value_type
            )));
        }
    }
    Ok(())
}

impl TensorReader for GgufReader {
    fn read_next_buffer(&mut self) -> Result<bool, Error> {
        match self.state {
            BufferState::Pending if !self.tensors.is_empty() => {
                self.storage.seek_to(self.region.offset)?;
                self.state = BufferState::Current;
                Ok(true)
            }
            _ => {
                self.state = BufferState::Finished;
                Ok(false)
            }
        }
    }

    fn tensors_in_buffer(&self) -> &[TensorInfo] {
        match self.state {
            BufferState::Current => &self.tensors,
            _ => &[],
        }
    }

    fn buffer_size(&self) -> u64 {
        match self.state {
            BufferState::Current => self.region.size,
            _ => 0,
        }
    }

    fn read(&mut self, length: u64, flags: ReadFlags) -> Result<Cow<'_, [u8]>, Error> {
        Ok(self.region.read(&mut *self.storage, length, flags)?)
    }

    fn read_all_tensor_infos(&mut self) -> Result<Vec<TensorInfo>, Error> {
        let infos = match self.state {
            BufferState::Pending => self
                .tensors
                .iter()
                .map(TensorInfo::with_unknown_offset)
                .collect(),
            _ => Vec::new(),
        };
        self.state = BufferState::Finished;
        Ok(infos)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::utils::align_up;

    /// Incremental GGUF v3 byte-image builder for fixtures.
    pub(crate) struct GgufBuilder {
        alignment: u64,
        kvs: Vec<u8>,
        kv_count: u64,
        infos: Vec<u8>,
        tensor_count: u64,
        data: Vec<u8>,
    }

    impl GgufBuilder {
        pub(crate) fn new() -> Self {
            GgufBuilder {
                alignment: DEFAULT_ALIGNMENT,
                kvs: Vec::new(),
                kv_count: 0,
                infos: Vec::new(),
                tensor_count: 0,
                data: Vec::new(),
            }
        }

        fn put_string(out: &mut Vec<u8>, s: &str) {
            out.extend_from_slice(&(s.len() as u64).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }

        pub(crate) fn alignment(mut self, value: u32) -> Self {
            Self::put_string(&mut self.kvs, "general.alignment");
            self.kvs.extend_from_slice(&META_UINT32.to_le_bytes());
            self.kvs.extend_from_slice(&value.to_le_bytes());
            self.kv_count += 1;
            // Keep the builder's own layout sane even when the test wants
            // the reader to reject the written value.
            self.alignment = value.max(1) as u64;
            self
        }

        pub(crate) fn kv_string(mut self, key: &str, value: &str) -> Self {
            Self::put_string(&mut self.kvs, key);
            self.kvs.extend_from_slice(&META_STRING.to_le_bytes());
            Self::put_string(&mut self.kvs, value);
            self.kv_count += 1;
            self
        }

        pub(crate) fn kv_u32_array(mut self, key: &str, values: &[u32]) -> Self {
            Self::put_string(&mut self.kvs, key);
            self.kvs.extend_from_slice(&META_ARRAY.to_le_bytes());
            self.kvs.extend_from_slice(&META_UINT32.to_le_bytes());
            self.kvs
                .extend_from_slice(&(values.len() as u64).to_le_bytes());
            for v in values {
                self.kvs.extend_from_slice(&v.to_le_bytes());
            }
            self.kv_count += 1;
            self
        }

        /// Adds a tensor; `dims` are given innermost-last (row-major) and
        /// written to the file in GGUF's reversed order.
        pub(crate) fn tensor(mut self, name: &str, dims: &[u64], type_id: u32, payload: &[u8]) -> Self {
            let offset = align_up(self.data.len() as u64, self.alignment);
            self.data.resize(offset as usize, 0);
            self.data.extend_from_slice(payload);

            Self::put_string(&mut self.infos, name);
            self.infos
                .extend_from_slice(&(dims.len() as u32).to_le_bytes());
            for dim in dims.iter().rev() {
                self.infos.extend_from_slice(&dim.to_le_bytes());
            }
            self.infos.extend_from_slice(&type_id.to_le_bytes());
            self.infos.extend_from_slice(&offset.to_le_bytes());
            self.tensor_count += 1;
            self
        }

        pub(crate) fn finish(self) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend_from_slice(GGUF_MAGIC);
            out.extend_from_slice(&GGUF_VERSION.to_le_bytes());
            out.extend_from_slice(&self.tensor_count.to_le_bytes());
            out.extend_from_slice(&self.kv_count.to_le_bytes());
            out.extend_from_slice(&self.kvs);
            out.extend_from_slice(&self.infos);
            let data_start = align_up(out.len() as u64, self.alignment);
            out.resize(data_start as usize, 0);
            out.extend_from_slice(&self.data);
            out
        }
    }

    #[test]
    fn test_header_and_tensor_infos() {
        let image = GgufBuilder::new()
            .kv_string("general.name", "test model")
            .kv_u32_array("tokenizer.lengths", &[1, 2, 3])
            .tensor("w0", &[2, 3], 0, &[0u8; 24])
            .tensor("w1", &[4], 26, &[0u8; 16])
            .finish();

        let mut reader = GgufReader::new(Box::new(MemoryStorage::new(image))).unwrap();
        assert!(reader.read_next_buffer().unwrap());
        let tensors = reader.tensors_in_buffer();
        assert_eq!(tensors.len(), 2);
        assert_eq!(tensors[0].name, "w0");
        assert_eq!(tensors[0].value_type, ValueType::F32);
        assert_eq!(tensors[0].shape, vec![2, 3]);
        assert_eq!(tensors[0].stride, vec![3, 1]);
        assert_eq!(tensors[1].value_type, ValueType::I32);
        assert!(!reader.read_next_buffer().unwrap());
    }

    #[test]
    fn test_alignment_override() {
        let image = GgufBuilder::new()
            .alignment(96)
            .tensor("a", &[4], 0, &[0u8; 16])
            .tensor("b", &[2, 3, 2, 2], 1, &[0u8; 48])
            .finish();

        let mut reader = GgufReader::new(Box::new(MemoryStorage::new(image))).unwrap();
        assert_eq!(reader.region.offset % 96, 0);
        assert!(reader.read_next_buffer().unwrap());
        let tensors = reader.tensors_in_buffer();
        assert_eq!(tensors[0].offset_start % 96, 0);
        assert_eq!(tensors[1].offset_start % 96, 0);
        // Stride of a [2,3,2,2] tensor is [12,4,2,1].
        assert_eq!(tensors[1].stride, vec![12, 4, 2, 1]);
    }

    #[test]
    fn test_bad_alignment_rejected() {
        for bad in [0u32, 12, 7] {
            let image = GgufBuilder::new().alignment(bad).finish();
            assert!(matches!(
                GgufReader::new(Box::new(MemoryStorage::new(image))),
                Err(Error::UnsupportedAlignment(_))
            ));
        }
    }

    #[test]
    fn test_version_check() {
        let mut image = GgufBuilder::new().finish();
        image[4] = 2; // version 2
        assert!(matches!(
            GgufReader::new(Box::new(MemoryStorage::new(image))),
            Err(Error::UnsupportedVersion {
                format: "GGUF",
                version: 2
            })
        ));
    }

    #[test]
    fn test_bad_magic() {
        let image = b"GGLA\x03\x00\x00\x00".to_vec();
        assert!(matches!(
            GgufReader::new(Box::new(MemoryStorage::new(image))),
            Err(Error::InvalidMagicNumber { .. })
        ));
    }

    #[test]
    fn test_quantized_type_is_unknown_with_zero_size() {
        let image = GgufBuilder::new()
            .tensor("q", &[64], 2, &[0u8; 36]) // q4_0 payload
            .tensor("f", &[2], 0, &[0u8; 8])
            .finish();
        let mut reader = GgufReader::new(Box::new(MemoryStorage::new(image))).unwrap();
        assert!(reader.read_next_buffer().unwrap());
        let tensors = reader.tensors_in_buffer();
        let quant = tensors.iter().find(|t| t.name == "q").unwrap();
        assert_eq!(quant.value_type, ValueType::Unknown);
        assert_eq!(quant.size_bytes, 0);
        // Still listed alongside the supported tensor.
        assert_eq!(tensors.len(), 2);
    }

    #[test]
    fn test_rank0_through_rank4() {
        let image = GgufBuilder::new()
            .tensor("r0", &[], 0, &[0u8; 4])
            .tensor("r1", &[3], 0, &[0u8; 12])
            .tensor("r2", &[2, 2], 0, &[0u8; 16])
            .tensor("r3", &[2, 2, 2], 0, &[0u8; 32])
            .tensor("r4", &[2, 3, 2, 2], 0, &[0u8; 96])
            .finish();
        let mut reader = GgufReader::new(Box::new(MemoryStorage::new(image))).unwrap();
        let infos = reader.read_all_tensor_infos().unwrap();
        assert_eq!(infos.len(), 5);
        let r0 = infos.iter().find(|t| t.name == "r0").unwrap();
        assert!(r0.shape.is_empty());
        assert_eq!(r0.size_bytes, 4);
        let r4 = infos.iter().find(|t| t.name == "r4").unwrap();
        assert_eq!(r4.shape, vec![2, 3, 2, 2]);
    }

    #[test]
    fn test_empty_gguf() {
        let image = GgufBuilder::new().kv_string("general.name", "empty").finish();
        let mut reader = GgufReader::new(Box::new(MemoryStorage::new(image))).unwrap();
        assert!(!reader.read_next_buffer().unwrap());

        let image = GgufBuilder::new().finish();
        let mut reader = GgufReader::new(Box::new(MemoryStorage::new(image))).unwrap();
        assert!(reader.read_all_tensor_infos().unwrap().is_empty());
    }

    #[test]
    fn test_dims_are_reversed_from_file_order() {
        // The builder takes row-major dims and writes them reversed; a
        // [6, 4] tensor therefore has innermost extent 4 and stride [4, 1].
        let image = GgufBuilder::new()
            .tensor("m", &[6, 4], 1, &[0u8; 48])
            .finish();
        let mut reader = GgufReader::new(Box::new(MemoryStorage::new(image))).unwrap();
        assert!(reader.read_next_buffer().unwrap());
        let info = &reader.tensors_in_buffer()[0];
        assert_eq!(info.shape, vec![6, 4]);
        assert_eq!(info.stride, vec![4, 1]);
        assert_eq!(info.size_bytes, 48);
    }
}
