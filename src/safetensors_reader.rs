//! Safetensors container parser.
//!
//! The format is a little-endian `u64` header length, that many bytes of
//! JSON mapping tensor names to `{dtype, shape, data_offsets}`, then one
//! contiguous data region. All tensors therefore live in a single buffer
//! starting right after the header.

use std::borrow::Cow;

use log::debug;
use serde::Deserialize;

use crate::error::Error;
use crate::models::{TensorInfo, ValueType};
use crate::reader::{BufferState, Region, TensorReader};
use crate::storage::{ReadFlags, Storage};
use crate::utils;

/// Upper bound on the JSON header, to bound memory on corrupt files.
const MAX_HEADER_SIZE: u64 = 100 * 1024 * 1024;

/// Raw JSON shape of one header entry.
#[derive(Deserialize)]
struct RawTensorEntry {
    dtype: String,
    shape: Vec<u64>,
    data_offsets: (u64, u64),
}

fn dtype_from_str(dtype: &str) -> Result<ValueType, Error> {
    match dtype {
        "F32" => Ok(ValueType::F32),
        "F64" => Ok(ValueType::F64),
        "F16" => Ok(ValueType::F16),
        "BF16" => Ok(ValueType::BF16),
        "U8" => Ok(ValueType::U8),
        "U16" => Ok(ValueType::U16),
        "U32" => Ok(ValueType::U32),
        "U64" => Ok(ValueType::U64),
        "I8" => Ok(ValueType::I8),
        "I16" => Ok(ValueType::I16),
        "I32" => Ok(ValueType::I32),
        "I64" => Ok(ValueType::I64),
        "F8_E5M2" => Ok(ValueType::F8E5M2),
        "F8_E4M3" => Ok(ValueType::F8E4M3),
        "BOOL" => Ok(ValueType::Bool),
        other => Err(Error::UnsupportedDType(other.to_string())),
    }
}

impl std::fmt::Debug for SafeTensorsReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeTensorsReader").finish_non_exhaustive()
    }
}

/// Reader for `.safetensors` containers.
pub struct SafeTensorsReader {
    storage: Box<dyn Storage>,
    tensors: Vec<TensorInfo>,
    region: Region,
    state: BufferState,
}

impl SafeTensorsReader {
    /// Parses the header from `storage`, which must be positioned at the
    /// start of the container.
    pub fn new(mut storage: Box<dyn Storage>) -> Result<Self, Error> {
        let header_len = utils::read_u64_le(&mut *storage)?;
        if header_len > MAX_HEADER_SIZE {
            return Err(Error::InvalidFileStructure(format!(
                "safetensors header of {} bytes exceeds the {} byte cap",
                header_len, MAX_HEADER_SIZE
            )));
        }
        let header_bytes = storage.read(header_len, ReadFlags::NONE)?.into_owned();
        let header: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&header_bytes).map_err(|e| {
                Error::InvalidFileStructure(format!("safetensors header is not valid JSON: {}", e))
            })?;

        let mut tensors = Vec::with_capacity(header.len());
        for (name, value) in header {
            if name == "__metadata__" {
                continue;
            }
            let entry: RawTensorEntry = serde_json::from_value(value).map_err(|e| {
                Error::InvalidFileStructure(format!(
                    "safetensors entry '{}' is malformed: {}",
                    name, e
                ))
            })?;
            let (start, end) = entry.data_offsets;
            if end < start {
                return Err(Error::InvalidFileStructure(format!(
                    "safetensors entry '{}' has data_offsets end {} before start {}",
                    name, end, start
                )));
            }
            let value_type = dtype_from_str(&entry.dtype)?;
            let mut info = TensorInfo::from_row_major(name.clone(), value_type, entry.shape)?;
            if info.size_bytes != end - start {
                return Err(Error::InvalidFileStructure(format!(
                    "safetensors entry '{}' spans {} bytes but its shape needs {}",
                    name,
                    end - start,
                    info.size_bytes
                )));
            }
            info.offset_start = start;
            tensors.push(info);
        }

        tensors.sort_by_key(|t| t.offset_start);
        // The data region is contiguous: consecutive tensors must share a
        // boundary exactly.
        for pair in tensors.windows(2) {
            let end = pair[0].end_offset();
            let next = pair[1].offset_start;
            if end != next {
                return Err(Error::InvalidFileStructure(format!(
                    "safetensors tensors '{}' and '{}' {} at offset {}",
                    pair[0].name,
                    pair[1].name,
                    if next > end { "leave a gap" } else { "overlap" },
                    end.min(next)
                )));
            }
        }

        let data_size = tensors.iter().map(TensorInfo::end_offset).max().unwrap_or(0);
        debug!(
            "safetensors: {} tensors, {} byte data region",
            tensors.len(),
            data_size
        );
        Ok(SafeTensorsReader {
            storage,
            tensors,
            region: Region::new(8 + header_len, data_size),
            state: BufferState::Pending,
        })
    }
}

impl TensorReader for SafeTensorsReader {
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

    /// Builds a safetensors byte image from (name, dtype, shape, data).
    pub(crate) fn build_safetensors(entries: &[(&str, &str, &[u64], Vec<u8>)]) -> Vec<u8> {
        let mut header = String::from("{");
        let mut data = Vec::new();
        for (i, (name, dtype, shape, payload)) in entries.iter().enumerate() {
            let start = data.len();
            data.extend_from_slice(payload);
            let end = data.len();
            if i > 0 {
                header.push(',');
            }
            let dims = shape
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(",");
            header.push_str(&format!(
                "\"{}\":{{\"dtype\":\"{}\",\"shape\":[{}],\"data_offsets\":[{},{}]}}",
                name, dtype, dims, start, end
            ));
        }
        header.push('}');

        let mut out = Vec::new();
        out.extend_from_slice(&(header.len() as u64).to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&data);
        out
    }

    fn i64_bytes(values: &[i64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_basic_parse() {
        let image = build_safetensors(&[
            ("a", "F32", &[2, 3], vec![0u8; 24]),
            ("b", "I16", &[4], vec![0u8; 8]),
        ]);
        let mut reader = SafeTensorsReader::new(Box::new(MemoryStorage::new(image))).unwrap();
        assert!(reader.read_next_buffer().unwrap());
        let tensors = reader.tensors_in_buffer();
        assert_eq!(tensors.len(), 2);
        assert_eq!(tensors[0].name, "a");
        assert_eq!(tensors[0].offset_start, 0);
        assert_eq!(tensors[0].stride, vec![3, 1]);
        assert_eq!(tensors[1].offset_start, 24);
        assert_eq!(reader.buffer_size(), 32);
        assert!(!reader.read_next_buffer().unwrap());
    }

    #[test]
    fn test_int_tensor_values() {
        let values: [i64; 6] = [1, 0, -1, 64, i64::MIN, i64::MAX];
        let image = build_safetensors(&[("int64", "I64", &[6], i64_bytes(&values))]);
        let mut reader = SafeTensorsReader::new(Box::new(MemoryStorage::new(image))).unwrap();
        assert!(reader.read_next_buffer().unwrap());
        let bytes = reader.read(48, ReadFlags::NONE).unwrap().into_owned();
        let first = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let fifth = i64::from_le_bytes(bytes[32..40].try_into().unwrap());
        assert_eq!(first, 1);
        assert_eq!(fifth, -9223372036854775808);
    }

    #[test]
    fn test_metadata_entry_skipped() {
        let mut header = String::new();
        header.push_str("{\"__metadata__\":{\"framework\":\"pt\"},");
        header.push_str("\"t\":{\"dtype\":\"U8\",\"shape\":[2],\"data_offsets\":[0,2]}}");
        let mut image = Vec::new();
        image.extend_from_slice(&(header.len() as u64).to_le_bytes());
        image.extend_from_slice(header.as_bytes());
        image.extend_from_slice(&[7, 8]);

        let mut reader = SafeTensorsReader::new(Box::new(MemoryStorage::new(image))).unwrap();
        let infos = reader.read_all_tensor_infos().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "t");
        assert_eq!(infos[0].offset_start, TensorInfo::UNKNOWN_OFFSET);
    }

    #[test]
    fn test_empty_file() {
        let image = build_safetensors(&[]);
        let mut reader = SafeTensorsReader::new(Box::new(MemoryStorage::new(image))).unwrap();
        assert!(reader.read_all_tensor_infos().unwrap().is_empty());

        let image = build_safetensors(&[]);
        let mut reader = SafeTensorsReader::new(Box::new(MemoryStorage::new(image))).unwrap();
        assert!(!reader.read_next_buffer().unwrap());
    }

    #[test]
    fn test_gap_rejected() {
        let mut header = String::new();
        header.push_str("{\"a\":{\"dtype\":\"U8\",\"shape\":[2],\"data_offsets\":[0,2]},");
        header.push_str("\"b\":{\"dtype\":\"U8\",\"shape\":[2],\"data_offsets\":[3,5]}}");
        let mut image = Vec::new();
        image.extend_from_slice(&(header.len() as u64).to_le_bytes());
        image.extend_from_slice(header.as_bytes());
        image.extend_from_slice(&[0u8; 5]);

        assert!(matches!(
            SafeTensorsReader::new(Box::new(MemoryStorage::new(image))),
            Err(Error::InvalidFileStructure(_))
        ));
    }

    #[test]
    fn test_overlap_rejected() {
        let mut header = String::new();
        header.push_str("{\"a\":{\"dtype\":\"U8\",\"shape\":[2],\"data_offsets\":[0,2]},");
        header.push_str("\"b\":{\"dtype\":\"U8\",\"shape\":[2],\"data_offsets\":[1,3]}}");
        let mut image = Vec::new();
        image.extend_from_slice(&(header.len() as u64).to_le_bytes());
        image.extend_from_slice(header.as_bytes());
        image.extend_from_slice(&[0u8; 3]);

        assert!(SafeTensorsReader::new(Box::new(MemoryStorage::new(image))).is_err());
    }

    #[test]
    fn test_unknown_dtype_rejected() {
        let image = build_safetensors(&[("q", "Q4_0", &[2], vec![0u8; 2])]);
        assert!(matches!(
            SafeTensorsReader::new(Box::new(MemoryStorage::new(image))),
            Err(Error::UnsupportedDType(_))
        ));
    }

    #[test]
    fn test_size_shape_mismatch_rejected() {
        let mut header = String::new();
        header.push_str("{\"t\":{\"dtype\":\"F32\",\"shape\":[2],\"data_offsets\":[0,9]}}");
        let mut image = Vec::new();
        image.extend_from_slice(&(header.len() as u64).to_le_bytes());
        image.extend_from_slice(header.as_bytes());
        image.extend_from_slice(&[0u8; 9]);
        assert!(SafeTensorsReader::new(Box::new(MemoryStorage::new(image))).is_err());
    }

    #[test]
    fn test_rank0_tensor() {
        let image = build_safetensors(&[("scalar", "F64", &[], vec![0u8; 8])]);
        let mut reader = SafeTensorsReader::new(Box::new(MemoryStorage::new(image))).unwrap();
        assert!(reader.read_next_buffer().unwrap());
        let info = &reader.tensors_in_buffer()[0];
        assert!(info.shape.is_empty());
        assert!(info.stride.is_empty());
        assert_eq!(info.size_bytes, 8);
    }

    #[test]
    fn test_header_cap() {
        let mut image = Vec::new();
        image.extend_from_slice(&(MAX_HEADER_SIZE + 1).to_le_bytes());
        image.extend_from_slice(b"{}");
        assert!(matches!(
            SafeTensorsReader::new(Box::new(MemoryStorage::new(image))),
            Err(Error::InvalidFileStructure(_))
        ));
    }
}
