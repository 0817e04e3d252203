//! Core data model shared by every format parser.

use crate::error::Error;

/// Element representation of a tensor.
///
/// Each variant has a fixed element size in bytes. [`ValueType::Unknown`]
/// has size 0 and marks an element type this crate does not interpret
/// (quantized GGUF blocks, unrecognized storage classes). Tensors of such
/// types are still listed; their payload layout is the caller's problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueType {
    Unknown,
    F32,
    F64,
    /// IEEE 754 binary16.
    F16,
    BF16,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F8E5M2,
    F8E4M3,
    /// One byte per element.
    Bool,
    /// Two packed f32, 8 bytes per element.
    ComplexF32,
    /// Two packed f64, 16 bytes per element.
    ComplexF64,
    /// Two packed f16, 4 bytes per element.
    ComplexF16,
}

impl ValueType {
    /// Fixed element size in bytes; 0 for [`ValueType::Unknown`].
    pub fn element_size(&self) -> u64 {
        match self {
            ValueType::Unknown => 0,
            ValueType::U8 | ValueType::I8 | ValueType::Bool => 1,
            ValueType::F8E5M2 | ValueType::F8E4M3 => 1,
            ValueType::F16 | ValueType::BF16 | ValueType::U16 | ValueType::I16 => 2,
            ValueType::F32 | ValueType::U32 | ValueType::I32 => 4,
            ValueType::ComplexF16 => 4,
            ValueType::F64 | ValueType::U64 | ValueType::I64 => 8,
            ValueType::ComplexF32 => 8,
            ValueType::ComplexF64 => 16,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Unknown => "unknown",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::F16 => "f16",
            ValueType::BF16 => "bf16",
            ValueType::U8 => "u8",
            ValueType::U16 => "u16",
            ValueType::U32 => "u32",
            ValueType::U64 => "u64",
            ValueType::I8 => "i8",
            ValueType::I16 => "i16",
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F8E5M2 => "f8_e5m2",
            ValueType::F8E4M3 => "f8_e4m3",
            ValueType::Bool => "bool",
            ValueType::ComplexF32 => "complex_f32",
            ValueType::ComplexF64 => "complex_f64",
            ValueType::ComplexF16 => "complex_f16",
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Computes the canonical row-major stride for a shape (innermost last).
pub fn row_major_stride(shape: &[u64]) -> Vec<u64> {
    let mut stride = vec![1u64; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        stride[i] = stride[i + 1].saturating_mul(shape[i + 1]);
    }
    stride
}

/// Metadata for one tensor, no payload attached.
///
/// `offset_start` is relative to the buffer that contains the tensor. A
/// listing that crosses buffers uses [`TensorInfo::UNKNOWN_OFFSET`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub offset_start: u64,
    pub size_bytes: u64,
    pub value_type: ValueType,
    /// Dimension extents, innermost last. Empty for rank 0.
    pub shape: Vec<u64>,
    /// Per-dimension element-count offsets, same length as `shape`.
    pub stride: Vec<u64>,
}

impl TensorInfo {
    /// Sentinel `offset_start` for listings without per-buffer grouping.
    pub const UNKNOWN_OFFSET: u64 = u64::MAX;

    /// Builds metadata for a canonical row-major tensor.
    ///
    /// `size_bytes = element_size * product(shape)`, checked.
    pub fn from_row_major(
        name: impl Into<String>,
        value_type: ValueType,
        shape: Vec<u64>,
    ) -> Result<Self, Error> {
        let name = name.into();
        let mut elements: u64 = 1;
        for &dim in &shape {
            elements = elements
                .checked_mul(dim)
                .ok_or_else(|| Error::SizeOverflow { name: name.clone() })?;
        }
        let size_bytes = elements
            .checked_mul(value_type.element_size())
            .ok_or_else(|| Error::SizeOverflow { name: name.clone() })?;
        let stride = row_major_stride(&shape);
        Ok(TensorInfo {
            name,
            offset_start: Self::UNKNOWN_OFFSET,
            size_bytes,
            value_type,
            shape,
            stride,
        })
    }

    /// Builds metadata for a strided view over a wider storage.
    ///
    /// `size_bytes = element_size * (1 + sum((shape[i]-1) * stride[i]))`,
    /// checked; a zero extent anywhere yields size 0.
    pub fn from_strides(
        name: impl Into<String>,
        value_type: ValueType,
        shape: Vec<u64>,
        stride: Vec<u64>,
        offset_start: u64,
    ) -> Result<Self, Error> {
        let name = name.into();
        if shape.len() != stride.len() {
            return Err(Error::ShapeStrideMismatch {
                name,
                shape: shape.len(),
                stride: stride.len(),
            });
        }
        let overflow = || Error::SizeOverflow { name: name.clone() };
        let size_bytes = if shape.contains(&0) {
            0
        } else {
            let mut span: u64 = 1;
            for (&dim, &st) in shape.iter().zip(&stride) {
                let reach = (dim - 1).checked_mul(st).ok_or_else(overflow)?;
                span = span.checked_add(reach).ok_or_else(overflow)?;
            }
            span.checked_mul(value_type.element_size())
                .ok_or_else(overflow)?
        };
        Ok(TensorInfo {
            name,
            offset_start,
            size_bytes,
            value_type,
            shape,
            stride,
        })
    }

    /// First byte past the tensor within its buffer.
    pub fn end_offset(&self) -> u64 {
        self.offset_start.saturating_add(self.size_bytes)
    }

    /// Returns a copy with the sentinel offset, for cross-buffer listings.
    pub fn with_unknown_offset(&self) -> TensorInfo {
        let mut info = self.clone();
        info.offset_start = Self::UNKNOWN_OFFSET;
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(ValueType::Unknown.element_size(), 0);
        assert_eq!(ValueType::F16.element_size(), 2);
        assert_eq!(ValueType::BF16.element_size(), 2);
        assert_eq!(ValueType::F8E4M3.element_size(), 1);
        assert_eq!(ValueType::Bool.element_size(), 1);
        assert_eq!(ValueType::ComplexF16.element_size(), 4);
        assert_eq!(ValueType::ComplexF32.element_size(), 8);
        assert_eq!(ValueType::ComplexF64.element_size(), 16);
    }

    #[test]
    fn test_row_major_stride() {
        assert_eq!(row_major_stride(&[2, 3, 2, 2]), vec![12, 4, 2, 1]);
        assert_eq!(row_major_stride(&[5]), vec![1]);
        assert_eq!(row_major_stride(&[]), Vec::<u64>::new());
    }

    #[test]
    fn test_from_row_major_scalar() {
        let info = TensorInfo::from_row_major("s", ValueType::F64, vec![]).unwrap();
        assert!(info.shape.is_empty());
        assert!(info.stride.is_empty());
        assert_eq!(info.size_bytes, 8);
    }

    #[test]
    fn test_from_strides_matches_row_major() {
        let rm = TensorInfo::from_row_major("a", ValueType::F32, vec![2, 3]).unwrap();
        let st =
            TensorInfo::from_strides("a", ValueType::F32, vec![2, 3], vec![3, 1], 0).unwrap();
        assert_eq!(rm.size_bytes, st.size_bytes);
        assert_eq!(rm.stride, st.stride);
    }

    #[test]
    fn test_from_strides_permuted() {
        // A [3, 2] view over a row-major [2, 3] storage.
        let info =
            TensorInfo::from_strides("p", ValueType::I16, vec![3, 2], vec![1, 3], 0).unwrap();
        // 1 + 2*1 + 1*3 = 6 elements reached, 2 bytes each.
        assert_eq!(info.size_bytes, 12);
    }

    #[test]
    fn test_from_strides_rank_mismatch() {
        match TensorInfo::from_strides("b", ValueType::F32, vec![2, 3], vec![1], 0) {
            Err(Error::ShapeStrideMismatch { shape: 2, stride: 1, .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_from_strides_overflow() {
        assert!(matches!(
            TensorInfo::from_strides(
                "o",
                ValueType::F64,
                vec![u64::MAX, 2],
                vec![u64::MAX, 1],
                0
            ),
            Err(Error::SizeOverflow { .. })
        ));
    }

    #[test]
    fn test_zero_extent_has_zero_size() {
        let info =
            TensorInfo::from_strides("z", ValueType::F32, vec![0, 4], vec![4, 1], 0).unwrap();
        assert_eq!(info.size_bytes, 0);
    }

    #[test]
    fn test_unknown_type_has_zero_size() {
        let info = TensorInfo::from_row_major("q", ValueType::Unknown, vec![64, 64]).unwrap();
        assert_eq!(info.size_bytes, 0);
    }
}
