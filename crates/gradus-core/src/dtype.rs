use std::fmt;
use std::ops::{Add, Div, Mul, Sub};

// DType: element types a tensor buffer can hold
//
//   F16  16-bit IEEE half float
//   F32  32-bit float, the default
//   F64  64-bit float, used by gradient checks
//   I32  signed 32-bit int, for argmax contexts, labels and gather indices

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    F32,
    F64,
    I32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
            DType::I32 => 4,
        }
    }

    pub fn is_float(&self) -> bool {
        !matches!(self, DType::I32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
        };
        write!(f, "{}", s)
    }
}

// WithDType: bridge between Rust element types and DType
//
// Arithmetic that every element type supports natively (add, sub, mul, div,
// ordering) is required through std::ops bounds. Transcendental functions go
// through f64 via `to_f64`/`from_f64`, which is exact for f16/f32/i32 inputs.

/// Trait implemented by Rust types that can be stored in a tensor.
pub trait WithDType:
    Copy
    + Send
    + Sync
    + 'static
    + Default
    + PartialOrd
    + fmt::Debug
    + num_traits::NumCast
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
{
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;

    /// Append the little-endian encoding of this value to `out`.
    fn write_le(self, out: &mut Vec<u8>);

    /// Decode one value from exactly `DTYPE.size_in_bytes()` little-endian bytes.
    fn read_le(bytes: &[u8]) -> Self;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    fn one() -> Self {
        Self::from_f64(1.0)
    }
}

macro_rules! le_bytes {
    ($bytes:expr, $n:literal) => {{
        let mut buf = [0u8; $n];
        buf.copy_from_slice(&$bytes[..$n]);
        buf
    }};
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(bytes: &[u8]) -> Self {
        f32::from_le_bytes(le_bytes!(bytes, 4))
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(bytes: &[u8]) -> Self {
        f64::from_le_bytes(le_bytes!(bytes, 8))
    }
}

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(bytes: &[u8]) -> Self {
        half::f16::from_le_bytes(le_bytes!(bytes, 2))
    }
}

impl WithDType for i32 {
    const DTYPE: DType = DType::I32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i32
    }
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(bytes: &[u8]) -> Self {
        i32::from_le_bytes(le_bytes!(bytes, 4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F64.size_in_bytes(), 8);
        assert_eq!(DType::I32.size_in_bytes(), 4);
    }

    #[test]
    fn test_with_dtype_f32() {
        assert_eq!(f32::DTYPE, DType::F32);
        assert_eq!(f32::from_f64(3.14).to_f64(), 3.140000104904175);
    }

    #[test]
    fn test_le_encoding() {
        let mut bytes = Vec::new();
        1.5f32.write_le(&mut bytes);
        (-7i32).write_le(&mut bytes);
        half::f16::from_f64(0.25).write_le(&mut bytes);
        assert_eq!(bytes.len(), 10);
        assert_eq!(f32::read_le(&bytes[0..4]), 1.5);
        assert_eq!(i32::read_le(&bytes[4..8]), -7);
        assert_eq!(half::f16::read_le(&bytes[8..10]).to_f64(), 0.25);
    }

    #[test]
    fn test_i32_truncates() {
        assert_eq!(i32::from_f64(2.9), 2);
        assert!(!DType::I32.is_float());
        assert!(DType::F16.is_float());
    }
}
