// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! Serialized tensor payloads carried by constant attributes.

use half::{bf16, f16};

use crate::types::DType;

/// A dense tensor value: element type, dims and little-endian raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorProto {
    pub dtype: DType,
    pub dims: Vec<i64>,
    pub raw_data: Vec<u8>,
}

/// Element types that can be stored in a [`TensorProto`].
pub trait TensorElement: Copy {
    const DTYPE: DType;
    fn write_le(self, out: &mut Vec<u8>);
}

macro_rules! le_element {
    ($ty:ty, $dtype:expr) => {
        impl TensorElement for $ty {
            const DTYPE: DType = $dtype;
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    };
}

le_element!(f32, DType::F32);
le_element!(f64, DType::F64);
le_element!(i32, DType::I32);
le_element!(i64, DType::I64);
le_element!(f16, DType::F16);
le_element!(bf16, DType::BF16);

impl TensorElement for bool {
    const DTYPE: DType = DType::Bool;
    fn write_le(self, out: &mut Vec<u8>) {
        out.push(u8::from(self));
    }
}

#[cfg(feature = "float8")]
mod float8_elements {
    use super::TensorElement;
    use crate::types::float8::{F8E4M3FN, F8E4M3FNUZ, F8E5M2, F8E5M2FNUZ};
    use crate::types::DType;

    macro_rules! byte_element {
        ($ty:ty, $dtype:expr) => {
            impl TensorElement for $ty {
                const DTYPE: DType = $dtype;
                fn write_le(self, out: &mut Vec<u8>) {
                    out.push(self.to_bits());
                }
            }
        };
    }

    byte_element!(F8E4M3FN, DType::F8E4M3FN);
    byte_element!(F8E4M3FNUZ, DType::F8E4M3FNUZ);
    byte_element!(F8E5M2, DType::F8E5M2);
    byte_element!(F8E5M2FNUZ, DType::F8E5M2FNUZ);
}

impl TensorProto {
    /// Rank-0 tensor holding one value.
    pub fn scalar<T: TensorElement>(value: T) -> Self {
        Self::from_values(&[value], Vec::new())
    }

    pub fn from_values<T: TensorElement>(values: &[T], dims: Vec<i64>) -> Self {
        let mut raw_data = Vec::with_capacity(values.len() * T::DTYPE.size_in_bytes());
        for &value in values {
            value.write_le(&mut raw_data);
        }
        Self {
            dtype: T::DTYPE,
            dims,
            raw_data,
        }
    }

    pub fn element_count(&self) -> usize {
        self.raw_data.len() / self.dtype.size_in_bytes()
    }

    /// Decodes every element widened to `f32`.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let width = self.dtype.size_in_bytes();
        self.raw_data
            .chunks_exact(width)
            .map(|chunk| decode_f32(self.dtype, chunk))
            .collect()
    }
}

fn decode_f32(dtype: DType, chunk: &[u8]) -> f32 {
    let mut bytes = [0u8; 8];
    bytes[..chunk.len()].copy_from_slice(chunk);
    match dtype {
        DType::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        DType::F64 => f64::from_le_bytes(bytes) as f32,
        DType::I32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
        DType::I64 => i64::from_le_bytes(bytes) as f32,
        DType::F16 => f16::from_le_bytes([bytes[0], bytes[1]]).to_f32(),
        DType::BF16 => bf16::from_le_bytes([bytes[0], bytes[1]]).to_f32(),
        DType::Bool => f32::from(bytes[0]),
        DType::F8E4M3FN | DType::F8E4M3FNUZ | DType::F8E5M2 | DType::F8E5M2FNUZ => {
            decode_float8(dtype, bytes[0])
        }
    }
}

#[cfg(feature = "float8")]
fn decode_float8(dtype: DType, bits: u8) -> f32 {
    use crate::types::float8::{F8E4M3FN, F8E4M3FNUZ, F8E5M2, F8E5M2FNUZ};
    match dtype {
        DType::F8E4M3FN => F8E4M3FN::from_bits(bits).to_f32(),
        DType::F8E4M3FNUZ => F8E4M3FNUZ::from_bits(bits).to_f32(),
        DType::F8E5M2 => F8E5M2::from_bits(bits).to_f32(),
        _ => F8E5M2FNUZ::from_bits(bits).to_f32(),
    }
}

#[cfg(not(feature = "float8"))]
fn decode_float8(_dtype: DType, _bits: u8) -> f32 {
    f32::NAN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_has_no_dims() {
        let t = TensorProto::scalar(3.5f32);
        assert!(t.dims.is_empty());
        assert_eq!(t.element_count(), 1);
        assert_eq!(t.to_f32_vec(), vec![3.5]);
    }

    #[test]
    fn vector_values_decode_in_order() {
        let t = TensorProto::from_values(&[1i64, -2, 3], vec![3]);
        assert_eq!(t.dtype, DType::I64);
        assert_eq!(t.raw_data.len(), 24);
        assert_eq!(t.to_f32_vec(), vec![1.0, -2.0, 3.0]);
    }

    #[test]
    fn half_precision_payloads() {
        let t = TensorProto::scalar(f16::from_f32(0.5));
        assert_eq!(t.raw_data.len(), 2);
        assert_eq!(t.to_f32_vec(), vec![0.5]);

        let t = TensorProto::scalar(bf16::from_f32(-1.0));
        assert_eq!(t.to_f32_vec(), vec![-1.0]);
    }
}
