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

//! `Constant` node synthesis for backward rules.
//!
//! Scalars are encoded in the requested element type before they are
//! embedded, so a half-precision rule gets a half-precision payload rather
//! than an `f32` one.

use half::{bf16, f16};

use crate::ir::{Attribute, TensorElement, TensorProto};
use crate::types::{DType, ShapeDim, TensorType};

use super::defs::{ArgDef, NodeDef};
use super::error::AutodiffError;

fn constant_node(tensor: TensorProto, arg_name: &str) -> NodeDef {
    let shape = tensor
        .dims
        .iter()
        .map(|&d| ShapeDim::Known(d as usize))
        .collect();
    let ty = TensorType::new(tensor.dtype, shape);
    NodeDef::new("Constant", Vec::new(), vec![ArgDef::new(arg_name, Some(ty))])
        .attributes(vec![Attribute::tensor("value", tensor)])
}

/// 1-D constant holding `values`.
pub fn constant_vector_node<T: TensorElement>(values: &[T], arg_name: &str) -> NodeDef {
    let tensor = TensorProto::from_values(values, vec![values.len() as i64]);
    constant_node(tensor, arg_name)
}

/// Scalar tensor with shape `[]` or `[1]`.
pub fn scalar_tensor_proto<T: TensorElement>(
    value: T,
    shape: &[i64],
) -> Result<TensorProto, AutodiffError> {
    if !(shape.is_empty() || shape == [1]) {
        return Err(AutodiffError::InvalidConstantShape(shape.to_vec()));
    }
    Ok(TensorProto::from_values(&[value], shape.to_vec()))
}

pub fn constant_scalar_node<T: TensorElement>(
    value: T,
    shape: &[i64],
    arg_name: &str,
) -> Result<NodeDef, AutodiffError> {
    Ok(constant_node(scalar_tensor_proto(value, shape)?, arg_name))
}

/// Encodes `value` as a `[1]`-shaped tensor of element type `dtype`.
pub fn scalar_tensor_proto_by_elem_type(
    value: f32,
    dtype: DType,
) -> Result<TensorProto, AutodiffError> {
    const SHAPE: &[i64] = &[1];
    match dtype {
        DType::F32 => scalar_tensor_proto(value, SHAPE),
        DType::F64 => scalar_tensor_proto(f64::from(value), SHAPE),
        DType::F16 => scalar_tensor_proto(f16::from_f32(value), SHAPE),
        DType::BF16 => scalar_tensor_proto(bf16::from_f32(value), SHAPE),
        DType::F8E4M3FN | DType::F8E4M3FNUZ | DType::F8E5M2 | DType::F8E5M2FNUZ => {
            float8_scalar(value, dtype)
        }
        DType::I32 | DType::I64 | DType::Bool => Err(AutodiffError::UnsupportedConstantType(dtype)),
    }
}

#[cfg(feature = "float8")]
fn float8_scalar(value: f32, dtype: DType) -> Result<TensorProto, AutodiffError> {
    use crate::types::float8::{F8E4M3FN, F8E4M3FNUZ, F8E5M2, F8E5M2FNUZ};

    const SHAPE: &[i64] = &[1];
    match dtype {
        DType::F8E4M3FN => scalar_tensor_proto(F8E4M3FN::from_f32(value), SHAPE),
        DType::F8E4M3FNUZ => scalar_tensor_proto(F8E4M3FNUZ::from_f32(value), SHAPE),
        DType::F8E5M2 => scalar_tensor_proto(F8E5M2::from_f32(value), SHAPE),
        DType::F8E5M2FNUZ => scalar_tensor_proto(F8E5M2FNUZ::from_f32(value), SHAPE),
        other => Err(AutodiffError::UnsupportedConstantType(other)),
    }
}

#[cfg(not(feature = "float8"))]
fn float8_scalar(_value: f32, dtype: DType) -> Result<TensorProto, AutodiffError> {
    Err(AutodiffError::UnsupportedConstantType(dtype))
}

pub fn constant_scalar_node_by_elem_type(
    value: f32,
    arg_name: &str,
    dtype: DType,
) -> Result<NodeDef, AutodiffError> {
    Ok(constant_node(
        scalar_tensor_proto_by_elem_type(value, dtype)?,
        arg_name,
    ))
}

pub fn zero_constant_node(dtype: DType) -> Result<NodeDef, AutodiffError> {
    constant_scalar_node_by_elem_type(
        0.0,
        &format!("ZeroConstant_Type{}", dtype.elem_type()),
        dtype,
    )
}

pub fn half_constant_node(dtype: DType) -> Result<NodeDef, AutodiffError> {
    constant_scalar_node_by_elem_type(
        0.5,
        &format!("HalfConstant_Type{}", dtype.elem_type()),
        dtype,
    )
}

pub fn one_constant_node(dtype: DType) -> Result<NodeDef, AutodiffError> {
    constant_scalar_node_by_elem_type(
        1.0,
        &format!("OneConstant_Type{}", dtype.elem_type()),
        dtype,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::AttributeValue;

    fn payload(node: &NodeDef) -> &TensorProto {
        match &node.attribute("value").expect("value attribute").value {
            AttributeValue::Tensor(t) => t,
            other => panic!("unexpected attribute {other:?}"),
        }
    }

    #[test]
    fn half_constant_in_f16_decodes_exactly() {
        let node = half_constant_node(DType::F16).unwrap();
        let tensor = payload(&node);
        assert_eq!(tensor.dtype, DType::F16);
        assert_eq!(tensor.dims, vec![1]);
        assert_eq!(tensor.raw_data.len(), 2);
        assert_eq!(tensor.to_f32_vec(), vec![0.5]);
    }

    #[test]
    fn named_constants_differ_per_element_type() {
        let f32_one = one_constant_node(DType::F32).unwrap();
        let bf16_one = one_constant_node(DType::BF16).unwrap();
        assert_eq!(f32_one.outputs[0].name, "OneConstant_Type1");
        assert_eq!(bf16_one.outputs[0].name, "OneConstant_Type16");
        assert_ne!(f32_one.outputs[0].name, bf16_one.outputs[0].name);
        assert_eq!(zero_constant_node(DType::F32).unwrap().outputs[0].name, "ZeroConstant_Type1");
    }

    #[test]
    fn rejects_non_scalar_shapes() {
        let err = scalar_tensor_proto(1.0f32, &[2]).unwrap_err();
        assert!(matches!(err, AutodiffError::InvalidConstantShape(ref s) if s == &vec![2]));
        assert!(scalar_tensor_proto(1.0f32, &[1, 1]).is_err());
        assert!(scalar_tensor_proto(1.0f32, &[]).is_ok());
    }

    #[test]
    fn integer_types_have_no_float_constant() {
        let err = one_constant_node(DType::I64).unwrap_err();
        assert!(matches!(err, AutodiffError::UnsupportedConstantType(DType::I64)));
    }

    #[test]
    fn vector_constant_is_one_dimensional() {
        let node = constant_vector_node(&[0i64, 2], "axes");
        let tensor = payload(&node);
        assert_eq!(tensor.dims, vec![2]);
        assert_eq!(tensor.dtype, DType::I64);
        assert_eq!(node.outputs[0].name, "axes");
    }

    #[cfg(feature = "float8")]
    #[test]
    fn float8_constants_use_their_own_encoding() {
        let node = one_constant_node(DType::F8E4M3FN).unwrap();
        let tensor = payload(&node);
        assert_eq!(tensor.raw_data, vec![0x38]);
        assert_eq!(tensor.to_f32_vec(), vec![1.0]);

        let node = half_constant_node(DType::F8E5M2FNUZ).unwrap();
        assert_eq!(payload(&node).to_f32_vec(), vec![0.5]);
    }
}
