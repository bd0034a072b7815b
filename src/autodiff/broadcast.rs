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

//! Reduction axes that undo implicit broadcasting in the backward pass.
//!
//! Shapes are aligned at their trailing dimensions. Every output axis where
//! one operand is missing a dimension, or has extent `1` against a larger
//! extent, is an axis the operand's gradient must be summed over. Axes are
//! reported in the index space of the broadcast result, ascending.
//!
//! When the role of an axis cannot be decided from static shapes, the
//! dynamic variant emits a `BroadcastGradientArgs` subgraph that computes
//! the axes at execution time.

use crate::ir::MS_DOMAIN;
use crate::types::ShapeDim;

use super::defs::{ArgDef, NodeDef, OpDef};

/// Reduction axes for the two operands of a broadcasting binary op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastAxes {
    pub a_axes: Vec<i64>,
    pub b_axes: Vec<i64>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BroadcastError {
    /// Two known extents differ and neither is `1`.
    #[error("cannot broadcast shapes {lhs:?} and {rhs:?} for node '{node}'")]
    Incompatible {
        node: String,
        lhs: Vec<ShapeDim>,
        rhs: Vec<ShapeDim>,
    },
    /// Static shapes do not say which operand, if any, is broadcast.
    #[error("broadcast axis {axis} of node '{node}' is not statically known ({lhs} vs {rhs})")]
    Unresolved {
        node: String,
        axis: usize,
        lhs: ShapeDim,
        rhs: ShapeDim,
    },
}

/// Static shape of an arg, if both its type and rank are recorded.
pub fn get_shape(arg: &ArgDef) -> Option<&[ShapeDim]> {
    arg.ty.as_ref()?.shape.as_deref()
}

/// Computes the reduction axes for `a` and `b` from static shapes.
///
/// `node_name` only feeds diagnostics.
pub fn compute_broadcast_backward_axes(
    a_dims: &[ShapeDim],
    b_dims: &[ShapeDim],
    node_name: &str,
) -> Result<BroadcastAxes, BroadcastError> {
    let rank = a_dims.len().max(b_dims.len());
    let a_offset = rank - a_dims.len();
    let b_offset = rank - b_dims.len();
    let mut axes = BroadcastAxes::default();

    for k in 0..rank {
        let a_dim = k.checked_sub(a_offset).map(|i| &a_dims[i]);
        let b_dim = k.checked_sub(b_offset).map(|i| &b_dims[i]);
        let axis = k as i64;

        let (a_dim, b_dim) = match (a_dim, b_dim) {
            (None, _) => {
                axes.a_axes.push(axis);
                continue;
            }
            (_, None) => {
                axes.b_axes.push(axis);
                continue;
            }
            (Some(a), Some(b)) => (a, b),
        };

        match (a_dim, b_dim) {
            (ShapeDim::Known(x), ShapeDim::Known(y)) if x == y => {}
            (ShapeDim::Known(1), ShapeDim::Known(_)) => axes.a_axes.push(axis),
            (ShapeDim::Known(_), ShapeDim::Known(1)) => axes.b_axes.push(axis),
            (ShapeDim::Known(_), ShapeDim::Known(_)) => {
                return Err(BroadcastError::Incompatible {
                    node: node_name.to_string(),
                    lhs: a_dims.to_vec(),
                    rhs: b_dims.to_vec(),
                });
            }
            (ShapeDim::Sym(s), ShapeDim::Sym(t)) if s == t => {}
            (ShapeDim::Known(1), ShapeDim::Sym(_)) => axes.a_axes.push(axis),
            (ShapeDim::Sym(_), ShapeDim::Known(1)) => axes.b_axes.push(axis),
            (lhs, rhs) => {
                return Err(BroadcastError::Unresolved {
                    node: node_name.to_string(),
                    axis: k,
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                });
            }
        }
    }

    Ok(axes)
}

/// Emits nodes computing the reduction axes of `a` and `b` at execution
/// time. `a_shape` and `b_shape` receive the runtime shapes; an axes output
/// that is `None` is left unproduced.
pub fn compute_broadcast_backward_axes_dynamic(
    a: &ArgDef,
    b: &ArgDef,
    a_shape: &ArgDef,
    b_shape: &ArgDef,
    a_axes: Option<&ArgDef>,
    b_axes: Option<&ArgDef>,
    output: &mut Vec<NodeDef>,
) {
    // Explicit names keep the two Shape nodes apart when `a` and `b` are the
    // same tensor.
    output.push(
        NodeDef::new("Shape", vec![a.clone()], vec![a_shape.clone()])
            .named(format!("{}_lhs", a_shape.name)),
    );
    output.push(
        NodeDef::new("Shape", vec![b.clone()], vec![b_shape.clone()])
            .named(format!("{}_rhs", b_shape.name)),
    );

    let axes_outputs = vec![
        a_axes.cloned().unwrap_or_default(),
        b_axes.cloned().unwrap_or_default(),
    ];
    output.push(NodeDef::with_op_def(
        OpDef::new("BroadcastGradientArgs", MS_DOMAIN, 1),
        vec![a_shape.clone(), b_shape.clone()],
        axes_outputs,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kd(n: usize) -> ShapeDim {
        ShapeDim::Known(n)
    }

    #[test]
    fn leading_batch_axis_reduces_shorter_operand() {
        let axes = compute_broadcast_backward_axes(&[kd(1), kd(3)], &[kd(4), kd(1), kd(3)], "n")
            .unwrap();
        assert_eq!(axes.a_axes, vec![0]);
        assert!(axes.b_axes.is_empty());
    }

    #[test]
    fn unit_extents_reduce_on_both_sides() {
        let axes =
            compute_broadcast_backward_axes(&[kd(3), kd(1)], &[kd(1), kd(4)], "n").unwrap();
        assert_eq!(axes.a_axes, vec![1]);
        assert_eq!(axes.b_axes, vec![0]);
    }

    #[test]
    fn symbolic_dims() {
        let b = ShapeDim::sym("batch");
        let axes = compute_broadcast_backward_axes(&[b.clone(), kd(8)], &[b.clone(), kd(8)], "n")
            .unwrap();
        assert_eq!(axes, BroadcastAxes::default());

        let axes = compute_broadcast_backward_axes(&[b.clone(), kd(8)], &[kd(1), kd(8)], "n")
            .unwrap();
        assert_eq!(axes.b_axes, vec![0]);
    }

    #[test]
    fn distinct_symbols_are_unresolved() {
        let err = compute_broadcast_backward_axes(
            &[ShapeDim::sym("N"), kd(4)],
            &[ShapeDim::sym("M"), kd(4)],
            "add_1",
        )
        .unwrap_err();
        assert!(matches!(err, BroadcastError::Unresolved { axis: 0, ref node, .. } if node == "add_1"));
    }

    #[test]
    fn mismatched_extents_are_incompatible() {
        let err = compute_broadcast_backward_axes(&[kd(3)], &[kd(2), kd(2)], "n").unwrap_err();
        assert!(matches!(err, BroadcastError::Incompatible { .. }));
    }

    #[test]
    fn dynamic_axes_emit_shape_and_args_nodes() {
        let a = ArgDef::new("a", None);
        let b = ArgDef::new("b", None);
        let a_shape = ArgDef::new("a_shape", None);
        let b_shape = ArgDef::new("b_shape", None);
        let a_axes = ArgDef::new("a_axes", None);
        let mut nodes = Vec::new();
        compute_broadcast_backward_axes_dynamic(
            &a,
            &b,
            &a_shape,
            &b_shape,
            Some(&a_axes),
            None,
            &mut nodes,
        );

        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].name.as_deref(), Some("a_shape_lhs"));
        assert_eq!(nodes[1].name.as_deref(), Some("b_shape_rhs"));
        assert_eq!(nodes[2].op_type(), "BroadcastGradientArgs");
        assert_eq!(nodes[2].op_def.domain, MS_DOMAIN);
        assert_eq!(nodes[2].outputs[0], a_axes);
        assert!(nodes[2].outputs[1].is_empty());
    }
}
