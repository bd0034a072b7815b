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

use crate::ir::{Attribute, AttributeValue, MS_DOMAIN};

use super::builder::{GradientBuilder, GradientBuilderContext};
use super::defs::{ArgDef, GradientDef, NodeDef, OpDef};
use super::error::AutodiffError;

/// Operators without a trainable effect: no backward nodes at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyGradient;

impl GradientBuilder for EmptyGradient {
    fn gradient_defs_impl(
        &self,
        _ctx: &mut GradientBuilderContext<'_>,
    ) -> Result<GradientDef, AutodiffError> {
        Ok(GradientDef::new())
    }
}

/// Operators that have no gradient; requesting one is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedGradient;

impl GradientBuilder for UnsupportedGradient {
    fn gradient_defs_impl(
        &self,
        ctx: &mut GradientBuilderContext<'_>,
    ) -> Result<GradientDef, AutodiffError> {
        Err(AutodiffError::UnsupportedGradient {
            op_type: ctx.src_node_op_type().to_string(),
            node: ctx.node_name().to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AddSubGradient {
    pub is_sub: bool,
}

impl GradientBuilder for AddSubGradient {
    fn gradient_defs_impl(
        &self,
        ctx: &mut GradientBuilderContext<'_>,
    ) -> Result<GradientDef, AutodiffError> {
        let mut output = GradientDef::new();
        let go = ctx.output_gradient(0)?;

        let a_dest = if ctx.is_gradient_required_for_src_node_input(0) {
            Some(ctx.input_gradient(0)?)
        } else {
            None
        };
        let b_dest = if !ctx.is_gradient_required_for_src_node_input(1) {
            None
        } else if self.is_sub {
            Some(ctx.intermediate("PreNeg_grad_b", None))
        } else {
            Some(ctx.input_gradient(1)?)
        };

        ctx.reduce_broadcast_gradients(
            a_dest.as_ref().map(|dest| (&go, dest)),
            b_dest.as_ref().map(|dest| (&go, dest)),
            &mut output,
        )?;

        if let (true, Some(pre_neg)) = (self.is_sub, b_dest) {
            output.push(NodeDef::new(
                "Neg",
                vec![pre_neg],
                vec![ctx.input_gradient(1)?],
            ));
        }
        Ok(output)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MulGradient;

impl GradientBuilder for MulGradient {
    fn gradient_defs_impl(
        &self,
        ctx: &mut GradientBuilderContext<'_>,
    ) -> Result<GradientDef, AutodiffError> {
        let mut output = GradientDef::new();
        let go = ctx.output_gradient(0)?;

        // Products are formed at the broadcast shape, then reduced.
        let mut sides: [Option<(ArgDef, ArgDef)>; 2] = [None, None];
        for (index, side) in sides.iter_mut().enumerate() {
            if !ctx.is_gradient_required_for_src_node_input(index) {
                continue;
            }
            let other = ctx.input(1 - index)?;
            let product = ctx.intermediate(&format!("PreReduceGrad{index}"), go.ty.clone());
            output.push(NodeDef::new(
                "Mul",
                vec![go.clone(), other],
                vec![product.clone()],
            ));
            *side = Some((product, ctx.input_gradient(index)?));
        }

        let [a_side, b_side] = &sides;
        ctx.reduce_broadcast_gradients(
            a_side.as_ref().map(|(g, d)| (g, d)),
            b_side.as_ref().map(|(g, d)| (g, d)),
            &mut output,
        )?;
        Ok(output)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NegGradient;

impl GradientBuilder for NegGradient {
    fn gradient_defs_impl(
        &self,
        ctx: &mut GradientBuilderContext<'_>,
    ) -> Result<GradientDef, AutodiffError> {
        if !ctx.is_gradient_required_for_src_node_input(0) {
            return Ok(GradientDef::new());
        }
        Ok(vec![NodeDef::new(
            "Neg",
            vec![ctx.output_gradient(0)?],
            vec![ctx.input_gradient(0)?],
        )])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityGradient;

impl GradientBuilder for IdentityGradient {
    fn gradient_defs_impl(
        &self,
        ctx: &mut GradientBuilderContext<'_>,
    ) -> Result<GradientDef, AutodiffError> {
        if !ctx.is_gradient_required_for_src_node_input(0) {
            return Ok(GradientDef::new());
        }
        Ok(vec![NodeDef::new(
            "Identity",
            vec![ctx.output_gradient(0)?],
            vec![ctx.input_gradient(0)?],
        )])
    }
}

/// Casts the incoming gradient back to the forward input's element type.
/// Only the input's type is needed, so nothing is stashed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CastGradient;

impl GradientBuilder for CastGradient {
    fn gradient_defs_impl(
        &self,
        ctx: &mut GradientBuilderContext<'_>,
    ) -> Result<GradientDef, AutodiffError> {
        if !ctx.is_gradient_required_for_src_node_input(0) {
            return Ok(GradientDef::new());
        }
        let to = ctx.input_elem_type(0)?;
        Ok(vec![NodeDef::new(
            "Cast",
            vec![ctx.output_gradient(0)?],
            vec![ctx.input_gradient(0)?],
        )
        .attributes(vec![Attribute::int("to", i64::from(to.elem_type()))])])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReluGradient;

impl GradientBuilder for ReluGradient {
    fn gradient_defs_impl(
        &self,
        ctx: &mut GradientBuilderContext<'_>,
    ) -> Result<GradientDef, AutodiffError> {
        if !ctx.is_gradient_required_for_src_node_input(0) {
            return Ok(GradientDef::new());
        }
        let go = ctx.output_gradient(0)?;
        let y = ctx.output(0)?;
        Ok(vec![NodeDef::with_op_def(
            OpDef::new("ReluGrad", MS_DOMAIN, 1),
            vec![go, y],
            vec![ctx.input_gradient(0)?],
        )])
    }
}

/// Externally defined operators. Which input gradients the custom backward
/// function must compute is recorded for the runtime that executes it.
#[derive(Debug, Clone, Copy, Default)]
pub struct PythonOpGradient;

impl GradientBuilder for PythonOpGradient {
    fn gradient_defs_impl(
        &self,
        ctx: &mut GradientBuilderContext<'_>,
    ) -> Result<GradientDef, AutodiffError> {
        let mut inputs = Vec::with_capacity(ctx.src_node_output_size());
        for index in 0..ctx.src_node_output_size() {
            if ctx.is_gradient_available_for_src_node_output(index) {
                inputs.push(ctx.output_gradient(index)?);
            } else {
                inputs.push(ArgDef::empty());
            }
        }

        let mut outputs = Vec::with_capacity(ctx.src_node_input_size());
        let mut requires_grad = Vec::with_capacity(ctx.src_node_input_size());
        for index in 0..ctx.src_node_input_size() {
            if ctx.is_gradient_required_for_src_node_input(index) {
                outputs.push(ctx.input_gradient(index)?);
                requires_grad.push(1);
            } else {
                outputs.push(ArgDef::empty());
                requires_grad.push(0);
            }
        }

        let node_name = ctx.node_name().to_string();
        ctx.set_python_op_require_grad_info(&node_name, requires_grad.clone());

        let mut attributes = vec![Attribute::ints("input_requires_grads", requires_grad)];
        if let Some(AttributeValue::String(func_name)) = ctx.src_node_attributes().get("func_name") {
            attributes.push(Attribute::string("func_name", func_name.clone()));
        }

        Ok(vec![NodeDef::with_op_def(
            OpDef::new("PythonOpGrad", MS_DOMAIN, 1),
            inputs,
            outputs,
        )
        .attributes(attributes)])
    }
}
