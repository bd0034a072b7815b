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

//! Per-node context handed to gradient rules.
//!
//! A [`GradientBuilderContext`] is created for one forward node, borrows the
//! graph, the configuration and the pass-wide [`PassState`], and is dropped
//! once the rule has produced its [`GradientDef`]. Rules only see the
//! forward node through the accessors here, which take care of
//! recomputation, stashing and naming.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::config::GradientGraphConfiguration;
use crate::ir::{
    recompute_name, Attribute, AttributeValue, Graph, GraphError, Node, NodeArg,
    NodeAttributes, NodeIndex, TensorElement, TensorProto, MS_DOMAIN, ONNX_DOMAIN,
};
use crate::types::{DType, TensorType};

use super::broadcast::{
    compute_broadcast_backward_axes, compute_broadcast_backward_axes_dynamic, get_shape,
    BroadcastError,
};
use super::constants::constant_vector_node;
use super::defs::{ArgDef, GradientDef, NodeDef, OpDef};
use super::error::{ArgSide, AutodiffError};
use super::registry::{gradient_definition_key, GradientNodeAttributeDefinition};

/// Name of the gradient tensor of `name`.
pub fn gradient_name(name: &str) -> String {
    format!("{name}_grad")
}

pub fn external_output_name(name: &str) -> String {
    format!("{name}_external")
}

/// State shared by every rule invocation of one gradient graph pass.
///
/// Both collections only grow while the pass runs.
#[derive(Debug, Clone, Default)]
pub struct PassState {
    stashed_tensors: BTreeSet<String>,
    python_op_input_requires_grad: BTreeMap<String, Vec<i64>>,
}

impl PassState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_stashed_tensor(&mut self, name: &str) {
        self.stashed_tensors.insert(name.to_string());
    }

    pub fn is_tensor_stashed(&self, name: &str) -> bool {
        self.stashed_tensors.contains(name)
    }

    /// Forward tensors referenced by backward rules.
    pub fn stashed_tensors(&self) -> &BTreeSet<String> {
        &self.stashed_tensors
    }

    /// Per custom-op node, one `0`/`1` flag per input telling whether its
    /// gradient must be computed.
    pub fn python_op_input_requires_grad(&self) -> &BTreeMap<String, Vec<i64>> {
        &self.python_op_input_requires_grad
    }

    pub fn set_python_op_require_grad_info(&mut self, node_name: &str, info: Vec<i64>) {
        self.python_op_input_requires_grad
            .insert(node_name.to_string(), info);
    }

    pub fn into_parts(self) -> (BTreeSet<String>, BTreeMap<String, Vec<i64>>) {
        (self.stashed_tensors, self.python_op_input_requires_grad)
    }
}

/// A differentiation rule for one operator.
pub trait GradientBuilder {
    /// Produces the backward nodes for the context's forward node. Nodes
    /// may be left unnamed; [`GradientBuilderContext::gradient_defs`] names
    /// them.
    fn gradient_defs_impl(
        &self,
        ctx: &mut GradientBuilderContext<'_>,
    ) -> Result<GradientDef, AutodiffError>;
}

pub struct GradientBuilderContext<'a> {
    config: &'a GradientGraphConfiguration,
    graph: &'a Graph,
    node: &'a Node,
    /// The forward node's name, or the one generated for an anonymous node.
    node_name: String,
    unique_node_prefix: String,
    /// Output names of the forward node whose gradients flow in.
    gradient_inputs: BTreeSet<String>,
    /// Input names of the forward node whose gradients are requested.
    gradient_outputs: BTreeSet<String>,
    state: &'a mut PassState,
}

impl<'a> GradientBuilderContext<'a> {
    /// The graph is borrowed mutably only long enough to reserve a name for
    /// anonymous forward nodes. That name then stands in for the node's own
    /// in [`node_name`](Self::node_name) and the unique prefix.
    pub fn new(
        config: &'a GradientGraphConfiguration,
        graph: &'a mut Graph,
        node: NodeIndex,
        gradient_inputs: BTreeSet<String>,
        gradient_outputs: BTreeSet<String>,
        state: &'a mut PassState,
    ) -> Result<Self, AutodiffError> {
        let node_name = unique_node_name(graph, node)?;
        let unique_node_prefix = format!("{node_name}_Grad/");
        let graph: &'a Graph = graph;
        let node = graph.node(node).ok_or(GraphError::UnknownNode(node.0))?;
        Ok(Self {
            config,
            graph,
            node,
            node_name,
            unique_node_prefix,
            gradient_inputs,
            gradient_outputs,
            state,
        })
    }

    /// Runs `builder` and names every node it left unnamed as
    /// `<prefix><op_type>_<index>`.
    pub fn gradient_defs(
        &mut self,
        builder: &dyn GradientBuilder,
    ) -> Result<GradientDef, AutodiffError> {
        let mut node_defs = builder.gradient_defs_impl(self)?;
        for (index, node_def) in node_defs.iter_mut().enumerate() {
            if node_def.name.is_none() {
                node_def.name = Some(self.name(&format!("{}_{}", node_def.op_type(), index)));
            }
        }
        Ok(node_defs)
    }

    pub(crate) fn unique_node_prefix(&self) -> &str {
        &self.unique_node_prefix
    }

    pub fn config(&self) -> &GradientGraphConfiguration {
        self.config
    }

    pub fn record_stashed_tensor(&mut self, name: &str) {
        self.state.record_stashed_tensor(name);
    }

    pub fn is_tensor_stashed(&self, name: &str) -> bool {
        self.state.is_tensor_stashed(name)
    }

    fn forward_node_arg(&self, side: ArgSide, index: usize) -> Result<&'a NodeArg, AutodiffError> {
        let node: &'a Node = self.node;
        let args = match side {
            ArgSide::Input => &node.inputs,
            ArgSide::Output => &node.outputs,
        };
        args.get(index).ok_or_else(|| AutodiffError::IndexOutOfRange {
            node: self.node_name.clone(),
            side,
            index,
            len: args.len(),
        })
    }

    fn forward_value(
        &mut self,
        side: ArgSide,
        index: usize,
        record_stashing: bool,
    ) -> Result<ArgDef, AutodiffError> {
        let arg = self.forward_node_arg(side, index)?;
        let graph: &'a Graph = self.graph;
        if let Some(recomputed) = graph.node_arg(&recompute_name(&arg.name)) {
            let producer = graph
                .producer_node(&arg.name)
                .map_or("<graph input>", |n| n.name.as_str());
            log::info!("Recomputed node arg found for {producer}");
            return Ok(ArgDef::from(recomputed));
        }
        if record_stashing {
            self.state.record_stashed_tensor(&arg.name);
        }
        Ok(ArgDef::from(arg))
    }

    /// The i-th forward input, recorded as stashed.
    pub fn input(&mut self, index: usize) -> Result<ArgDef, AutodiffError> {
        self.forward_value(ArgSide::Input, index, true)
    }

    /// The i-th forward input without keeping its value alive; for rules
    /// that only need its name or type.
    pub fn input_unstashed(&mut self, index: usize) -> Result<ArgDef, AutodiffError> {
        self.forward_value(ArgSide::Input, index, false)
    }

    /// The i-th forward output, recorded as stashed.
    pub fn output(&mut self, index: usize) -> Result<ArgDef, AutodiffError> {
        self.forward_value(ArgSide::Output, index, true)
    }

    pub fn output_unstashed(&mut self, index: usize) -> Result<ArgDef, AutodiffError> {
        self.forward_value(ArgSide::Output, index, false)
    }

    /// Gradient of the i-th forward input.
    pub fn input_gradient(&self, index: usize) -> Result<ArgDef, AutodiffError> {
        let arg = self.forward_node_arg(ArgSide::Input, index)?;
        Ok(ArgDef::new(gradient_name(&arg.name), arg.ty.clone()))
    }

    /// Gradient of the i-th forward input with an explicit type.
    pub fn input_gradient_as(
        &self,
        index: usize,
        ty: Option<TensorType>,
    ) -> Result<ArgDef, AutodiffError> {
        let arg = self.forward_node_arg(ArgSide::Input, index)?;
        Ok(ArgDef::new(gradient_name(&arg.name), ty))
    }

    /// Incoming gradient of the i-th forward output.
    pub fn output_gradient(&self, index: usize) -> Result<ArgDef, AutodiffError> {
        let arg = self.forward_node_arg(ArgSide::Output, index)?;
        Ok(ArgDef::new(gradient_name(&arg.name), arg.ty.clone()))
    }

    /// A temporary of this rule, named under the node's unique prefix.
    pub fn intermediate(&self, suffix: &str, ty: Option<TensorType>) -> ArgDef {
        ArgDef::new(self.name(suffix), ty)
    }

    pub fn input_type(&self, index: usize) -> Result<Option<&'a TensorType>, AutodiffError> {
        Ok(self.forward_node_arg(ArgSide::Input, index)?.ty.as_ref())
    }

    pub fn output_type(&self, index: usize) -> Result<Option<&'a TensorType>, AutodiffError> {
        Ok(self.forward_node_arg(ArgSide::Output, index)?.ty.as_ref())
    }

    pub fn input_elem_type(&self, index: usize) -> Result<DType, AutodiffError> {
        let arg = self.forward_node_arg(ArgSide::Input, index)?;
        arg.ty
            .as_ref()
            .map(|t| t.dtype)
            .ok_or_else(|| AutodiffError::MissingType(arg.name.clone()))
    }

    pub fn output_elem_type(&self, index: usize) -> Result<DType, AutodiffError> {
        let arg = self.forward_node_arg(ArgSide::Output, index)?;
        arg.ty
            .as_ref()
            .map(|t| t.dtype)
            .ok_or_else(|| AutodiffError::MissingType(arg.name.clone()))
    }

    pub fn src_node_input_size(&self) -> usize {
        self.node.inputs.len()
    }

    pub fn src_node_output_size(&self) -> usize {
        self.node.outputs.len()
    }

    pub fn is_gradient_required_for_src_node_input(&self, index: usize) -> bool {
        self.node
            .inputs
            .get(index)
            .is_some_and(|arg| self.gradient_outputs.contains(&arg.name))
    }

    pub fn is_gradient_available_for_src_node_output(&self, index: usize) -> bool {
        self.node
            .outputs
            .get(index)
            .is_some_and(|arg| self.gradient_inputs.contains(&arg.name))
    }

    /// `suffix` scoped under this node's unique prefix.
    pub fn name(&self, suffix: &str) -> String {
        format!("{}{}", self.unique_node_prefix, suffix)
    }

    pub fn src_node_attributes(&self) -> &'a NodeAttributes {
        &self.node.attributes
    }

    pub fn src_node_op_type(&self) -> &'a str {
        &self.node.op_type
    }

    pub fn src_node_opset_version(&self) -> i64 {
        self.node.since_version
    }

    pub fn src_node_domain(&self) -> &'a str {
        &self.node.domain
    }

    /// Opset version of the default domain imported by the graph.
    pub fn onnx_opset_version(&self) -> Option<i64> {
        self.graph.opset_version(ONNX_DOMAIN)
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn gradient_definition_key(&self) -> String {
        gradient_definition_key(self.node)
    }

    pub fn set_python_op_require_grad_info(&mut self, node_name: &str, info: Vec<i64>) {
        self.state.set_python_op_require_grad_info(node_name, info);
    }

    fn reduces_with_axes_input(&self) -> bool {
        self.onnx_opset_version().is_some_and(|v| v >= 13)
    }

    /// Emits a `ReduceSum` of `input` over `reduce_axes`. From opset 13 the
    /// axes are a constant input, before that an attribute.
    pub fn add_reduce_sum_node(
        &self,
        input: &ArgDef,
        output_arg: &ArgDef,
        reduce_axes: &[i64],
        keep_dims: bool,
        output: &mut Vec<NodeDef>,
    ) {
        let keepdims = Attribute::int("keepdims", i64::from(keep_dims));
        if self.reduces_with_axes_input() {
            let axes = self.intermediate(
                &format!("ReduceAxes_{}", self.local_name(output_arg)),
                None,
            );
            output.push(constant_vector_node(reduce_axes, &axes.name));
            output.push(
                NodeDef::with_op_def(
                    OpDef::new("ReduceSum", ONNX_DOMAIN, 13),
                    vec![input.clone(), axes],
                    vec![output_arg.clone()],
                )
                .attributes(vec![keepdims]),
            );
        } else {
            output.push(
                NodeDef::new("ReduceSum", vec![input.clone()], vec![output_arg.clone()])
                    .attributes(vec![Attribute::ints("axes", reduce_axes.to_vec()), keepdims]),
            );
        }
    }

    fn local_name<'n>(&self, arg: &'n ArgDef) -> &'n str {
        arg.name
            .strip_prefix(&self.unique_node_prefix)
            .unwrap_or(&arg.name)
    }

    /// Sums `input_grad` over statically known `reduce_axes` and reshapes the
    /// result to the runtime shape of `target`, writing `output_grad`.
    pub fn handle_broadcasting(
        &self,
        input_grad: &ArgDef,
        target: &ArgDef,
        output_grad: &ArgDef,
        reduce_axes: &[i64],
        output: &mut Vec<NodeDef>,
    ) {
        if reduce_axes.is_empty() {
            output.push(NodeDef::new(
                "Identity",
                vec![input_grad.clone()],
                vec![output_grad.clone()],
            ));
            return;
        }

        let reduced = self.intermediate(
            &format!("ReduceSum_{}_for_{}", self.local_name(input_grad), target.name),
            None,
        );
        self.add_reduce_sum_node(input_grad, &reduced, reduce_axes, true, output);

        let target_shape = self.intermediate(&format!("{}_shape", target.name), None);
        output.push(NodeDef::new(
            "Shape",
            vec![target.clone()],
            vec![target_shape.clone()],
        ));
        output.push(NodeDef::new(
            "Reshape",
            vec![reduced, target_shape],
            vec![output_grad.clone()],
        ));
    }

    /// Like [`handle_broadcasting`](Self::handle_broadcasting) with the axes
    /// and target shape available only as tensors.
    pub fn handle_broadcasting_dynamic(
        &self,
        input_grad: &ArgDef,
        target: &ArgDef,
        target_shape: &ArgDef,
        output_grad: &ArgDef,
        reduce_axes: &ArgDef,
        output: &mut Vec<NodeDef>,
    ) {
        let reduced = self.intermediate(
            &format!(
                "ReduceSum_{}_over_{}",
                self.local_name(input_grad),
                self.local_name(reduce_axes)
            ),
            None,
        );
        log::debug!(
            "reducing {} to the runtime shape of {}",
            input_grad.name,
            target.name
        );
        let op_def = if self.reduces_with_axes_input() {
            OpDef::new("ReduceSum", ONNX_DOMAIN, 13)
        } else {
            OpDef::new("ReduceSumTraining", MS_DOMAIN, 1)
        };
        output.push(
            NodeDef::with_op_def(
                op_def,
                vec![input_grad.clone(), reduce_axes.clone()],
                vec![reduced.clone()],
            )
            .attributes(vec![
                Attribute::int("keepdims", 1),
                Attribute::int("noop_with_empty_axes", 1),
            ]),
        );
        output.push(NodeDef::new(
            "Reshape",
            vec![reduced, target_shape.clone()],
            vec![output_grad.clone()],
        ));
    }

    /// Reduces gradients computed at the broadcast shape of inputs 0 and 1
    /// back to each input's shape.
    ///
    /// Each side is `(gradient at broadcast shape, destination)`; `None`
    /// skips that side. Static axes are used when both input shapes are
    /// known and unambiguous; otherwise the axes are computed at execution
    /// time.
    pub fn reduce_broadcast_gradients(
        &mut self,
        a_side: Option<(&ArgDef, &ArgDef)>,
        b_side: Option<(&ArgDef, &ArgDef)>,
        output: &mut Vec<NodeDef>,
    ) -> Result<(), AutodiffError> {
        if a_side.is_none() && b_side.is_none() {
            return Ok(());
        }
        // Operands are stashed only once a `Shape` node reads them.
        let a = self.input_unstashed(0)?;
        let b = self.input_unstashed(1)?;

        if let (Some(a_dims), Some(b_dims)) = (get_shape(&a), get_shape(&b)) {
            match compute_broadcast_backward_axes(a_dims, b_dims, &self.node_name) {
                Ok(axes) => {
                    if let Some((grad, dest)) = a_side {
                        if !axes.a_axes.is_empty() {
                            self.input(0)?;
                        }
                        self.handle_broadcasting(grad, &a, dest, &axes.a_axes, output);
                    }
                    if let Some((grad, dest)) = b_side {
                        if !axes.b_axes.is_empty() {
                            self.input(1)?;
                        }
                        self.handle_broadcasting(grad, &b, dest, &axes.b_axes, output);
                    }
                    return Ok(());
                }
                Err(err @ BroadcastError::Unresolved { .. }) => {
                    log::warn!("{err}; computing broadcast axes at execution time");
                }
                Err(err) => return Err(err.into()),
            }
        }

        // Sides are tagged so `x op x` does not produce the same tensor twice.
        self.input(0)?;
        self.input(1)?;
        let a_shape = self.intermediate(&format!("LhsShape_{}", a.name), None);
        let b_shape = self.intermediate(&format!("RhsShape_{}", b.name), None);
        let a_axes = self.intermediate(&format!("LhsReduceAxes_{}", a.name), None);
        let b_axes = self.intermediate(&format!("RhsReduceAxes_{}", b.name), None);
        compute_broadcast_backward_axes_dynamic(
            &a,
            &b,
            &a_shape,
            &b_shape,
            a_side.map(|_| &a_axes),
            b_side.map(|_| &b_axes),
            output,
        );
        if let Some((grad, dest)) = a_side {
            self.handle_broadcasting_dynamic(grad, &a, &a_shape, dest, &a_axes, output);
        }
        if let Some((grad, dest)) = b_side {
            self.handle_broadcasting_dynamic(grad, &b, &b_shape, dest, &b_axes, output);
        }
        Ok(())
    }

    /// Translates a declarative attribute definition into an attribute.
    ///
    /// Tensor attributes accept a JSON number or a flat array; plain
    /// attributes accept numbers, strings and flat arrays of either.
    pub fn attribute_from_definition(
        &self,
        definition: &GradientNodeAttributeDefinition,
    ) -> Result<Attribute, AutodiffError> {
        let value: Value = serde_json::from_str(&definition.value_json).map_err(|source| {
            AutodiffError::AttributeJson {
                value: definition.value_json.clone(),
                source,
            }
        })?;
        let attr_value = if definition.is_tensor {
            AttributeValue::Tensor(json_tensor(&value, definition.dtype)?)
        } else {
            json_attribute(&value, definition.dtype)?
        };
        Ok(Attribute::new(definition.name.clone(), attr_value))
    }
}

fn unique_node_name(graph: &mut Graph, node: NodeIndex) -> Result<String, AutodiffError> {
    let forward = graph.node(node).ok_or(GraphError::UnknownNode(node.0))?;
    if !forward.name.is_empty() {
        return Ok(forward.name.clone());
    }
    let op_type = forward.op_type.clone();
    Ok(graph.generate_node_name(&op_type))
}

fn json_numbers(value: &Value) -> Result<(Vec<f64>, bool), AutodiffError> {
    let as_number = |v: &Value| {
        v.as_f64()
            .or_else(|| v.as_bool().map(|b| if b { 1.0 } else { 0.0 }))
            .ok_or_else(|| AutodiffError::InvalidDefinition(format!("expected a number, got {v}")))
    };
    match value {
        Value::Array(items) => Ok((items.iter().map(as_number).collect::<Result<_, _>>()?, true)),
        other => Ok((vec![as_number(other)?], false)),
    }
}

/// Integer and boolean element types only take integral numbers.
fn check_integral(values: &[f64], dtype: DType) -> Result<(), AutodiffError> {
    if dtype.is_float() {
        return Ok(());
    }
    match values.iter().find(|v| v.fract() != 0.0) {
        Some(v) => Err(AutodiffError::InvalidDefinition(format!(
            "{v} is not a valid value of element type {dtype}"
        ))),
        None => Ok(()),
    }
}

fn typed_tensor<T: TensorElement>(values: &[f64], dims: Vec<i64>, cast: impl Fn(f64) -> T) -> TensorProto {
    let converted: Vec<T> = values.iter().map(|&v| cast(v)).collect();
    TensorProto::from_values(&converted, dims)
}

fn json_tensor(value: &Value, dtype: DType) -> Result<TensorProto, AutodiffError> {
    let (values, is_list) = json_numbers(value)?;
    check_integral(&values, dtype)?;
    let dims = if is_list {
        vec![values.len() as i64]
    } else {
        Vec::new()
    };
    Ok(match dtype {
        DType::F32 => typed_tensor(&values, dims, |v| v as f32),
        DType::F64 => typed_tensor(&values, dims, |v| v),
        DType::F16 => typed_tensor(&values, dims, |v| half::f16::from_f64(v)),
        DType::BF16 => typed_tensor(&values, dims, |v| half::bf16::from_f64(v)),
        DType::I32 => typed_tensor(&values, dims, |v| v as i32),
        DType::I64 => typed_tensor(&values, dims, |v| v as i64),
        DType::Bool => typed_tensor(&values, dims, |v| v != 0.0),
        other => {
            return Err(AutodiffError::InvalidDefinition(format!(
                "tensor attributes of element type {other} are not supported"
            )))
        }
    })
}

fn json_attribute(value: &Value, dtype: DType) -> Result<AttributeValue, AutodiffError> {
    if let Value::String(s) = value {
        return Ok(AttributeValue::String(s.clone()));
    }
    if let Value::Array(items) = value {
        if !items.is_empty() && items.iter().all(Value::is_string) {
            let strings = items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            return Ok(AttributeValue::Strings(strings));
        }
    }

    let (values, is_list) = json_numbers(value)?;
    check_integral(&values, dtype)?;
    Ok(match (dtype.is_float(), is_list) {
        (true, false) => AttributeValue::Float(values[0] as f32),
        (true, true) => AttributeValue::Floats(values.iter().map(|&v| v as f32).collect()),
        (false, false) => AttributeValue::Int(values[0] as i64),
        (false, true) => AttributeValue::Ints(values.iter().map(|&v| v as i64).collect()),
    })
}
