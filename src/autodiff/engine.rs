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

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::config::GradientGraphConfiguration;
use crate::ir::{Graph, GraphError, Node, NodeArg, NodeIndex};
use crate::types::DType;

use super::builder::{external_output_name, gradient_name, GradientBuilderContext, PassState};
use super::constants::one_constant_node;
use super::defs::{ArgDef, NodeDef};
use super::error::AutodiffError;
use super::registry::GradientRegistry;

/// Result of a gradient graph pass.
#[derive(Debug, Clone, Default)]
pub struct GradientGraphResult {
    /// Gradient arg name keyed by the requested input it differentiates.
    pub gradients: BTreeMap<String, String>,
    /// Forward tensors the backward nodes read.
    pub stashed_tensors: BTreeSet<String>,
    /// Input requires-grad flags of custom-op nodes.
    pub python_op_input_requires_grad: BTreeMap<String, Vec<i64>>,
    /// Nodes inserted by the pass, in insertion order.
    pub backward_nodes: Vec<NodeIndex>,
}

/// Augments a forward graph with the nodes computing the gradients of
/// `y_node_args` with respect to `x_node_args`.
///
/// Forward nodes are visited in reverse topological order; each node on a
/// path from an `x` to a `y` gets exactly one rule invocation. Gradient
/// tensors written by more than one rule are accumulated with `Sum`.
pub struct GradientGraphBuilder<'a> {
    graph: &'a mut Graph,
    registry: &'a GradientRegistry,
    config: &'a GradientGraphConfiguration,
    y_node_args: BTreeSet<String>,
    x_node_args: BTreeSet<String>,
}

impl<'a> GradientGraphBuilder<'a> {
    pub fn new(
        graph: &'a mut Graph,
        y_node_args: &[&str],
        x_node_args: &[&str],
        registry: &'a GradientRegistry,
        config: &'a GradientGraphConfiguration,
    ) -> Result<Self, AutodiffError> {
        for name in y_node_args.iter().chain(x_node_args) {
            if graph.node_arg(name).is_none() {
                return Err(GraphError::UnknownNodeArg(name.to_string()).into());
            }
        }
        Ok(Self {
            graph,
            registry,
            config,
            y_node_args: y_node_args.iter().map(|s| s.to_string()).collect(),
            x_node_args: x_node_args.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn build(mut self) -> Result<GradientGraphResult, AutodiffError> {
        let order = self.graph.topological_order()?;

        // Args whose value depends on some x.
        let mut requires_grad = self.x_node_args.clone();
        let mut reachable_from_x = BTreeSet::new();
        for &index in &order {
            let node = forward_node(self.graph, index)?;
            if node.inputs.iter().any(|a| requires_grad.contains(&a.name)) {
                reachable_from_x.insert(index);
                for output in node.outputs.iter().filter(|o| o.exists()) {
                    requires_grad.insert(output.name.clone());
                }
            }
        }

        // Nodes between some x and some y, in reverse topological order.
        let mut leads_to_y = self.y_node_args.clone();
        let mut path = Vec::new();
        for &index in order.iter().rev() {
            let node = forward_node(self.graph, index)?;
            if reachable_from_x.contains(&index)
                && node.outputs.iter().any(|o| leads_to_y.contains(&o.name))
            {
                path.push(index);
                for input in node.inputs.iter().filter(|i| i.exists()) {
                    leads_to_y.insert(input.name.clone());
                }
            }
        }

        let mut state = PassState::new();
        let mut available = self.y_node_args.clone();
        let mut node_defs = Vec::new();
        // Gradient tensors the rules may write; only these are accumulated.
        let mut gradient_args: BTreeSet<String> =
            self.y_node_args.iter().map(|y| gradient_name(y)).collect();
        for index in path {
            let (gradient_inputs, gradient_outputs, builder) = {
                let node = forward_node(self.graph, index)?;
                let gradient_inputs: BTreeSet<String> = node
                    .outputs
                    .iter()
                    .filter(|o| available.contains(&o.name))
                    .map(|o| o.name.clone())
                    .collect();
                let gradient_outputs: BTreeSet<String> = node
                    .inputs
                    .iter()
                    .filter(|i| requires_grad.contains(&i.name) && leads_to_y.contains(&i.name))
                    .map(|i| i.name.clone())
                    .collect();
                if gradient_inputs.is_empty() || gradient_outputs.is_empty() {
                    continue;
                }
                log::debug!(
                    "building gradient of {} node '{}' for inputs {:?}",
                    node.op_type,
                    node.name,
                    gradient_outputs
                );
                (gradient_inputs, gradient_outputs, self.registry.lookup(node)?)
            };

            let defs = {
                let mut ctx = GradientBuilderContext::new(
                    self.config,
                    self.graph,
                    index,
                    gradient_inputs,
                    gradient_outputs.clone(),
                    &mut state,
                )?;
                ctx.gradient_defs(builder.as_ref())?
            };

            for input in gradient_outputs {
                let grad = gradient_name(&input);
                gradient_args.insert(grad.clone());
                if defs
                    .iter()
                    .any(|d| d.outputs.iter().any(|o| o.name == grad))
                {
                    available.insert(input);
                }
            }
            node_defs.extend(defs);
        }

        let mut all_defs = self.seed_nodes(&node_defs)?;
        all_defs.extend(node_defs);
        let all_defs = dedup_shared_constants(self.graph, all_defs);
        let mut backward_nodes = Vec::new();
        for def in accumulate(all_defs, &gradient_args) {
            backward_nodes.push(materialize(self.graph, def)?);
        }

        let mut gradients = BTreeMap::new();
        for x in &self.x_node_args {
            let grad = gradient_name(x);
            if self.graph.node_arg(&grad).is_none() {
                log::warn!("no gradient flows to '{x}'");
                continue;
            }
            if self.config.set_gradients_as_graph_outputs {
                self.graph.add_output(&grad)?;
            }
            gradients.insert(x.clone(), grad);
        }

        let (stashed_tensors, python_op_input_requires_grad) = state.into_parts();
        Ok(GradientGraphResult {
            gradients,
            stashed_tensors,
            python_op_input_requires_grad,
            backward_nodes,
        })
    }

    /// The loss gradients: graph inputs by default, or ones shaped like the
    /// loss when seeding with one.
    ///
    /// A loss that also feeds other differentiated nodes receives rule
    /// contributions too; its external gradient input is then renamed and
    /// forwarded through an `Identity` so the contributions get summed.
    fn seed_nodes(&mut self, node_defs: &[NodeDef]) -> Result<Vec<NodeDef>, AutodiffError> {
        let mut seeds = Vec::new();
        for y in &self.y_node_args {
            let ty = self.graph.node_arg(y).and_then(|arg| arg.ty.clone());
            let grad = ArgDef::new(gradient_name(y), ty.clone());
            if !self.config.seed_with_one {
                let produced = node_defs
                    .iter()
                    .any(|d| d.outputs.iter().any(|o| o.name == grad.name));
                if produced {
                    let external = ArgDef::new(external_output_name(&grad.name), ty);
                    self.graph.add_input(NodeArg::from(external.clone()));
                    seeds.push(NodeDef::new("Identity", vec![external], vec![grad]));
                } else {
                    self.graph.add_input(NodeArg::from(grad));
                }
                continue;
            }

            let dtype = ty.as_ref().map_or(DType::F32, |t| t.dtype);
            let one = one_constant_node(dtype)?;
            let one_arg = one.outputs[0].clone();
            seeds.push(one);
            let shape = ArgDef::new(format!("{}_shape", grad.name), None);
            seeds.push(NodeDef::new(
                "Shape",
                vec![ArgDef::new(y.clone(), ty)],
                vec![shape.clone()],
            ));
            seeds.push(NodeDef::new("Expand", vec![one_arg, shape], vec![grad]));
        }
        Ok(seeds)
    }
}

/// Convenience wrapper around [`GradientGraphBuilder`].
pub fn build_gradient_graph(
    graph: &mut Graph,
    y_node_args: &[&str],
    x_node_args: &[&str],
    registry: &GradientRegistry,
    config: &GradientGraphConfiguration,
) -> Result<GradientGraphResult, AutodiffError> {
    GradientGraphBuilder::new(graph, y_node_args, x_node_args, registry, config)?.build()
}

fn forward_node(graph: &Graph, index: NodeIndex) -> Result<&Node, AutodiffError> {
    Ok(graph.node(index).ok_or(GraphError::UnknownNode(index.0))?)
}

/// Keeps one producer per shared constant such as `OneConstant_Type1`.
///
/// Identical `Constant` nodes writing the same arg are emitted once, and not
/// at all when the graph already produces that arg with a `Constant`.
fn dedup_shared_constants(graph: &Graph, node_defs: Vec<NodeDef>) -> Vec<NodeDef> {
    let mut emitted: BTreeMap<String, NodeDef> = BTreeMap::new();
    let mut kept = Vec::with_capacity(node_defs.len());
    for def in node_defs {
        if def.op_type() != "Constant" || def.outputs.len() != 1 {
            kept.push(def);
            continue;
        }
        let name = def.outputs[0].name.clone();
        if graph
            .producer_node(&name)
            .is_some_and(|n| n.op_type == "Constant")
        {
            continue;
        }
        match emitted.get(&name) {
            Some(first) if first.attributes == def.attributes => continue,
            Some(_) => kept.push(def),
            None => {
                emitted.insert(name, def.clone());
                kept.push(def);
            }
        }
    }
    kept
}

/// Renames every contribution to a gradient written more than once to
/// `<grad>_<k>` and sums them into `<grad>` right after the last one.
/// Args outside `gradient_args` are never summed.
fn accumulate(node_defs: Vec<NodeDef>, gradient_args: &BTreeSet<String>) -> Vec<NodeDef> {
    let mut producers: BTreeMap<String, usize> = BTreeMap::new();
    for def in &node_defs {
        for output in def
            .outputs
            .iter()
            .filter(|o| !o.is_empty() && gradient_args.contains(&o.name))
        {
            *producers.entry(output.name.clone()).or_default() += 1;
        }
    }

    let mut pending: BTreeMap<String, Vec<ArgDef>> = BTreeMap::new();
    let mut accumulated = Vec::with_capacity(node_defs.len());
    for mut def in node_defs {
        let mut completed = Vec::new();
        for output in def
            .outputs
            .iter_mut()
            .filter(|o| !o.is_empty() && gradient_args.contains(&o.name))
        {
            let total = producers.get(&output.name).copied().unwrap_or(0);
            if total < 2 {
                continue;
            }
            let grad = std::mem::take(&mut output.name);
            let parts = pending.entry(grad.clone()).or_default();
            output.name = format!("{grad}_{}", parts.len());
            parts.push(output.clone());
            if parts.len() == total {
                completed.push(grad);
            }
        }
        accumulated.push(def);

        for grad in completed {
            let parts = pending.remove(&grad).unwrap_or_default();
            let ty = parts.iter().find_map(|p| p.ty.clone());
            accumulated.push(NodeDef::new("Sum", parts, vec![ArgDef::new(grad, ty)]));
        }
    }
    accumulated
}

fn materialize(graph: &mut Graph, def: NodeDef) -> Result<NodeIndex, AutodiffError> {
    let name = match def.name {
        Some(name) => name,
        None => graph.generate_node_name(&def.op_def.op_type),
    };
    let node = Node {
        name,
        op_type: def.op_def.op_type,
        domain: def.op_def.domain,
        since_version: def.op_def.since_version,
        inputs: def.inputs.into_iter().map(NodeArg::from).collect(),
        outputs: def.outputs.into_iter().map(NodeArg::from).collect(),
        attributes: def
            .attributes
            .into_iter()
            .map(|attr| (attr.name, attr.value))
            .collect(),
    };
    Ok(graph.add_node(node)?)
}

impl fmt::Display for GradientGraphResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Gradients:")?;
        for (src, grad) in &self.gradients {
            writeln!(f, "  {src} -> {grad}")?;
        }
        writeln!(f, "Stashed:")?;
        for name in &self.stashed_tensors {
            writeln!(f, "  {name}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::constants::half_constant_node;

    fn def(op: &str, outputs: &[&str]) -> NodeDef {
        NodeDef::new(
            op,
            vec![],
            outputs.iter().map(|n| ArgDef::new(*n, None)).collect(),
        )
    }

    fn grads(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn single_producers_are_untouched() {
        let out = accumulate(vec![def("Neg", &["x_grad"])], &grads(&["x_grad"]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].outputs[0].name, "x_grad");
    }

    #[test]
    fn repeated_gradients_are_summed_after_last_contribution() {
        let out = accumulate(
            vec![
                def("Neg", &["x_grad"]),
                def("Relu", &["h_grad"]),
                def("Identity", &["x_grad"]),
                def("Mul", &["w_grad"]),
            ],
            &grads(&["x_grad", "h_grad", "w_grad"]),
        );
        let ops: Vec<&str> = out.iter().map(|d| d.op_type()).collect();
        assert_eq!(ops, vec!["Neg", "Relu", "Identity", "Sum", "Mul"]);
        assert_eq!(out[0].outputs[0].name, "x_grad_0");
        assert_eq!(out[2].outputs[0].name, "x_grad_1");
        let sum = &out[3];
        assert_eq!(
            sum.inputs.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            vec!["x_grad_0", "x_grad_1"]
        );
        assert_eq!(sum.outputs[0].name, "x_grad");
    }

    #[test]
    fn two_outputs_of_one_node_can_accumulate() {
        let out = accumulate(vec![def("Split", &["g", "g"])], &grads(&["g"]));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].outputs[0].name, "g_0");
        assert_eq!(out[0].outputs[1].name, "g_1");
        assert_eq!(out[1].op_type(), "Sum");
    }

    #[test]
    fn non_gradient_args_are_never_summed() {
        let out = accumulate(
            vec![def("Foo", &["tmp"]), def("Foo", &["tmp"])],
            &grads(&["x_grad"]),
        );
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|d| d.outputs[0].name == "tmp"));
    }

    #[test]
    fn shared_constants_are_emitted_once() {
        let half = half_constant_node(DType::F32).unwrap();
        let out = dedup_shared_constants(
            &Graph::new(),
            vec![half.clone(), def("Mul", &["a_grad"]), half, def("Mul", &["x_grad"])],
        );
        let ops: Vec<&str> = out.iter().map(|d| d.op_type()).collect();
        assert_eq!(ops, vec!["Constant", "Mul", "Mul"]);
    }

    #[test]
    fn constants_already_in_graph_are_skipped() {
        let mut graph = Graph::new();
        let half = half_constant_node(DType::F32).unwrap();
        materialize(&mut graph, half.clone()).unwrap();
        let out = dedup_shared_constants(&graph, vec![half, def("Mul", &["x_grad"])]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].op_type(), "Mul");
    }
}
