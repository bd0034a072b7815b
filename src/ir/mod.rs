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

//! Dataflow graph of named tensor operators.
//!
//! Nodes consume and produce [`NodeArg`]s identified by name. The graph keeps
//! a name index for args, the producer of every arg and the set of node names
//! in use, so gradient builders can resolve forward values and generate
//! collision-free names.

mod tensor;

pub use tensor::{TensorElement, TensorProto};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use crate::types::TensorType;

/// The default operator domain.
pub const ONNX_DOMAIN: &str = "";
/// Domain of the training-only contrib operators.
pub const MS_DOMAIN: &str = "com.microsoft";

/// Name under which a recomputed duplicate of `name` is stored.
pub fn recompute_name(name: &str) -> String {
    format!("{name}_recompute")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub struct NodeArg {
    pub name: String,
    pub ty: Option<TensorType>,
}

impl NodeArg {
    pub fn new(name: impl Into<String>, ty: Option<TensorType>) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    /// Optional inputs/outputs that are absent carry an empty name.
    pub fn exists(&self) -> bool {
        !self.name.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Int(i64),
    Float(f32),
    String(String),
    Tensor(TensorProto),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Strings(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: AttributeValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn int(name: impl Into<String>, value: i64) -> Self {
        Self::new(name, AttributeValue::Int(value))
    }

    pub fn ints(name: impl Into<String>, values: Vec<i64>) -> Self {
        Self::new(name, AttributeValue::Ints(values))
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, AttributeValue::String(value.into()))
    }

    pub fn tensor(name: impl Into<String>, value: TensorProto) -> Self {
        Self::new(name, AttributeValue::Tensor(value))
    }
}

pub type NodeAttributes = BTreeMap<String, AttributeValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// May be empty for anonymous forward nodes.
    pub name: String,
    pub op_type: String,
    pub domain: String,
    pub since_version: i64,
    pub inputs: Vec<NodeArg>,
    pub outputs: Vec<NodeArg>,
    pub attributes: NodeAttributes,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        op_type: impl Into<String>,
        inputs: Vec<NodeArg>,
        outputs: Vec<NodeArg>,
    ) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            domain: ONNX_DOMAIN.to_string(),
            since_version: 1,
            inputs,
            outputs,
            attributes: NodeAttributes::new(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>, since_version: i64) -> Self {
        self.domain = domain.into();
        self.since_version = since_version;
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("node name '{0}' is already used in the graph")]
    DuplicateNodeName(String),
    #[error("node arg '{arg}' already has producer '{producer}'")]
    DuplicateProducer { arg: String, producer: String },
    #[error("node arg '{0}' not found in graph")]
    UnknownNodeArg(String),
    #[error("node index {0} not found in graph")]
    UnknownNode(usize),
    #[error("graph contains a cycle")]
    Cycle,
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    node_args: BTreeMap<String, NodeArg>,
    producers: BTreeMap<String, NodeIndex>,
    node_names: BTreeSet<String>,
    reserved_names: BTreeSet<String>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    domain_to_version: BTreeMap<String, i64>,
    name_counter: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_opset_version(&mut self, domain: impl Into<String>, version: i64) {
        self.domain_to_version.insert(domain.into(), version);
    }

    pub fn opset_version(&self, domain: &str) -> Option<i64> {
        self.domain_to_version.get(domain).copied()
    }

    pub fn add_input(&mut self, arg: NodeArg) {
        self.inputs.push(arg.name.clone());
        self.register_arg(&arg);
    }

    pub fn add_output(&mut self, name: &str) -> Result<(), GraphError> {
        if !self.node_args.contains_key(name) {
            return Err(GraphError::UnknownNodeArg(name.to_string()));
        }
        if !self.outputs.iter().any(|o| o == name) {
            self.outputs.push(name.to_string());
        }
        Ok(())
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Inserts a node, registering its args. Named nodes must be unique;
    /// every arg may have at most one producer.
    pub fn add_node(&mut self, node: Node) -> Result<NodeIndex, GraphError> {
        if !node.name.is_empty() && self.node_names.contains(&node.name) {
            return Err(GraphError::DuplicateNodeName(node.name));
        }
        for output in node.outputs.iter().filter(|o| o.exists()) {
            if let Some(&existing) = self.producers.get(&output.name) {
                return Err(GraphError::DuplicateProducer {
                    arg: output.name.clone(),
                    producer: self.nodes[existing.0].name.clone(),
                });
            }
        }

        let index = NodeIndex(self.nodes.len());
        for arg in node.inputs.iter().chain(&node.outputs) {
            self.register_arg(arg);
        }
        for output in node.outputs.iter().filter(|o| o.exists()) {
            self.producers.insert(output.name.clone(), index);
        }
        if !node.name.is_empty() {
            self.node_names.insert(node.name.clone());
        }
        self.nodes.push(node);
        Ok(index)
    }

    fn register_arg(&mut self, arg: &NodeArg) {
        if !arg.exists() {
            return;
        }
        match self.node_args.get_mut(&arg.name) {
            Some(existing) => {
                if existing.ty.is_none() {
                    existing.ty = arg.ty.clone();
                }
            }
            None => {
                self.node_args.insert(arg.name.clone(), arg.clone());
            }
        }
    }

    pub fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index.0)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_arg(&self, name: &str) -> Option<&NodeArg> {
        self.node_args.get(name)
    }

    pub fn producer_node(&self, arg: &str) -> Option<&Node> {
        self.producers.get(arg).and_then(|&index| self.node(index))
    }

    pub fn consumers(&self, arg: &str) -> Vec<NodeIndex> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.inputs.iter().any(|i| i.name == arg))
            .map(|(index, _)| NodeIndex(index))
            .collect()
    }

    /// Returns `base` if it is neither used nor generated before, otherwise
    /// `base_token_<n>`. A generated name is never handed out twice but may
    /// still be given to one node.
    pub fn generate_node_name(&mut self, base: &str) -> String {
        let mut candidate = base.to_string();
        while self.node_names.contains(&candidate) || self.reserved_names.contains(&candidate) {
            candidate = format!("{base}_token_{}", self.name_counter);
            self.name_counter += 1;
        }
        self.reserved_names.insert(candidate.clone());
        candidate
    }

    /// Kahn's algorithm; ties are broken by insertion order.
    pub fn topological_order(&self) -> Result<Vec<NodeIndex>, GraphError> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (index, node) in self.nodes.iter().enumerate() {
            for input in node.inputs.iter().filter(|i| i.exists()) {
                if let Some(&producer) = self.producers.get(&input.name) {
                    successors[producer.0].push(index);
                    in_degree[index] += 1;
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&index| in_degree[index] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(index) = ready.pop_front() {
            order.push(NodeIndex(index));
            for &next in &successors[index] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(GraphError::Cycle);
        }
        Ok(order)
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            let names = |args: &[NodeArg]| {
                args.iter()
                    .map(|a| a.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            writeln!(
                f,
                "{} = {}({}) [{}]",
                names(node.outputs.as_slice()),
                node.op_type,
                names(node.inputs.as_slice()),
                node.name
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg(name: &str) -> NodeArg {
        NodeArg::new(name, None)
    }

    #[test]
    fn generate_node_name_avoids_existing_names() {
        let mut graph = Graph::new();
        graph
            .add_node(Node::new("Add", "Add", vec![arg("a"), arg("b")], vec![arg("c")]))
            .unwrap();
        let first = graph.generate_node_name("Add");
        let second = graph.generate_node_name("Add");
        assert_ne!(first, "Add");
        assert_ne!(first, second);
        assert_eq!(graph.generate_node_name("Mul"), "Mul");
    }

    #[test]
    fn duplicate_node_names_are_rejected() {
        let mut graph = Graph::new();
        graph
            .add_node(Node::new("n", "Relu", vec![arg("x")], vec![arg("y")]))
            .unwrap();
        let err = graph
            .add_node(Node::new("n", "Relu", vec![arg("y")], vec![arg("z")]))
            .unwrap_err();
        assert_eq!(err, GraphError::DuplicateNodeName("n".to_string()));
    }

    #[test]
    fn topological_order_follows_data_edges() {
        let mut graph = Graph::new();
        let late = graph
            .add_node(Node::new("late", "Relu", vec![arg("h")], vec![arg("y")]))
            .unwrap();
        let early = graph
            .add_node(Node::new("early", "Neg", vec![arg("x")], vec![arg("h")]))
            .unwrap();
        assert_eq!(graph.topological_order().unwrap(), vec![early, late]);
        assert_eq!(graph.producer_node("h").map(|n| n.name.as_str()), Some("early"));
        assert_eq!(graph.consumers("h"), vec![late]);
    }

    #[test]
    fn recompute_naming_convention() {
        assert_eq!(recompute_name("x"), "x_recompute");
    }
}
