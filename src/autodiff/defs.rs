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

use crate::ir::{Attribute, NodeArg, ONNX_DOMAIN};
use crate::types::TensorType;

/// A tensor referenced by name, with its type when known.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArgDef {
    pub name: String,
    pub ty: Option<TensorType>,
}

impl ArgDef {
    pub fn new(name: impl Into<String>, ty: Option<TensorType>) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    /// Placeholder for an optional input or output that is not produced.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

impl From<&NodeArg> for ArgDef {
    fn from(arg: &NodeArg) -> Self {
        Self::new(arg.name.clone(), arg.ty.clone())
    }
}

impl From<ArgDef> for NodeArg {
    fn from(arg: ArgDef) -> Self {
        NodeArg::new(arg.name, arg.ty)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpDef {
    pub op_type: String,
    pub domain: String,
    pub since_version: i64,
}

impl OpDef {
    pub fn new(op_type: impl Into<String>, domain: impl Into<String>, since_version: i64) -> Self {
        Self {
            op_type: op_type.into(),
            domain: domain.into(),
            since_version,
        }
    }
}

/// A backward node that has not been inserted into the graph yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDef {
    pub op_def: OpDef,
    pub inputs: Vec<ArgDef>,
    pub outputs: Vec<ArgDef>,
    pub attributes: Vec<Attribute>,
    /// Filled in by the naming post-process when left unset.
    pub name: Option<String>,
}

impl NodeDef {
    /// Node in the default domain, version 1.
    pub fn new(op_type: impl Into<String>, inputs: Vec<ArgDef>, outputs: Vec<ArgDef>) -> Self {
        Self::with_op_def(OpDef::new(op_type, ONNX_DOMAIN, 1), inputs, outputs)
    }

    pub fn with_op_def(op_def: OpDef, inputs: Vec<ArgDef>, outputs: Vec<ArgDef>) -> Self {
        Self {
            op_def,
            inputs,
            outputs,
            attributes: Vec::new(),
            name: None,
        }
    }

    pub fn attributes(mut self, attributes: Vec<Attribute>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn op_type(&self) -> &str {
        &self.op_def.op_type
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// Backward nodes of one forward node, in materialization order.
pub type GradientDef = Vec<NodeDef>;
