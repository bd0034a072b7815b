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

//! Lookup of gradient rules for forward nodes.
//!
//! Built-in rules are keyed by `(domain, op_type)` and selected by the
//! highest registered since-version not above the node's. Custom operators
//! can instead be described declaratively, keyed by an explicit string.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ir::{AttributeValue, Node, MS_DOMAIN, ONNX_DOMAIN};
use crate::types::DType;

use super::builder::{GradientBuilder, GradientBuilderContext};
use super::defs::{ArgDef, GradientDef, NodeDef, OpDef};
use super::error::{as_invalid, AutodiffError};
use super::rules;

pub type GradientBuilderFactory = fn() -> Box<dyn GradientBuilder>;

/// One attribute of a declaratively defined backward node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradientNodeAttributeDefinition {
    pub name: String,
    /// The value as JSON text, e.g. `"[0, 1]"` or `"0.5"`.
    pub value_json: String,
    pub dtype: DType,
    #[serde(default)]
    pub is_tensor: bool,
}

fn default_since_version() -> i64 {
    1
}

/// One declaratively defined backward node.
///
/// Inputs and outputs are written as `I(k)`, `O(k)`, `GI(k)` or `GO(k)`;
/// any other non-empty string names a temporary of the rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradientNodeDefinition {
    pub op_type: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_since_version")]
    pub since_version: i64,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<GradientNodeAttributeDefinition>,
}

/// Registry key of a forward node: custom `PythonOp` nodes use their
/// `func_name` attribute, everything else `<domain>::<op_type>`.
pub fn gradient_definition_key(node: &Node) -> String {
    if node.op_type == "PythonOp" {
        if let Some(AttributeValue::String(func_name)) = node.attributes.get("func_name") {
            return func_name.clone();
        }
    }
    format!("{}::{}", node.domain, node.op_type)
}

#[derive(Default)]
pub struct GradientRegistry {
    builders: BTreeMap<(String, String), BTreeMap<i64, GradientBuilderFactory>>,
    definitions: BTreeMap<String, Vec<GradientNodeDefinition>>,
}

impl GradientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in rules.
    pub fn with_default_rules() -> Self {
        let mut registry = Self::new();
        registry.register(ONNX_DOMAIN, "Add", 1, || {
            Box::new(rules::AddSubGradient { is_sub: false })
        });
        registry.register(ONNX_DOMAIN, "Sub", 1, || {
            Box::new(rules::AddSubGradient { is_sub: true })
        });
        registry.register(ONNX_DOMAIN, "Mul", 1, || Box::new(rules::MulGradient));
        registry.register(ONNX_DOMAIN, "Neg", 1, || Box::new(rules::NegGradient));
        registry.register(ONNX_DOMAIN, "Identity", 1, || Box::new(rules::IdentityGradient));
        registry.register(ONNX_DOMAIN, "Cast", 1, || Box::new(rules::CastGradient));
        registry.register(ONNX_DOMAIN, "Relu", 1, || Box::new(rules::ReluGradient));
        registry.register(MS_DOMAIN, "PythonOp", 1, || Box::new(rules::PythonOpGradient));

        for op_type in ["Shape", "Size", "ConstantOfShape", "StopGradient"] {
            registry.register(ONNX_DOMAIN, op_type, 1, || Box::new(rules::EmptyGradient));
        }
        for op_type in ["ArgMax", "ArgMin", "Round", "Floor", "Ceil"] {
            registry.register(ONNX_DOMAIN, op_type, 1, || Box::new(rules::UnsupportedGradient));
        }
        registry
    }

    pub fn register(
        &mut self,
        domain: &str,
        op_type: &str,
        since_version: i64,
        factory: GradientBuilderFactory,
    ) {
        self.builders
            .entry((domain.to_string(), op_type.to_string()))
            .or_default()
            .insert(since_version, factory);
    }

    /// Registers declarative backward nodes under an explicit key.
    pub fn register_definitions(&mut self, key: &str, definitions: Vec<GradientNodeDefinition>) {
        self.definitions.insert(key.to_string(), definitions);
    }

    /// Same as [`register_definitions`](Self::register_definitions) with
    /// the node list given as a JSON array.
    pub fn register_definitions_json(&mut self, key: &str, json: &str) -> Result<(), AutodiffError> {
        let definitions: Vec<GradientNodeDefinition> =
            serde_json::from_str(json).map_err(|source| AutodiffError::AttributeJson {
                value: json.to_string(),
                source,
            })?;
        self.register_definitions(key, definitions);
        Ok(())
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.lookup(node).is_ok()
    }

    /// Finds the rule for `node`. Declarative definitions registered under
    /// the node's key take precedence over built-in rules.
    pub fn lookup(&self, node: &Node) -> Result<Box<dyn GradientBuilder>, AutodiffError> {
        let key = gradient_definition_key(node);
        if let Some(definitions) = self.definitions.get(&key) {
            return Ok(Box::new(DeclarativeGradient {
                definitions: definitions.clone(),
            }));
        }

        self.builders
            .get(&(node.domain.clone(), node.op_type.clone()))
            .and_then(|versions| versions.range(..=node.since_version).next_back())
            .map(|(_, factory)| factory())
            .ok_or(AutodiffError::MissingGradientDefinition(key))
    }
}

/// Interprets [`GradientNodeDefinition`]s for one forward node.
#[derive(Debug, Clone)]
pub struct DeclarativeGradient {
    pub definitions: Vec<GradientNodeDefinition>,
}

enum ArgRef<'s> {
    Input(usize),
    Output(usize),
    InputGradient(usize),
    OutputGradient(usize),
    Intermediate(&'s str),
    Empty,
}

fn parse_arg_ref(text: &str) -> Result<ArgRef<'_>, AutodiffError> {
    if text.is_empty() {
        return Ok(ArgRef::Empty);
    }
    let Some((head, rest)) = text.split_once('(') else {
        return Ok(ArgRef::Intermediate(text));
    };
    let Some(index) = rest.strip_suffix(')') else {
        return Ok(ArgRef::Intermediate(text));
    };
    let index: usize = match head {
        "I" | "O" | "GI" | "GO" => index
            .trim()
            .parse()
            .map_err(|_| as_invalid(format!("bad argument index in '{text}'")))?,
        _ => return Ok(ArgRef::Intermediate(text)),
    };
    Ok(match head {
        "I" => ArgRef::Input(index),
        "O" => ArgRef::Output(index),
        "GI" => ArgRef::InputGradient(index),
        _ => ArgRef::OutputGradient(index),
    })
}

impl DeclarativeGradient {
    fn resolve(
        ctx: &mut GradientBuilderContext<'_>,
        text: &str,
        is_output: bool,
    ) -> Result<ArgDef, AutodiffError> {
        Ok(match parse_arg_ref(text)? {
            ArgRef::Input(i) => ctx.input(i)?,
            ArgRef::Output(i) => ctx.output(i)?,
            ArgRef::InputGradient(i) => {
                // Outputs nobody asked for are left unproduced.
                if is_output && !ctx.is_gradient_required_for_src_node_input(i) {
                    ArgDef::empty()
                } else {
                    ctx.input_gradient(i)?
                }
            }
            ArgRef::OutputGradient(i) => ctx.output_gradient(i)?,
            ArgRef::Intermediate(name) => ctx.intermediate(name, None),
            ArgRef::Empty => ArgDef::empty(),
        })
    }
}

impl GradientBuilder for DeclarativeGradient {
    fn gradient_defs_impl(
        &self,
        ctx: &mut GradientBuilderContext<'_>,
    ) -> Result<GradientDef, AutodiffError> {
        let mut output = GradientDef::with_capacity(self.definitions.len());
        for definition in &self.definitions {
            let inputs = definition
                .inputs
                .iter()
                .map(|text| Self::resolve(ctx, text, false))
                .collect::<Result<Vec<_>, _>>()?;
            let outputs = definition
                .outputs
                .iter()
                .map(|text| Self::resolve(ctx, text, true))
                .collect::<Result<Vec<_>, _>>()?;
            let attributes = definition
                .attributes
                .iter()
                .map(|attr| ctx.attribute_from_definition(attr))
                .collect::<Result<Vec<_>, _>>()?;

            output.push(
                NodeDef::with_op_def(
                    OpDef::new(
                        definition.op_type.clone(),
                        definition.domain.clone(),
                        definition.since_version,
                    ),
                    inputs,
                    outputs,
                )
                .attributes(attributes),
            );
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::NodeArg;

    fn node(op_type: &str, since_version: i64) -> Node {
        Node::new("n", op_type, vec![NodeArg::new("x", None)], vec![NodeArg::new("y", None)])
            .with_domain(ONNX_DOMAIN, since_version)
    }

    #[test]
    fn key_uses_domain_and_op_type() {
        assert_eq!(gradient_definition_key(&node("Relu", 14)), "::Relu");
        let custom = Node::new("p", "PythonOp", vec![], vec![])
            .with_domain(MS_DOMAIN, 1)
            .with_attribute("func_name", AttributeValue::String("MyFn".to_string()));
        assert_eq!(gradient_definition_key(&custom), "MyFn");
    }

    #[test]
    fn lookup_picks_highest_version_not_above_node() {
        let mut registry = GradientRegistry::new();
        registry.register(ONNX_DOMAIN, "Foo", 13, || Box::new(rules::EmptyGradient));
        assert!(registry.contains(&node("Foo", 13)));
        assert!(registry.contains(&node("Foo", 18)));
        assert!(matches!(
            registry.lookup(&node("Foo", 11)),
            Err(AutodiffError::MissingGradientDefinition(ref key)) if key == "::Foo"
        ));
    }

    #[test]
    fn parse_arg_refs() {
        assert!(matches!(parse_arg_ref("GI(2)").unwrap(), ArgRef::InputGradient(2)));
        assert!(matches!(parse_arg_ref("GO(0)").unwrap(), ArgRef::OutputGradient(0)));
        assert!(matches!(parse_arg_ref("I(1)").unwrap(), ArgRef::Input(1)));
        assert!(matches!(parse_arg_ref("tmp").unwrap(), ArgRef::Intermediate("tmp")));
        assert!(matches!(parse_arg_ref("f(x)").unwrap(), ArgRef::Intermediate("f(x)")));
        assert!(matches!(parse_arg_ref("").unwrap(), ArgRef::Empty));
        assert!(parse_arg_ref("GI(a)").is_err());
    }

    #[test]
    fn definitions_deserialize_with_defaults() {
        let mut registry = GradientRegistry::new();
        registry
            .register_definitions_json(
                "MyFn",
                r#"[{"op_type": "Neg", "inputs": ["GO(0)"], "outputs": ["GI(0)"]}]"#,
            )
            .unwrap();
        let defs = &registry.definitions["MyFn"];
        assert_eq!(defs[0].domain, "");
        assert_eq!(defs[0].since_version, 1);
        assert!(defs[0].attributes.is_empty());
    }
}
