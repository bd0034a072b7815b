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

//! Graph-level automatic differentiation.
//!
//! Gradients are built ahead of execution by rewriting the forward graph:
//! every differentiable node on a path from the requested inputs to the loss
//! is handed to a [`GradientBuilder`] rule, which describes its backward
//! computation as a list of [`NodeDef`]s. The entry point is
//! [`build_gradient_graph`]; rules are looked up in a [`GradientRegistry`].
//!
//! No runtime tape is involved. Which forward tensors the backward nodes read
//! is reported as the stashed set of the [`GradientGraphResult`].

mod broadcast;
mod builder;
mod constants;
mod defs;
mod engine;
mod error;
mod registry;
pub mod rules;

pub use broadcast::{
    compute_broadcast_backward_axes, compute_broadcast_backward_axes_dynamic, get_shape,
    BroadcastAxes, BroadcastError,
};
pub use builder::{
    external_output_name, gradient_name, GradientBuilder, GradientBuilderContext, PassState,
};
pub use constants::{
    constant_scalar_node, constant_scalar_node_by_elem_type, constant_vector_node,
    half_constant_node, one_constant_node, scalar_tensor_proto,
    scalar_tensor_proto_by_elem_type, zero_constant_node,
};
pub use defs::{ArgDef, GradientDef, NodeDef, OpDef};
pub use engine::{build_gradient_graph, GradientGraphBuilder, GradientGraphResult};
pub use error::{ArgSide, AutodiffError};
pub use registry::{
    gradient_definition_key, DeclarativeGradient, GradientBuilderFactory,
    GradientNodeAttributeDefinition, GradientNodeDefinition, GradientRegistry,
};
