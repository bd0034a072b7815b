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

use crate::ir::GraphError;
use crate::types::DType;

use super::broadcast::BroadcastError;

/// Which side of a forward node an index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSide {
    Input,
    Output,
}

impl std::fmt::Display for ArgSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgSide::Input => f.write_str("input"),
            ArgSide::Output => f.write_str("output"),
        }
    }
}

/// Errors returned while building gradient graphs. Every variant aborts the
/// pass; none of them is retried.
#[derive(Debug, thiserror::Error)]
pub enum AutodiffError {
    /// A rule asked for an input or output the forward node does not have.
    #[error("{side} index {index} out of range for node '{node}' ({len} {side}s)")]
    IndexOutOfRange {
        node: String,
        side: ArgSide,
        index: usize,
        len: usize,
    },
    /// Scalar constants accept only `[]` or `[1]` as shape.
    #[error("constant shape must be [] or [1], got {0:?}")]
    InvalidConstantShape(Vec<i64>),
    /// No constant encoding exists for the element type.
    #[error("cannot synthesize a constant of element type {0}")]
    UnsupportedConstantType(DType),
    /// The operator is registered as having no gradient.
    #[error("gradient should not be requested for operator '{op_type}' (node '{node}')")]
    UnsupportedGradient { op_type: String, node: String },
    /// Nothing is registered for the operator.
    #[error("no gradient definition registered for '{0}'")]
    MissingGradientDefinition(String),
    /// A declarative gradient definition or attribute could not be used.
    #[error("invalid gradient definition: {0}")]
    InvalidDefinition(String),
    #[error("attribute value '{value}' is not valid json: {source}")]
    AttributeJson {
        value: String,
        #[source]
        source: serde_json::Error,
    },
    /// A forward value required by a rule is missing a type.
    #[error("node arg '{0}' has no type information")]
    MissingType(String),
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

pub(crate) fn as_invalid(msg: impl Into<String>) -> AutodiffError {
    AutodiffError::InvalidDefinition(msg.into())
}
