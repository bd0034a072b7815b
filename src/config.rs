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

//! Pass-wide options for gradient graph construction.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid gradient graph configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read-only knobs consulted by the driver and the gradient rules.
///
/// Missing fields take their default values, so `{}` is a valid
/// configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradientGraphConfiguration {
    /// Expose the gradients of the requested inputs as graph outputs.
    pub set_gradients_as_graph_outputs: bool,
    /// Seed every loss gradient with a one-constant instead of expecting
    /// `<loss>_grad` as a graph input.
    pub seed_with_one: bool,
}

impl GradientGraphConfiguration {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config = GradientGraphConfiguration::from_json("{}").unwrap();
        assert_eq!(config, GradientGraphConfiguration::default());
    }

    #[test]
    fn fields_are_read() {
        let config =
            GradientGraphConfiguration::from_json(r#"{"set_gradients_as_graph_outputs": true}"#)
                .unwrap();
        assert!(config.set_gradients_as_graph_outputs);
        assert!(!config.seed_with_one);
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = GradientGraphConfiguration::from_json("{").unwrap_err();
        assert!(err.to_string().starts_with("invalid gradient graph configuration"));
    }
}
