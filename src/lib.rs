//! MIND gradient graph builder
pub mod autodiff;
pub mod config;
pub mod ir;
pub mod types;

pub use autodiff::{build_gradient_graph, GradientGraphBuilder, GradientRegistry};
pub use config::GradientGraphConfiguration;
