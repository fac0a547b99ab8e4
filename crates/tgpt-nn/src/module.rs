use std::collections::HashMap;

use tgpt_core::{Result, Shape, Tensor};

use crate::parameter::Parameter;

/// Base trait for every layer.
///
/// Layers are built in two phases. `configure` sees the input shape once,
/// creates any shape-dependent parameters and returns the output shape.
/// `forward` then runs on shared references. Configuring again with the same
/// shape is a no-op; a different shape is a `ShapeMismatch` error.
pub trait Module: Send + Sync {
    /// Size parameters from `input_shape` and return the output shape.
    fn configure(&mut self, input_shape: &[usize]) -> Result<Shape>;

    /// Whether `configure` has succeeded.
    fn is_configured(&self) -> bool;

    /// Forward pass.
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Parameters with dotted path names.
    fn named_parameters(&self) -> Vec<(String, &Parameter)>;

    fn parameters(&self) -> Vec<&Parameter> {
        self.named_parameters().into_iter().map(|(_, p)| p).collect()
    }

    /// Parameters an optimizer may update.
    fn trainable_parameters(&self) -> Vec<&Parameter> {
        self.parameters()
            .into_iter()
            .filter(|p| p.is_trainable())
            .collect()
    }

    /// Total scalar count over all parameters.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.numel()).sum()
    }

    /// Set training/eval mode.
    fn train(&mut self, _mode: bool) {}

    fn is_training(&self) -> bool {
        false
    }

    /// Snapshot of every parameter by name.
    fn state_dict(&self) -> HashMap<String, Tensor> {
        self.named_parameters()
            .into_iter()
            .map(|(name, p)| (name, p.value()))
            .collect()
    }
}

/// Prefix child parameter names with `prefix.`.
pub fn prefixed<'a>(prefix: &str, params: Vec<(String, &'a Parameter)>) -> Vec<(String, &'a Parameter)> {
    params
        .into_iter()
        .map(|(name, p)| (format!("{prefix}.{name}"), p))
        .collect()
}
