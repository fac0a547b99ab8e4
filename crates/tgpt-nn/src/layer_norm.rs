//! Layer Normalization.
//!
//! y = (x - mean) / sqrt(var + eps) * g + b, with the statistics taken over the
//! trailing axis (or a configured axis set). `g` and `b` are sized to the
//! trailing dimension of the first configured input.

use tgpt_core::{Result, Shape, Tensor, TgptError};
use tracing::debug;

use crate::module::Module;
use crate::parameter::{Init, Parameter};

/// Shape record fixed by [`LayerNorm::configure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormShape {
    pub features: usize,
}

struct NormState {
    shape: NormShape,
    g: Parameter,
    b: Parameter,
}

/// Layer normalization with lazily sized scale and shift.
pub struct LayerNorm {
    axes: Vec<isize>,
    eps: f32,
    state: Option<NormState>,
}

impl LayerNorm {
    pub fn new(eps: f32) -> Self {
        Self {
            axes: vec![-1],
            eps,
            state: None,
        }
    }

    /// Normalize over `axes` instead of the trailing axis only.
    pub fn with_axes(mut self, axes: &[isize]) -> Self {
        self.axes = axes.to_vec();
        self
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }

    pub fn shape(&self) -> Option<&NormShape> {
        self.state.as_ref().map(|s| &s.shape)
    }

    pub fn g(&self) -> Option<&Parameter> {
        self.state.as_ref().map(|s| &s.g)
    }

    pub fn b(&self) -> Option<&Parameter> {
        self.state.as_ref().map(|s| &s.b)
    }

    fn normalize_last_axis(&self, input: &Tensor, g: &[f32], b: &[f32]) -> Result<Tensor> {
        let data = input.contiguous();
        let slice = data
            .as_f32_slice()
            .ok_or(TgptError::UnsupportedDType(input.dtype()))?;
        let features = g.len();

        let mut result = vec![0.0f32; slice.len()];
        for (row, out) in slice.chunks(features).zip(result.chunks_mut(features)) {
            let mean: f32 = row.iter().sum::<f32>() / features as f32;
            let var: f32 = row.iter().map(|&x| (x - mean) * (x - mean)).sum::<f32>() / features as f32;
            let inv_std = 1.0 / (var + self.eps).sqrt();
            for i in 0..features {
                out[i] = (row[i] - mean) * inv_std * g[i] + b[i];
            }
        }
        Tensor::from_vec(result, input.dims())
    }
}

impl Default for LayerNorm {
    fn default() -> Self {
        Self::new(1e-5)
    }
}

impl Module for LayerNorm {
    fn configure(&mut self, input_shape: &[usize]) -> Result<Shape> {
        let shape = Shape::new(input_shape);
        let features = shape
            .last_dim()
            .ok_or_else(|| TgptError::InvalidAxis { axis: -1, ndim: 0 })?;
        if features == 0 {
            return Err(TgptError::InvalidConfig("LayerNorm over an empty axis".into()));
        }
        for &axis in &self.axes {
            shape.normalize_axis(axis)?;
        }

        if let Some(state) = &self.state {
            if state.shape.features != features {
                return Err(TgptError::ShapeMismatch {
                    expected: vec![state.shape.features],
                    got: vec![features],
                });
            }
            return Ok(shape);
        }

        debug!(features, axes = ?self.axes, "configuring LayerNorm");
        let mut rng = rand::thread_rng();
        self.state = Some(NormState {
            shape: NormShape { features },
            g: Parameter::init("g", &[features], Init::Ones, true, &mut rng),
            b: Parameter::init("b", &[features], Init::Zeros, true, &mut rng),
        });
        Ok(shape)
    }

    fn is_configured(&self) -> bool {
        self.state.is_some()
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| TgptError::NotConfigured("LayerNorm".into()))?;
        let last = input.shape().last_dim().unwrap_or(0);
        if last != state.shape.features {
            return Err(TgptError::ShapeMismatch {
                expected: vec![state.shape.features],
                got: vec![last],
            });
        }

        let g = state.g.value();
        let b = state.b.value();

        if self.axes == [-1] {
            let g_data = g.to_f32_vec()?;
            let b_data = b.to_f32_vec()?;
            return self.normalize_last_axis(input, &g_data, &b_data);
        }

        let u = input.mean_axes_keepdim(&self.axes)?;
        let centered = input.sub(&u)?;
        let s = centered.mul(&centered)?.mean_axes_keepdim(&self.axes)?;
        let normed = centered.div(&s.add_scalar(self.eps)?.sqrt()?)?;
        normed.mul(&g)?.add(&b)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        match &self.state {
            Some(s) => vec![("g".into(), &s.g), ("b".into(), &s.b)],
            None => vec![],
        }
    }
}
