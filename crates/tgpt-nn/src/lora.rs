//! LoRA (Low-Rank Adaptation) projection.
//!
//! The base weight `W [rf, nx, nf]` is frozen and a low-rank update is added:
//!   W_eff = W + (scale / rank) * Down @ Up
//! with `Down [rf, nx, rank]` and `Up [rf, rank, nf]`, one product per
//! receptive-field slice. `Down` starts at zero, so a fresh adapter reproduces
//! the plain projection exactly.

use std::fmt;

use tgpt_core::{Result, Shape, Tensor, TgptError};
use tracing::debug;

use crate::conv::{project, Conv1d, Padding, ProjectionShape};
use crate::module::Module;
use crate::parameter::{init_rng, Init, Parameter};

pub const DEFAULT_RANK: usize = 4;
pub const DEFAULT_SCALE: f32 = 32.0;

struct LoraState {
    shape: ProjectionShape,
    /// Frozen base weight.
    w: Parameter,
    b: Parameter,
    down: Parameter,
    up: Parameter,
}

/// Projection with a frozen base weight and a trainable low-rank adapter.
pub struct LoraConv1d {
    nf: usize,
    receptive_field: usize,
    rank: usize,
    scale: f32,
    padding: Padding,
    seed: Option<u64>,
    state: Option<LoraState>,
}

impl LoraConv1d {
    pub fn new(nf: usize, receptive_field: usize, rank: usize, scale: f32) -> Self {
        Self {
            nf,
            receptive_field: receptive_field.max(1),
            rank: rank.max(1),
            scale,
            padding: Padding::Valid,
            seed: None,
            state: None,
        }
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn shape(&self) -> Option<ProjectionShape> {
        self.state.as_ref().map(|s| s.shape)
    }

    pub fn base_weight(&self) -> Option<&Parameter> {
        self.state.as_ref().map(|s| &s.w)
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.state.as_ref().map(|s| &s.b)
    }

    pub fn down(&self) -> Option<&Parameter> {
        self.state.as_ref().map(|s| &s.down)
    }

    pub fn up(&self) -> Option<&Parameter> {
        self.state.as_ref().map(|s| &s.up)
    }

    fn state(&self) -> Result<&LoraState> {
        self.state
            .as_ref()
            .ok_or_else(|| TgptError::NotConfigured("LoraConv1d".into()))
    }

    /// `W + (scale / rank) * Down @ Up`.
    pub fn effective_weight(&self) -> Result<Tensor> {
        let state = self.state()?;
        let delta = state
            .down
            .read()
            .matmul(&state.up.read())?
            .mul_scalar(self.scale / self.rank as f32)?;
        state.w.read().add(&delta)
    }

    /// Fold the adapter into a plain projection (for inference export).
    pub fn merge(&self) -> Result<Conv1d> {
        let state = self.state()?;
        let w = Parameter::new("w", self.effective_weight()?, false);
        let b = Parameter::new("b", state.b.value(), state.b.is_trainable());
        Conv1d::from_parameters(w, b, self.padding)
    }

    /// Number of trainable scalars (adapter and bias).
    pub fn trainable_params(&self) -> usize {
        self.state
            .as_ref()
            .map_or(0, |s| s.down.numel() + s.up.numel() + s.b.numel())
    }

    /// Base weight plus everything trainable.
    pub fn total_params(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.w.numel()) + self.trainable_params()
    }
}

impl Module for LoraConv1d {
    fn configure(&mut self, input_shape: &[usize]) -> Result<Shape> {
        let nx = input_shape
            .last()
            .copied()
            .ok_or_else(|| TgptError::InvalidAxis { axis: -1, ndim: 0 })?;
        let shape = ProjectionShape {
            receptive_field: self.receptive_field,
            nx,
            nf: self.nf,
        };

        if let Some(state) = &self.state {
            if state.shape.nx != nx {
                return Err(TgptError::ShapeMismatch {
                    expected: vec![state.shape.nx],
                    got: vec![nx],
                });
            }
            return state.shape.output_shape(input_shape, self.padding);
        }

        let out = shape.output_shape(input_shape, self.padding)?;
        debug!(
            rf = shape.receptive_field,
            nx,
            nf = shape.nf,
            rank = self.rank,
            scale = self.scale,
            "configuring LoraConv1d"
        );
        let rf = shape.receptive_field;
        let mut rng = init_rng(self.seed);
        self.state = Some(LoraState {
            shape,
            w: Parameter::init("w", &[rf, nx, self.nf], Init::WEIGHT, false, &mut rng),
            b: Parameter::init("b", &[self.nf], Init::Zeros, true, &mut rng),
            down: Parameter::init("down", &[rf, nx, self.rank], Init::Zeros, true, &mut rng),
            up: Parameter::init("up", &[rf, self.rank, self.nf], Init::WEIGHT, true, &mut rng),
        });
        Ok(out)
    }

    fn is_configured(&self) -> bool {
        self.state.is_some()
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let state = self.state()?;
        let weight = self.effective_weight()?;
        project(input, &weight, &state.b.read(), self.padding)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        match &self.state {
            Some(s) => vec![
                ("w".into(), &s.w),
                ("b".into(), &s.b),
                ("down".into(), &s.down),
                ("up".into(), &s.up),
            ],
            None => vec![],
        }
    }
}

impl fmt::Display for LoraConv1d {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LoraConv1d(nf={}, rf={}, rank={}, scale={}, trainable={}/{})",
            self.nf,
            self.receptive_field,
            self.rank,
            self.scale,
            self.trainable_params(),
            self.total_params(),
        )
    }
}
