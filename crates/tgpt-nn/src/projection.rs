//! Learned projection chosen at construction: plain or low-rank adapted.

use tgpt_core::{Result, Shape, Tensor};

use crate::conv::Conv1d;
use crate::lora::{LoraConv1d, DEFAULT_RANK, DEFAULT_SCALE};
use crate::module::Module;
use crate::parameter::Parameter;

/// Which projection variant to build.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ProjectionKind {
    #[default]
    Plain,
    LowRank { rank: usize, scale: f32 },
}

impl ProjectionKind {
    /// Low-rank adapter with rank 4 and scale 32.
    pub fn low_rank() -> Self {
        ProjectionKind::LowRank {
            rank: DEFAULT_RANK,
            scale: DEFAULT_SCALE,
        }
    }
}

/// A projection behind one contract, whatever its weight parameterization.
pub enum Projection {
    Plain(Conv1d),
    LowRank(LoraConv1d),
}

impl Projection {
    pub fn new(kind: ProjectionKind, nf: usize, receptive_field: usize) -> Self {
        match kind {
            ProjectionKind::Plain => Projection::Plain(Conv1d::new(nf, receptive_field)),
            ProjectionKind::LowRank { rank, scale } => {
                Projection::LowRank(LoraConv1d::new(nf, receptive_field, rank, scale))
            }
        }
    }

    pub fn with_seed(self, seed: Option<u64>) -> Self {
        match (self, seed) {
            (Projection::Plain(c), Some(s)) => Projection::Plain(c.with_seed(s)),
            (Projection::LowRank(c), Some(s)) => Projection::LowRank(c.with_seed(s)),
            (p, None) => p,
        }
    }

    pub fn kind(&self) -> ProjectionKind {
        match self {
            Projection::Plain(_) => ProjectionKind::Plain,
            Projection::LowRank(c) => ProjectionKind::LowRank {
                rank: c.rank(),
                scale: c.scale(),
            },
        }
    }

    fn inner(&self) -> &dyn Module {
        match self {
            Projection::Plain(c) => c as &dyn Module,
            Projection::LowRank(c) => c as &dyn Module,
        }
    }
}

impl Module for Projection {
    fn configure(&mut self, input_shape: &[usize]) -> Result<Shape> {
        match self {
            Projection::Plain(c) => c.configure(input_shape),
            Projection::LowRank(c) => c.configure(input_shape),
        }
    }

    fn is_configured(&self) -> bool {
        self.inner().is_configured()
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.inner().forward(input)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        match self {
            Projection::Plain(c) => c.named_parameters(),
            Projection::LowRank(c) => c.named_parameters(),
        }
    }
}
