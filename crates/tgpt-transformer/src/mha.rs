//! Causal multi-head self-attention.
//!
//! One fused projection produces q, k and v; heads are attended either with
//! masked softmax (quadratic in sequence length) or with random-feature linear
//! attention, then merged and projected back. Projections may be plain or
//! low-rank adapted; the layer contract is the same in every combination.

use tgpt_attention::{apply_weights, attention_weights, CausalMask, LinearAttention};
use tgpt_core::{Result, Shape, Tensor, TgptError};
use tgpt_nn::module::prefixed;
use tgpt_nn::{Dropout, Module, Parameter, Projection, ProjectionKind};
use tracing::debug;

/// How heads are attended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttentionKind {
    /// Masked softmax over all earlier positions.
    #[default]
    Softmax,
    /// Positive random-feature approximation with a fixed projection seed.
    Linear {
        num_random_features: usize,
        seed: u64,
    },
}

enum AttentionKernel {
    Softmax(CausalMask),
    Linear(LinearAttention),
}

/// Shape record fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    pub num_heads: usize,
    pub key_dim: usize,
    pub head_dim: usize,
}

/// `[batch, seq, features]` to `[batch, heads, seq, features / heads]`.
pub fn split_heads(x: &Tensor, num_heads: usize) -> Result<Tensor> {
    let dims = x.dims();
    if dims.len() != 3 || num_heads == 0 || dims[2] % num_heads != 0 {
        return Err(TgptError::DimensionMismatch {
            dim: dims.last().copied().unwrap_or(0),
            heads: num_heads,
        });
    }
    let (b, l, e) = (dims[0] as isize, dims[1] as isize, dims[2]);
    x.reshape(&[b, l, num_heads as isize, (e / num_heads) as isize])?
        .permute(&[0, 2, 1, 3])
}

/// Inverse of [`split_heads`].
pub fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    if dims.len() != 4 {
        return Err(TgptError::ShapeMismatch {
            expected: vec![0, 0, 0, 0],
            got: dims.to_vec(),
        });
    }
    let (b, h, l, d) = (dims[0], dims[1], dims[2], dims[3]);
    x.permute(&[0, 2, 1, 3])?
        .reshape(&[b as isize, l as isize, (h * d) as isize])
}

/// Multi-head self-attention over `[batch, seq, key_dim]`.
pub struct MultiHeadAttention {
    shape: AttentionShape,
    scale: bool,
    kind: AttentionKind,
    conv_inp: Projection,
    conv_out: Projection,
    attn_dropout: Dropout,
    resid_dropout: Dropout,
    kernel: AttentionKernel,
}

impl MultiHeadAttention {
    /// Softmax attention with plain projections, no dropout and no scaling.
    pub fn new(num_heads: usize, key_dim: usize) -> Result<Self> {
        if num_heads == 0 || key_dim % num_heads != 0 {
            return Err(TgptError::DimensionMismatch {
                dim: key_dim,
                heads: num_heads,
            });
        }
        Ok(Self {
            shape: AttentionShape {
                num_heads,
                key_dim,
                head_dim: key_dim / num_heads,
            },
            scale: false,
            kind: AttentionKind::Softmax,
            conv_inp: Projection::new(ProjectionKind::Plain, 3 * key_dim, 1),
            conv_out: Projection::new(ProjectionKind::Plain, key_dim, 1),
            attn_dropout: Dropout::new(0.0)?,
            resid_dropout: Dropout::new(0.0)?,
            kernel: AttentionKernel::Softmax(CausalMask::new()),
        })
    }

    /// Divide scores by `sqrt(head_dim)` (softmax) or pre-scale features (linear).
    pub fn with_scale(mut self, scale: bool) -> Result<Self> {
        self.scale = scale;
        let kind = self.kind;
        self.with_attention(kind)
    }

    /// Dropout on the attention weights and on the layer output.
    pub fn with_dropout(mut self, attn: f32, resid: f32) -> Result<Self> {
        self.attn_dropout = Dropout::new(attn)?;
        self.resid_dropout = Dropout::new(resid)?;
        Ok(self)
    }

    pub fn with_projection(mut self, kind: ProjectionKind) -> Self {
        self.conv_inp = Projection::new(kind, 3 * self.shape.key_dim, 1);
        self.conv_out = Projection::new(kind, self.shape.key_dim, 1);
        self
    }

    /// Select the kernel. The random feature matrix is drawn here, once.
    pub fn with_attention(mut self, kind: AttentionKind) -> Result<Self> {
        self.kernel = match kind {
            AttentionKind::Softmax => AttentionKernel::Softmax(CausalMask::new()),
            AttentionKind::Linear {
                num_random_features,
                seed,
            } => AttentionKernel::Linear(LinearAttention::new(
                num_random_features,
                self.shape.head_dim,
                seed,
                self.scale,
            )?),
        };
        self.kind = kind;
        Ok(self)
    }

    /// Seed projection init and dropout masks.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        if let Some(s) = seed {
            self.conv_inp = self.conv_inp.with_seed(Some(s));
            self.conv_out = self.conv_out.with_seed(Some(s.wrapping_add(1)));
            self.attn_dropout = self.attn_dropout.with_seed(s.wrapping_add(2));
            self.resid_dropout = self.resid_dropout.with_seed(s.wrapping_add(3));
        }
        self
    }

    pub fn shape(&self) -> AttentionShape {
        self.shape
    }

    pub fn num_heads(&self) -> usize {
        self.shape.num_heads
    }

    pub fn key_dim(&self) -> usize {
        self.shape.key_dim
    }

    pub fn scale(&self) -> bool {
        self.scale
    }

    pub fn attention_kind(&self) -> AttentionKind {
        self.kind
    }

    pub fn projection_kind(&self) -> ProjectionKind {
        self.conv_inp.kind()
    }

    /// The random feature matrix `[F, head_dim]` in linear mode.
    pub fn random_features(&self) -> Option<&Tensor> {
        match &self.kernel {
            AttentionKernel::Linear(lin) => Some(lin.feature_map().omega()),
            AttentionKernel::Softmax(_) => None,
        }
    }

    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        match &self.kernel {
            AttentionKernel::Softmax(mask) => {
                let w = attention_weights(q, k, self.scale, Some(mask))?;
                let w = self.attn_dropout.forward(&w)?;
                apply_weights(&w, v)
            }
            AttentionKernel::Linear(lin) => lin.forward(q, k, v),
        }
    }
}

impl Module for MultiHeadAttention {
    fn configure(&mut self, input_shape: &[usize]) -> Result<Shape> {
        let key_dim = self.shape.key_dim;
        if input_shape.len() != 3 || input_shape[2] != key_dim {
            return Err(TgptError::ShapeMismatch {
                expected: vec![key_dim],
                got: input_shape.to_vec(),
            });
        }
        debug!(
            heads = self.shape.num_heads,
            key_dim,
            kind = ?self.kind,
            projection = ?self.projection_kind(),
            scale = self.scale,
            "configuring MultiHeadAttention"
        );
        let fused = self.conv_inp.configure(input_shape)?;
        let mut merged = fused.dims().to_vec();
        merged[2] = key_dim;
        self.conv_out.configure(&merged)
    }

    fn is_configured(&self) -> bool {
        self.conv_inp.is_configured() && self.conv_out.is_configured()
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if !self.is_configured() {
            return Err(TgptError::NotConfigured("MultiHeadAttention".into()));
        }
        if input.ndim() != 3 || input.dims()[2] != self.shape.key_dim {
            return Err(TgptError::ShapeMismatch {
                expected: vec![self.shape.key_dim],
                got: input.dims().to_vec(),
            });
        }
        let heads = self.shape.num_heads;
        let qkv = self.conv_inp.forward(input)?.split_equal(3, -1)?;
        let q = split_heads(&qkv[0], heads)?;
        let k = split_heads(&qkv[1], heads)?;
        let v = split_heads(&qkv[2], heads)?;

        let a = merge_heads(&self.attend(&q, &k, &v)?)?;
        let a = self.conv_out.forward(&a)?;
        self.resid_dropout.forward(&a)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        let mut params = prefixed("c_attn", self.conv_inp.named_parameters());
        params.extend(prefixed("c_proj", self.conv_out.named_parameters()));
        params
    }

    fn train(&mut self, mode: bool) {
        self.attn_dropout.train(mode);
        self.resid_dropout.train(mode);
    }

    fn is_training(&self) -> bool {
        self.resid_dropout.is_training()
    }
}
