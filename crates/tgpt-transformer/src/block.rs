//! Single transformer block (post-norm).
//!
//! Block(x) = Norm2(MLP(n) + n), n = Norm1(MHA(x) + x)

use tgpt_core::{Result, Shape, Tensor, TgptError};
use tgpt_nn::module::prefixed;
use tgpt_nn::{Activation, LayerNorm, Module, Parameter, ProjectionKind};
use tracing::trace;

use crate::feed_forward::Mlp;
use crate::mha::{AttentionKind, MultiHeadAttention};

/// Block hyper-parameters. The feature width is taken from the input.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockConfig {
    pub num_heads: usize,
    pub attn_dropout: f32,
    pub resid_dropout: f32,
    pub mlp_dropout: f32,
    pub scale: bool,
    pub projection: ProjectionKind,
    pub attention: AttentionKind,
    pub activation: Activation,
    pub seed: Option<u64>,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            num_heads: 12,
            attn_dropout: 0.0,
            resid_dropout: 0.0,
            mlp_dropout: 0.0,
            scale: true,
            projection: ProjectionKind::Plain,
            attention: AttentionKind::Softmax,
            activation: Activation::Gelu,
            seed: None,
        }
    }
}

struct BlockState {
    nx: usize,
    attn: MultiHeadAttention,
    norm1: LayerNorm,
    mlp: Mlp,
    norm2: LayerNorm,
}

/// Attention and feed-forward sub-layers, each followed by a residual add
/// and its own layer norm.
pub struct TransformerBlock {
    config: BlockConfig,
    training: bool,
    state: Option<BlockState>,
}

impl TransformerBlock {
    pub fn new(config: BlockConfig) -> Self {
        Self {
            config,
            training: false,
            state: None,
        }
    }

    pub fn config(&self) -> &BlockConfig {
        &self.config
    }

    pub fn attention(&self) -> Option<&MultiHeadAttention> {
        self.state.as_ref().map(|s| &s.attn)
    }

    pub fn mlp(&self) -> Option<&Mlp> {
        self.state.as_ref().map(|s| &s.mlp)
    }

    fn build(&self, nx: usize) -> Result<BlockState> {
        let c = &self.config;
        let seed = c.seed;
        let attn = MultiHeadAttention::new(c.num_heads, nx)?
            .with_projection(c.projection)
            .with_dropout(c.attn_dropout, c.resid_dropout)?
            .with_attention(c.attention)?
            .with_scale(c.scale)?
            .with_seed(seed);
        let mlp = Mlp::new(c.activation, c.mlp_dropout)?
            .with_projection(c.projection)
            .with_seed(seed.map(|s| s.wrapping_add(16)));
        Ok(BlockState {
            nx,
            attn,
            norm1: LayerNorm::default(),
            mlp,
            norm2: LayerNorm::default(),
        })
    }
}

impl Module for TransformerBlock {
    fn configure(&mut self, input_shape: &[usize]) -> Result<Shape> {
        let nx = input_shape
            .last()
            .copied()
            .ok_or_else(|| TgptError::InvalidAxis { axis: -1, ndim: 0 })?;
        if let Some(state) = &self.state {
            if state.nx != nx {
                return Err(TgptError::ShapeMismatch {
                    expected: vec![state.nx],
                    got: vec![nx],
                });
            }
            return Ok(Shape::new(input_shape));
        }

        let mut state = self.build(nx)?;
        let a = state.attn.configure(input_shape)?;
        let n = state.norm1.configure(a.dims())?;
        let m = state.mlp.configure(n.dims())?;
        let out = state.norm2.configure(m.dims())?;
        state.attn.train(self.training);
        state.mlp.train(self.training);
        self.state = Some(state);
        Ok(out)
    }

    fn is_configured(&self) -> bool {
        self.state.is_some()
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| TgptError::NotConfigured("TransformerBlock".into()))?;
        trace!(dims = ?input.dims(), "block forward");
        let a = state.attn.forward(input)?;
        let n = state.norm1.forward(&a.add(input)?)?;
        let m = state.mlp.forward(&n)?;
        state.norm2.forward(&m.add(&n)?)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        match &self.state {
            Some(s) => {
                let mut params = prefixed("attn", s.attn.named_parameters());
                params.extend(prefixed("ln_1", s.norm1.named_parameters()));
                params.extend(prefixed("mlp", s.mlp.named_parameters()));
                params.extend(prefixed("ln_2", s.norm2.named_parameters()));
                params
            }
            None => vec![],
        }
    }

    fn train(&mut self, mode: bool) {
        self.training = mode;
        if let Some(s) = &mut self.state {
            s.attn.train(mode);
            s.mlp.train(mode);
        }
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(num_heads: usize) -> TransformerBlock {
        TransformerBlock::new(BlockConfig {
            num_heads,
            seed: Some(3),
            ..BlockConfig::default()
        })
    }

    #[test]
    fn test_block_shape() {
        let mut b = block(4);
        let out = b.configure(&[2, 5, 16]).unwrap();
        assert_eq!(out.dims(), &[2, 5, 16]);
        let y = b.forward(&Tensor::randn(&[2, 5, 16])).unwrap();
        assert_eq!(y.dims(), &[2, 5, 16]);
    }

    #[test]
    fn test_output_is_normalized() {
        let mut b = block(2);
        b.configure(&[1, 3, 8]).unwrap();
        let y = b.forward(&Tensor::randn(&[1, 3, 8])).unwrap();
        for row in y.as_f32_slice().unwrap().chunks(8) {
            let mean: f32 = row.iter().sum::<f32>() / 8.0;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 8.0;
            assert!(mean.abs() < 1e-4);
            assert!((var - 1.0).abs() < 1e-2, "var {}", var);
        }
    }

    #[test]
    fn test_head_divisibility_checked_at_configure() {
        let mut b = block(3);
        assert!(matches!(
            b.configure(&[1, 4, 10]),
            Err(TgptError::DimensionMismatch { dim: 10, heads: 3 })
        ));
        assert!(!b.is_configured());
    }

    #[test]
    fn test_parameters_and_train_mode() {
        let mut b = block(2);
        b.train(true);
        b.configure(&[1, 2, 8]).unwrap();
        assert!(b.attention().unwrap().is_training());
        assert!(b.mlp().unwrap().is_training());
        // c_attn w,b + c_proj w,b + ln g,b + c_fc w,b + c_proj w,b + ln g,b
        assert_eq!(b.parameters().len(), 12);
        assert!(b.state_dict().contains_key("attn.c_attn.w"));
        b.train(false);
        assert!(!b.attention().unwrap().is_training());
    }
}
