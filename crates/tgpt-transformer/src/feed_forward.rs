//! Position-wise feed-forward network.
//!
//! MLP(x) = dropout(proj(act(fc(x)))), hidden width 4 * nx.

use tgpt_core::{Result, Shape, Tensor, TgptError};
use tgpt_nn::module::prefixed;
use tgpt_nn::{Activation, Dropout, Module, Parameter, Projection, ProjectionKind};
use tracing::debug;

/// Hidden width as a multiple of the input width.
pub const HIDDEN_MULTIPLIER: usize = 4;

struct MlpState {
    nx: usize,
    c_fc: Projection,
    c_proj: Projection,
}

/// Two projections around an activation. Widths come from the first input.
pub struct Mlp {
    activation: Activation,
    projection: ProjectionKind,
    seed: Option<u64>,
    dropout: Dropout,
    state: Option<MlpState>,
}

impl Mlp {
    pub fn new(activation: Activation, dropout: f32) -> Result<Self> {
        Ok(Self {
            activation,
            projection: ProjectionKind::Plain,
            seed: None,
            dropout: Dropout::new(dropout)?,
            state: None,
        })
    }

    pub fn with_projection(mut self, kind: ProjectionKind) -> Self {
        self.projection = kind;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        if let Some(s) = seed {
            self.dropout = self.dropout.with_seed(s.wrapping_add(2));
        }
        self
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Hidden width once configured.
    pub fn hidden_dim(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.nx * HIDDEN_MULTIPLIER)
    }
}

impl Module for Mlp {
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

        let hidden = nx * HIDDEN_MULTIPLIER;
        debug!(nx, hidden, activation = %self.activation, "configuring Mlp");
        let mut c_fc = Projection::new(self.projection, hidden, 1).with_seed(self.seed);
        let mut c_proj =
            Projection::new(self.projection, nx, 1).with_seed(self.seed.map(|s| s.wrapping_add(1)));
        let hidden_shape = c_fc.configure(input_shape)?;
        let out = c_proj.configure(hidden_shape.dims())?;
        self.state = Some(MlpState { nx, c_fc, c_proj });
        Ok(out)
    }

    fn is_configured(&self) -> bool {
        self.state.is_some()
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| TgptError::NotConfigured("Mlp".into()))?;
        let h = self.activation.apply(&state.c_fc.forward(input)?)?;
        let h = state.c_proj.forward(&h)?;
        self.dropout.forward(&h)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        match &self.state {
            Some(s) => {
                let mut params = prefixed("c_fc", s.c_fc.named_parameters());
                params.extend(prefixed("c_proj", s.c_proj.named_parameters()));
                params
            }
            None => vec![],
        }
    }

    fn train(&mut self, mode: bool) {
        self.dropout.train(mode);
    }

    fn is_training(&self) -> bool {
        self.dropout.is_training()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_width_is_four_times_input() {
        let mut mlp = Mlp::new(Activation::Gelu, 0.0).unwrap();
        let out = mlp.configure(&[2, 3, 8]).unwrap();
        assert_eq!(out.dims(), &[2, 3, 8]);
        assert_eq!(mlp.hidden_dim(), Some(32));
        let dims: Vec<Vec<usize>> = mlp.parameters().iter().map(|p| p.dims()).collect();
        assert_eq!(dims, vec![vec![1, 8, 32], vec![32], vec![1, 32, 8], vec![8]]);
    }

    #[test]
    fn test_forward_shape_and_activation() {
        let mut mlp = Mlp::new(Activation::Relu, 0.0).unwrap().with_seed(Some(1));
        mlp.configure(&[1, 4, 6]).unwrap();
        let y = mlp.forward(&Tensor::randn(&[1, 4, 6])).unwrap();
        assert_eq!(y.dims(), &[1, 4, 6]);
        assert_eq!(mlp.activation().name(), "relu");
    }

    #[test]
    fn test_low_rank_projections() {
        let mut mlp = Mlp::new(Activation::Gelu, 0.1)
            .unwrap()
            .with_projection(ProjectionKind::low_rank());
        mlp.configure(&[1, 2, 8]).unwrap();
        assert_eq!(mlp.parameters().len(), 8);
        let frozen: Vec<String> = mlp
            .named_parameters()
            .into_iter()
            .filter(|(_, p)| !p.is_trainable())
            .map(|(n, _)| n)
            .collect();
        assert_eq!(frozen, vec!["c_fc.w".to_string(), "c_proj.w".to_string()]);
    }

    #[test]
    fn test_reconfigure_with_other_width_fails() {
        let mut mlp = Mlp::new(Activation::Gelu, 0.0).unwrap();
        mlp.configure(&[1, 2, 8]).unwrap();
        mlp.configure(&[5, 7, 8]).unwrap();
        assert!(matches!(
            mlp.configure(&[1, 2, 4]),
            Err(TgptError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_not_configured() {
        let mlp = Mlp::new(Activation::Gelu, 0.0).unwrap();
        assert!(mlp.forward(&Tensor::ones(&[1, 4])).is_err());
    }
}
