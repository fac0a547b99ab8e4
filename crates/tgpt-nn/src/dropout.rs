//! Dropout: zero elements with probability `p` during training, scale the
//! survivors by `1 / (1 - p)`. Identity in eval mode.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tgpt_core::{Result, Shape, Tensor, TgptError};

use crate::module::Module;
use crate::parameter::Parameter;

pub struct Dropout {
    p: f32,
    training: bool,
    rng: Mutex<StdRng>,
}

impl Dropout {
    /// Dropout with rate `p` in `[0, 1)`. Starts in eval mode.
    pub fn new(p: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(TgptError::InvalidConfig(format!(
                "dropout rate must be in [0, 1), got {p}"
            )));
        }
        Ok(Self {
            p,
            training: false,
            rng: Mutex::new(StdRng::seed_from_u64(rand::thread_rng().gen())),
        })
    }

    /// Reseed the mask generator.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn p(&self) -> f32 {
        self.p
    }

    fn active(&self) -> bool {
        self.training && self.p > 0.0
    }

    /// Draw a `{0, 1/(1-p)}` mask of the given shape.
    fn mask(&self, dims: &[usize]) -> Result<Tensor> {
        let scale = 1.0 / (1.0 - self.p);
        let numel: usize = dims.iter().product();
        let mut rng = self.rng.lock();
        let data: Vec<f32> = (0..numel)
            .map(|_| if rng.gen::<f32>() < self.p { 0.0 } else { scale })
            .collect();
        Tensor::from_vec(data, dims)
    }

    /// Dropout with one mask value shared along each axis in `shared_axes`.
    ///
    /// For `[batch, choices, features]` with `shared_axes = [1]`, every choice
    /// of an example sees the same feature mask.
    pub fn forward_grouped(&self, input: &Tensor, shared_axes: &[isize]) -> Result<Tensor> {
        if !self.active() {
            return Ok(input.clone());
        }
        let mut noise_shape = input.dims().to_vec();
        for &axis in shared_axes {
            noise_shape[input.shape().normalize_axis(axis)?] = 1;
        }
        input.mul(&self.mask(&noise_shape)?)
    }
}

impl Default for Dropout {
    /// Rate 0: the identity in every mode.
    fn default() -> Self {
        Self {
            p: 0.0,
            training: false,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }
}

impl Module for Dropout {
    fn configure(&mut self, input_shape: &[usize]) -> Result<Shape> {
        Ok(Shape::new(input_shape))
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if !self.active() {
            return Ok(input.clone());
        }
        input.mul(&self.mask(input.dims())?)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        vec![]
    }

    fn train(&mut self, mode: bool) {
        self.training = mode;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn training(p: f32) -> Dropout {
        let mut d = Dropout::new(p).unwrap().with_seed(42);
        d.train(true);
        d
    }

    #[test]
    fn test_dropout_eval_identity() {
        let dropout = Dropout::new(0.5).unwrap();
        assert!(!dropout.is_training());
        let input = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[4]);
        let output = dropout.forward(&input).unwrap();
        assert_eq!(input.as_f32_slice().unwrap(), output.as_f32_slice().unwrap());
    }

    #[test]
    fn test_dropout_zero_prob() {
        let dropout = training(0.0);
        let input = Tensor::from_f32(&[1.0, 2.0, 3.0], &[3]);
        let output = dropout.forward(&input).unwrap();
        assert_eq!(input.as_f32_slice().unwrap(), output.as_f32_slice().unwrap());
    }

    #[test]
    fn test_dropout_rejects_bad_rate() {
        assert!(Dropout::new(1.0).is_err());
        assert!(Dropout::new(-0.1).is_err());
    }

    #[test]
    fn test_dropout_training_zeros_and_scales() {
        let dropout = training(0.5);
        let input = Tensor::ones(&[1000]);
        let output = dropout.forward(&input).unwrap();
        let data = output.as_f32_slice().unwrap();

        let zero_count = data.iter().filter(|&&v| v == 0.0).count();
        assert!(zero_count > 400 && zero_count < 600, "zeros: {}", zero_count);
        for &v in data {
            assert!(v == 0.0 || (v - 2.0).abs() < 1e-5, "unexpected {}", v);
        }
    }

    #[test]
    fn test_masks_differ_between_calls() {
        let dropout = training(0.5);
        let input = Tensor::ones(&[256]);
        let a = dropout.forward(&input).unwrap();
        let b = dropout.forward(&input).unwrap();
        assert_ne!(a.as_f32_slice(), b.as_f32_slice());
    }

    #[test]
    fn test_grouped_mask_shared_across_axis() {
        let dropout = training(0.5);
        // [batch=4, choices=2, features=32]
        let input = Tensor::ones(&[4, 2, 32]);
        let output = dropout.forward_grouped(&input, &[1]).unwrap();
        let data = output.as_f32_slice().unwrap();
        for b in 0..4 {
            let first = &data[b * 64..b * 64 + 32];
            let second = &data[b * 64 + 32..b * 64 + 64];
            assert_eq!(first, second);
        }
        assert!(data.iter().any(|&v| v == 0.0));
    }
}
