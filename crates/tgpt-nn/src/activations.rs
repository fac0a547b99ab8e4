//! Activation functions and the by-name lookup used by the feed-forward layer.

use std::fmt;
use std::str::FromStr;

use tgpt_core::{Result, Tensor, TgptError};

/// ReLU: max(0, x)
pub fn relu(input: &Tensor) -> Result<Tensor> {
    input.map(|x| x.max(0.0))
}

/// GELU, tanh approximation: 0.5 * x * (1 + tanh(sqrt(2/π) * (x + 0.044715 * x³)))
pub fn gelu(input: &Tensor) -> Result<Tensor> {
    input.map(|x| {
        let inner = std::f32::consts::FRAC_2_SQRT_PI * std::f32::consts::FRAC_1_SQRT_2
            * (x + 0.044715 * x * x * x);
        0.5 * x * (1.0 + inner.tanh())
    })
}

/// Swish / SiLU: x * sigmoid(x)
pub fn swish(input: &Tensor) -> Result<Tensor> {
    input.map(|x| x / (1.0 + (-x).exp()))
}

/// Activation selected by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    Gelu,
    Relu,
    Swish,
}

impl Activation {
    /// Look up an activation by name. Accepts `gelu`, `relu`, `swish` and `silu`.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gelu" => Ok(Activation::Gelu),
            "relu" => Ok(Activation::Relu),
            "swish" | "silu" => Ok(Activation::Swish),
            _ => Err(TgptError::UnknownActivation(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Activation::Gelu => "gelu",
            Activation::Relu => "relu",
            Activation::Swish => "swish",
        }
    }

    pub fn apply(&self, input: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Gelu => gelu(input),
            Activation::Relu => relu(input),
            Activation::Swish => swish(input),
        }
    }
}

impl FromStr for Activation {
    type Err = TgptError;

    fn from_str(s: &str) -> Result<Self> {
        Activation::from_name(s)
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu() {
        let t = Tensor::from_f32(&[-1.0, 0.0, 1.0, 2.0], &[4]);
        assert_eq!(relu(&t).unwrap().as_f32_slice().unwrap(), &[0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_gelu() {
        let t = Tensor::from_f32(&[0.0, 1.0, -1.0], &[3]);
        let data = gelu(&t).unwrap().to_f32_vec().unwrap();
        assert!(data[0].abs() < 1e-6);
        assert!((data[1] - 0.8412).abs() < 1e-3);
        assert!((data[2] + 0.1588).abs() < 1e-3);
    }

    #[test]
    fn test_swish() {
        let t = Tensor::from_f32(&[0.0, 2.0], &[2]);
        let data = swish(&t).unwrap().to_f32_vec().unwrap();
        assert_eq!(data[0], 0.0);
        assert!((data[1] - 2.0 / (1.0 + (-2.0f32).exp())).abs() < 1e-6);
    }

    #[test]
    fn test_lookup_by_name() {
        assert_eq!(Activation::from_name("gelu").unwrap(), Activation::Gelu);
        assert_eq!("SiLU".parse::<Activation>().unwrap(), Activation::Swish);
        assert_eq!(Activation::from_name("relu").unwrap().to_string(), "relu");
        assert!(matches!(
            Activation::from_name("tanhshrink"),
            Err(TgptError::UnknownActivation(_))
        ));
    }
}
