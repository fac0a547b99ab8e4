//! Positive orthogonal random features for softmax-kernel approximation.
//!
//! `exp(q·k)` is estimated by `φ(q)·φ(k)` with
//!
//! ```text
//! φ(x) = F^{-1/2} (exp(Ω x - |x|²/2 - stab) + 1e-6)
//! ```
//!
//! where `Ω [F, D]` stacks blocks of orthonormal rows, each row rescaled by
//! the norm of an independent Gaussian vector so row lengths follow the same
//! chi distribution as unstructured Gaussian features.
//!
//! Reference: Choromanski et al., "Rethinking Attention with Performers" (2021).

use rand::rngs::StdRng;
use rand::SeedableRng;
use tgpt_core::{standard_normal, Result, Tensor, TgptError};

/// Seed used when none is configured.
pub const DEFAULT_SEED: u64 = 1337;

/// Floor added to every feature after the exponential.
pub const FEATURE_EPS: f32 = 1e-6;

/// Orthonormal rows of a `d x d` Gaussian matrix (modified Gram-Schmidt).
fn orthogonal_block(d: usize, rng: &mut StdRng) -> Vec<f32> {
    let mut rows: Vec<Vec<f32>> = Vec::with_capacity(d);
    while rows.len() < d {
        let mut v: Vec<f32> = (0..d).map(|_| standard_normal(rng)).collect();
        for r in &rows {
            let dot: f32 = v.iter().zip(r).map(|(a, b)| a * b).sum();
            for (x, y) in v.iter_mut().zip(r) {
                *x -= dot * y;
            }
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        // Resample a nearly dependent draw.
        if norm < 1e-4 {
            continue;
        }
        v.iter_mut().for_each(|x| *x /= norm);
        rows.push(v);
    }
    rows.concat()
}

/// Build the `[num_features, dim]` projection from a fixed seed.
pub fn orthogonal_random_matrix(num_features: usize, dim: usize, seed: u64) -> Result<Tensor> {
    if num_features == 0 || dim == 0 {
        return Err(TgptError::InvalidConfig(format!(
            "random feature matrix needs positive size, got [{num_features}, {dim}]"
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Vec::with_capacity(num_features * dim);
    while data.len() < num_features * dim {
        let block = orthogonal_block(dim, &mut rng);
        let take = (num_features * dim - data.len()).min(block.len());
        data.extend_from_slice(&block[..take]);
    }
    for row in data.chunks_mut(dim) {
        let norm = (0..dim)
            .map(|_| standard_normal(&mut rng).powi(2))
            .sum::<f32>()
            .sqrt();
        row.iter_mut().for_each(|x| *x *= norm);
    }
    Tensor::from_vec(data, &[num_features, dim])
}

/// Fixed random projection plus the positive feature map built on it.
#[derive(Debug, Clone)]
pub struct RandomFeatureMap {
    omega: Tensor,
    num_features: usize,
    dim: usize,
    seed: u64,
}

impl RandomFeatureMap {
    pub fn new(num_features: usize, dim: usize, seed: u64) -> Result<Self> {
        Ok(Self {
            omega: orthogonal_random_matrix(num_features, dim, seed)?,
            num_features,
            dim,
            seed,
        })
    }

    /// `Ω`, shaped `[num_features, dim]`.
    pub fn omega(&self) -> &Tensor {
        &self.omega
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// `F^{-1/2}`, the scale applied to every feature.
    pub fn normalizer(&self) -> f32 {
        1.0 / (self.num_features as f32).sqrt()
    }

    /// Exponents of the positive features, `Ω x̂ - |x̂|²/2`, shaped `[..., L, F]`.
    ///
    /// With `scale`, `x̂ = x·D^{-1/4}` so that `φ(q)·φ(k)` estimates
    /// `exp(q·k / sqrt(D))`. Keys go through the attention kernel in this
    /// form; it applies the exponential against a causal running max.
    pub fn logits(&self, input: &Tensor, scale: bool) -> Result<Tensor> {
        let dims = input.dims();
        let n = dims.len();
        if n < 2 || dims[n - 1] != self.dim {
            return Err(TgptError::ShapeMismatch {
                expected: vec![self.dim],
                got: dims.to_vec(),
            });
        }
        let x = if scale {
            input.mul_scalar((self.dim as f32).powf(-0.25))?
        } else {
            input.contiguous()
        };
        let half_sq_norm: Vec<f32> = x
            .as_f32_slice()
            .ok_or(TgptError::UnsupportedDType(x.dtype()))?
            .chunks(self.dim)
            .map(|row| row.iter().map(|v| v * v).sum::<f32>() / 2.0)
            .collect();

        let projected = x.matmul(&self.omega.transpose()?)?;
        let mut out = projected
            .as_f32_slice()
            .ok_or(TgptError::UnsupportedDType(projected.dtype()))?
            .to_vec();
        for (row, diag) in out.chunks_mut(self.num_features).zip(&half_sq_norm) {
            row.iter_mut().for_each(|v| *v -= diag);
        }

        let mut out_dims = dims.to_vec();
        out_dims[n - 1] = self.num_features;
        Tensor::from_vec(out, &out_dims)
    }

    /// Positive features `[..., L, F]`, each row stabilized by its own max.
    ///
    /// A per-row constant cancels between numerator and normalizer, so this
    /// is the form used for queries.
    pub fn features(&self, input: &Tensor, scale: bool) -> Result<Tensor> {
        let logits = self.logits(input, scale)?;
        let mut out = logits
            .as_f32_slice()
            .ok_or(TgptError::UnsupportedDType(logits.dtype()))?
            .to_vec();
        let norm = self.normalizer();
        for row in out.chunks_mut(self.num_features) {
            let stab = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            for v in row.iter_mut() {
                *v = norm * ((*v - stab).exp() + FEATURE_EPS);
            }
        }
        Tensor::from_vec(out, logits.dims())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_are_orthogonal() {
        let omega = orthogonal_random_matrix(8, 4, 7).unwrap();
        let data = omega.as_f32_slice().unwrap();
        for block in data.chunks(16) {
            let rows: Vec<&[f32]> = block.chunks(4).collect();
            for i in 0..4 {
                for j in 0..i {
                    let dot: f32 = rows[i].iter().zip(rows[j]).map(|(a, b)| a * b).sum();
                    assert!(dot.abs() < 1e-3, "rows {} and {} dot {}", i, j, dot);
                }
            }
        }
    }

    #[test]
    fn test_same_seed_same_matrix() {
        let a = orthogonal_random_matrix(10, 6, 1337).unwrap();
        let b = orthogonal_random_matrix(10, 6, 1337).unwrap();
        let c = orthogonal_random_matrix(10, 6, 1338).unwrap();
        assert_eq!(a.as_f32_slice(), b.as_f32_slice());
        assert_ne!(a.as_f32_slice(), c.as_f32_slice());
    }

    #[test]
    fn test_partial_final_block() {
        let omega = orthogonal_random_matrix(5, 4, 0).unwrap();
        assert_eq!(omega.dims(), &[5, 4]);
    }

    #[test]
    fn test_features_positive_with_expected_shape() {
        let map = RandomFeatureMap::new(16, 4, DEFAULT_SEED).unwrap();
        let x = Tensor::randn(&[2, 3, 5, 4]);
        let phi = map.features(&x, true).unwrap();
        assert_eq!(phi.dims(), &[2, 3, 5, 16]);
        assert!(phi.as_f32_slice().unwrap().iter().all(|&v| v > 0.0 && v.is_finite()));
    }

    #[test]
    fn test_logits_subtract_half_squared_norm() {
        let map = RandomFeatureMap::new(3, 2, 9).unwrap();
        let x = Tensor::from_f32(&[1.0, -2.0], &[1, 2]);
        let logits = map.logits(&x, false).unwrap();
        let omega = map.omega().as_f32_slice().unwrap();
        let l = logits.as_f32_slice().unwrap();
        for f in 0..3 {
            let proj = omega[2 * f] - 2.0 * omega[2 * f + 1];
            assert!((l[f] - (proj - 2.5)).abs() < 1e-5);
        }
    }

    #[test]
    fn test_row_max_feature_is_normalizer() {
        let map = RandomFeatureMap::new(8, 4, DEFAULT_SEED).unwrap();
        let phi = map.features(&Tensor::randn(&[3, 4]), true).unwrap();
        for row in phi.as_f32_slice().unwrap().chunks(8) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            assert!((max - map.normalizer() * (1.0 + FEATURE_EPS)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rejects_wrong_head_size() {
        let map = RandomFeatureMap::new(16, 4, DEFAULT_SEED).unwrap();
        assert!(map.logits(&Tensor::ones(&[3, 5]), false).is_err());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(RandomFeatureMap::new(0, 4, 1).is_err());
    }
}
