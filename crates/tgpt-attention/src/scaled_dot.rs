//! Quadratic (softmax) attention over `[..., L, D]` inputs.
//!
//! The weights are exposed separately from their application so that a caller
//! can apply dropout to them in between.

use tgpt_core::{Result, Tensor, TgptError};

use crate::mask::CausalMask;

fn check_qkv(query: &Tensor, key: &Tensor, value: &Tensor) -> Result<()> {
    if query.ndim() < 2 || query.dims() != key.dims() {
        return Err(TgptError::ShapeMismatch {
            expected: query.dims().to_vec(),
            got: key.dims().to_vec(),
        });
    }
    let n = value.ndim();
    if n != query.ndim() || value.dims()[..n - 1] != query.dims()[..n - 1] {
        return Err(TgptError::ShapeMismatch {
            expected: query.dims().to_vec(),
            got: value.dims().to_vec(),
        });
    }
    Ok(())
}

/// `softmax(mask(q @ kᵀ [/ sqrt(d)]))` with shape `[..., L, L]`.
///
/// `scale` divides the scores by the square root of the head size.
/// With a mask, every position attends only to itself and earlier positions.
pub fn attention_weights(
    query: &Tensor,
    key: &Tensor,
    scale: bool,
    mask: Option<&CausalMask>,
) -> Result<Tensor> {
    check_qkv(query, key, key)?;
    let mut scores = query.matmul(&key.transpose()?)?;
    if scale {
        let d = query.dims()[query.ndim() - 1] as f32;
        scores = scores.mul_scalar(1.0 / d.sqrt())?;
    }
    if let Some(mask) = mask {
        scores = mask.apply(&scores)?;
    }
    scores.softmax(-1)
}

/// `weights @ v`.
pub fn apply_weights(weights: &Tensor, value: &Tensor) -> Result<Tensor> {
    weights.matmul(value)
}

/// Attention in one call, without dropout on the weights.
///
/// # Arguments
/// * `query` - [..., L, D]
/// * `key`   - [..., L, D]
/// * `value` - [..., L, Dv]
pub fn scaled_dot_product_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    scale: bool,
    mask: Option<&CausalMask>,
) -> Result<Tensor> {
    check_qkv(query, key, value)?;
    let weights = attention_weights(query, key, scale, mask)?;
    apply_weights(&weights, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rand_qkv(dims: &[usize], seed: u64) -> (Tensor, Tensor, Tensor) {
        let mut rng = StdRng::seed_from_u64(seed);
        (
            Tensor::randn_with(dims, 0.0, 1.0, &mut rng),
            Tensor::randn_with(dims, 0.0, 1.0, &mut rng),
            Tensor::randn_with(dims, 0.0, 1.0, &mut rng),
        )
    }

    #[test]
    fn test_identity_attention_single_position() {
        let q = Tensor::from_f32(&[1.0, 0.0], &[1, 2]);
        let v = Tensor::from_f32(&[3.0, 4.0], &[1, 2]);
        let out = scaled_dot_product_attention(&q, &q, &v, true, None).unwrap();
        assert_eq!(out.as_f32_slice().unwrap(), &[3.0, 4.0]);
    }

    #[test]
    fn test_weights_rows_sum_to_one() {
        let (q, k, _) = rand_qkv(&[2, 3, 5, 4], 1);
        let mask = CausalMask::new();
        let w = attention_weights(&q, &k, true, Some(&mask)).unwrap();
        assert_eq!(w.dims(), &[2, 3, 5, 5]);
        for row in w.as_f32_slice().unwrap().chunks(5) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_masked_positions_get_no_weight() {
        let (q, k, _) = rand_qkv(&[1, 2, 6, 4], 2);
        let mask = CausalMask::new();
        let w = attention_weights(&q, &k, false, Some(&mask)).unwrap();
        let data = w.as_f32_slice().unwrap();
        for (r, row) in data.chunks(6).enumerate() {
            let i = r % 6;
            let future: f32 = row[i + 1..].iter().sum();
            assert!(future < 1e-6, "row {} leaks {}", i, future);
        }
    }

    #[test]
    fn test_first_position_copies_first_value() {
        let (q, k, v) = rand_qkv(&[1, 1, 4, 3], 3);
        let mask = CausalMask::new();
        let out = scaled_dot_product_attention(&q, &k, &v, true, Some(&mask)).unwrap();
        let out = out.as_f32_slice().unwrap();
        let v = v.as_f32_slice().unwrap();
        for d in 0..3 {
            assert!((out[d] - v[d]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_scale_flattens_distribution() {
        let q = Tensor::from_f32(&[2.0, 2.0, 2.0, 2.0], &[1, 4]);
        let k = Tensor::from_f32(&[1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0], &[2, 4]);
        let q2 = Tensor::cat(&[&q, &q], 0).unwrap();
        let raw = attention_weights(&q2, &k, false, None).unwrap();
        let scaled = attention_weights(&q2, &k, true, None).unwrap();
        assert!(scaled.get_f32(0).unwrap() < raw.get_f32(0).unwrap());
    }

    #[test]
    fn test_shape_mismatch() {
        let q = Tensor::ones(&[2, 4]);
        let k = Tensor::ones(&[3, 4]);
        assert!(scaled_dot_product_attention(&q, &k, &k, false, None).is_err());
    }
}
