//! Causal masking for attention scores.

use std::collections::HashMap;

use parking_lot::RwLock;
use tgpt_core::{Result, Tensor, TgptError};

/// Value written into masked score positions. Finite so that fully masked
/// rows still produce a defined softmax.
pub const MASK_FILL: f32 = -1e9;

/// Lower-triangular `[seq_len, seq_len]` tensor with 1.0 where position `i`
/// may attend to `j` (`j <= i`) and 0.0 elsewhere.
pub fn causal_mask(seq_len: usize) -> Tensor {
    let mut data = vec![0.0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in 0..=i {
            data[i * seq_len + j] = 1.0;
        }
    }
    Tensor::from_f32(&data, &[seq_len, seq_len])
}

/// Additive fill `MASK_FILL * (1 - B)` for a causal pattern `B`.
fn fill_for(mask: &Tensor) -> Result<Tensor> {
    mask.map(|b| MASK_FILL * (1.0 - b))
}

/// Applies `x * B + MASK_FILL * (1 - B)` over the last two axes of a score
/// tensor, caching the pattern per sequence length.
#[derive(Default)]
pub struct CausalMask {
    cache: RwLock<HashMap<usize, (Tensor, Tensor)>>,
}

impl CausalMask {
    pub fn new() -> Self {
        Self::default()
    }

    fn pattern(&self, seq_len: usize) -> Result<(Tensor, Tensor)> {
        if let Some(hit) = self.cache.read().get(&seq_len) {
            return Ok(hit.clone());
        }
        let keep = causal_mask(seq_len);
        let fill = fill_for(&keep)?;
        let mut cache = self.cache.write();
        let entry = cache.entry(seq_len).or_insert((keep, fill));
        Ok(entry.clone())
    }

    /// Mask scores shaped `[..., L, L]`.
    pub fn apply(&self, scores: &Tensor) -> Result<Tensor> {
        let dims = scores.dims();
        let n = dims.len();
        if n < 2 || dims[n - 1] != dims[n - 2] {
            let l = dims.last().copied().unwrap_or(0);
            return Err(TgptError::ShapeMismatch {
                expected: vec![l, l],
                got: dims.to_vec(),
            });
        }
        let (keep, fill) = self.pattern(dims[n - 1])?;
        scores.mul(&keep)?.add(&fill)
    }

    /// Number of distinct lengths seen so far.
    pub fn cached_lengths(&self) -> usize {
        self.cache.read().len()
    }
}
