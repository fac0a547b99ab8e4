//! Causal linear attention over random features.
//!
//! For each (batch, head) the prefix sums are carried as a running state
//! instead of materialized per position:
//!
//! ```text
//! S_t = S_{t-1} + φ(k_t) ⊗ v_t        [F, Dv]
//! z_t = z_{t-1} + φ(k_t)              [F]
//! out_t = φ(q_t)·S_t / (φ(q_t)·z_t + 1e-6)
//! ```
//!
//! When keys arrive as logits, `φ(k_t)` is taken against the running max
//! `m_t` of all key logits up to `t`. Whenever `m_t` grows, `S` and `z` are
//! rescaled by `exp(m_{t-1} - m_t)`, so no position ever sees a later key.
//!
//! Time is O(L·F·Dv) per head and the extra memory is one `[F, Dv]` state.

use rayon::prelude::*;
use tgpt_core::{Result, Tensor, TgptError};
use tracing::trace;

use crate::random_features::{RandomFeatureMap, FEATURE_EPS};

const NORMALIZER_EPS: f32 = 1e-6;

#[derive(Clone, Copy)]
enum KeyInput {
    Features,
    Logits { normalizer: f32 },
}

/// Run the causal recurrence on already-mapped features.
///
/// # Arguments
/// * `q_features` - [..., L, F]
/// * `k_features` - [..., L, F]
/// * `value`      - [..., L, Dv]
///
/// # Returns
/// * [..., L, Dv]
pub fn causal_linear_attention(
    q_features: &Tensor,
    k_features: &Tensor,
    value: &Tensor,
) -> Result<Tensor> {
    recurrence(q_features, k_features, value, KeyInput::Features)
}

/// Run the causal recurrence with keys given as feature logits
/// (see [`RandomFeatureMap::logits`]).
///
/// Each key feature is `normalizer·(exp(l - m_t) + 1e-6)` where `m_t` is the
/// max key logit over positions `≤ t` of the same (batch, head).
pub fn causal_linear_attention_logits(
    q_features: &Tensor,
    k_logits: &Tensor,
    value: &Tensor,
    normalizer: f32,
) -> Result<Tensor> {
    recurrence(q_features, k_logits, value, KeyInput::Logits { normalizer })
}

fn recurrence(q: &Tensor, k: &Tensor, value: &Tensor, keys: KeyInput) -> Result<Tensor> {
    let q_dims = q.dims();
    let n = q_dims.len();
    if n < 2 || q_dims != k.dims() {
        return Err(TgptError::ShapeMismatch {
            expected: q_dims.to_vec(),
            got: k.dims().to_vec(),
        });
    }
    let v_dims = value.dims();
    if v_dims.len() != n || v_dims[..n - 1] != q_dims[..n - 1] {
        return Err(TgptError::ShapeMismatch {
            expected: q_dims[..n - 1].to_vec(),
            got: v_dims.to_vec(),
        });
    }

    let seq = q_dims[n - 2];
    let f = q_dims[n - 1];
    let dv = v_dims[n - 1];

    let q = q.contiguous();
    let k = k.contiguous();
    let v = value.contiguous();
    let q_data = q.as_f32_slice().ok_or(TgptError::UnsupportedDType(q.dtype()))?;
    let k_data = k.as_f32_slice().ok_or(TgptError::UnsupportedDType(k.dtype()))?;
    let v_data = v.as_f32_slice().ok_or(TgptError::UnsupportedDType(v.dtype()))?;

    let mut out = vec![0.0f32; value.numel()];
    let per_group = seq * dv;
    if per_group > 0 {
        out.par_chunks_mut(per_group)
            .enumerate()
            .for_each(|(g, o)| {
                let qg = &q_data[g * seq * f..(g + 1) * seq * f];
                let kg = &k_data[g * seq * f..(g + 1) * seq * f];
                let vg = &v_data[g * seq * dv..(g + 1) * seq * dv];
                let mut state = vec![0.0f32; f * dv];
                let mut z = vec![0.0f32; f];
                let mut phi_k = vec![0.0f32; f];
                let mut running_max = f32::NEG_INFINITY;

                for t in 0..seq {
                    let k_t = &kg[t * f..(t + 1) * f];
                    match keys {
                        KeyInput::Features => phi_k.copy_from_slice(k_t),
                        KeyInput::Logits { normalizer } => {
                            let step_max = k_t.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                            if step_max > running_max {
                                // exp(-inf) is 0; the state is still empty then.
                                let decay = (running_max - step_max).exp();
                                state.iter_mut().for_each(|s| *s *= decay);
                                z.iter_mut().for_each(|s| *s *= decay);
                                running_max = step_max;
                            }
                            for (p, &l) in phi_k.iter_mut().zip(k_t) {
                                *p = normalizer * ((l - running_max).exp() + FEATURE_EPS);
                            }
                        }
                    }

                    let v_t = &vg[t * dv..(t + 1) * dv];
                    for (i, &kv) in phi_k.iter().enumerate() {
                        z[i] += kv;
                        for (s, &vv) in state[i * dv..(i + 1) * dv].iter_mut().zip(v_t) {
                            *s += kv * vv;
                        }
                    }

                    let q_t = &qg[t * f..(t + 1) * f];
                    let o_t = &mut o[t * dv..(t + 1) * dv];
                    let mut denom = 0.0f32;
                    for (i, &qv) in q_t.iter().enumerate() {
                        denom += qv * z[i];
                        for (acc, &s) in o_t.iter_mut().zip(&state[i * dv..(i + 1) * dv]) {
                            *acc += qv * s;
                        }
                    }
                    let inv = 1.0 / (denom + NORMALIZER_EPS);
                    o_t.iter_mut().for_each(|x| *x *= inv);
                }
            });
    }

    Tensor::from_vec(out, v_dims)
}

/// Linear-time approximation of causal softmax attention.
#[derive(Debug, Clone)]
pub struct LinearAttention {
    features: RandomFeatureMap,
    scale: bool,
}

impl LinearAttention {
    /// `num_features` random features for heads of size `head_dim`.
    pub fn new(num_features: usize, head_dim: usize, seed: u64, scale: bool) -> Result<Self> {
        Ok(Self {
            features: RandomFeatureMap::new(num_features, head_dim, seed)?,
            scale,
        })
    }

    pub fn feature_map(&self) -> &RandomFeatureMap {
        &self.features
    }

    pub fn scale(&self) -> bool {
        self.scale
    }

    /// `q`, `k`, `v` shaped `[..., L, D]`.
    pub fn forward(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> Result<Tensor> {
        trace!(
            dims = ?query.dims(),
            features = self.features.num_features(),
            "linear attention"
        );
        let q = self.features.features(query, self.scale)?;
        let k = self.features.logits(key, self.scale)?;
        causal_linear_attention_logits(&q, &k, value, self.features.normalizer())
    }
}
