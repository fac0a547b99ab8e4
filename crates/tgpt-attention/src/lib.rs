//! # tgpt-attention
//!
//! Causal attention kernels for tgpt.
//!
//! Provides:
//! - Cached causal masking with a finite fill value
//! - Scaled dot-product (softmax) attention, weights exposed for dropout
//! - Positive orthogonal random features
//! - Linear-time causal attention with a streaming prefix state

pub mod linear;
pub mod mask;
pub mod random_features;
pub mod scaled_dot;

pub use linear::{causal_linear_attention, causal_linear_attention_logits, LinearAttention};
pub use mask::{causal_mask, CausalMask, MASK_FILL};
pub use random_features::{orthogonal_random_matrix, RandomFeatureMap, DEFAULT_SEED, FEATURE_EPS};
pub use scaled_dot::{apply_weights, attention_weights, scaled_dot_product_attention};
