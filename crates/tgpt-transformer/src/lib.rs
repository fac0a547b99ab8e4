//! # tgpt-transformer
//!
//! Transformer model built from tgpt layers:
//! - `MultiHeadAttention`: causal self-attention, softmax or linear kernel
//! - `Mlp`: position-wise feed-forward network
//! - `TransformerBlock`: attention and MLP with post-norm residuals
//! - `Embedding`: shared token + position table
//! - `TGpt`: full model with tied LM head and paired-choice classifier

pub mod block;
pub mod config;
pub mod embedding;
pub mod feed_forward;
pub mod mha;
pub mod model;

pub use block::{BlockConfig, TransformerBlock};
pub use config::{AdapterConfig, LinearAttentionConfig, TGptConfig};
pub use embedding::{Embedding, EmbeddingTable};
pub use feed_forward::Mlp;
pub use mha::{merge_heads, split_heads, AttentionKind, AttentionShape, MultiHeadAttention};
pub use model::{TGpt, TGptOutput};
