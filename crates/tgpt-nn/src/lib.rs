//! # tgpt-nn
//!
//! Layers for the tgpt stack: the two-phase [`Module`] trait, shared
//! [`Parameter`] handles, layer normalization, plain and low-rank projections,
//! dropout and activations.

pub mod activations;
pub mod conv;
pub mod dropout;
pub mod layer_norm;
pub mod lora;
pub mod module;
pub mod parameter;
pub mod prelude;
pub mod projection;

pub use activations::Activation;
pub use conv::{Conv1d, Padding, ProjectionShape};
pub use dropout::Dropout;
pub use layer_norm::{LayerNorm, NormShape};
pub use lora::LoraConv1d;
pub use module::Module;
pub use parameter::{Init, Parameter};
pub use projection::{Projection, ProjectionKind};
