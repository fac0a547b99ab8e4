//! Convenience re-exports for building models.
//!
//! ```rust
//! use tgpt_nn::prelude::*;
//! ```

pub use crate::{
    Activation, Conv1d, Dropout, LayerNorm, LoraConv1d, Module, Padding, Parameter, Projection,
    ProjectionKind,
};
pub use tgpt_core::{Result, Tensor, TgptError};
