//! # tgpt-core
//!
//! Core tensor engine for the tgpt model stack.
//!
//! Provides the `Tensor` type with:
//! - f32 compute and i32 ids
//! - Zero-copy views (reshape, permute, transpose, narrow)
//! - Broadcasting arithmetic and batched matmul
//! - rayon-parallel reductions and matmul rows

pub mod dtype;
pub mod error;
pub mod ops;
pub mod shape;
pub mod storage;
pub mod tensor;

pub use dtype::DType;
pub use error::TgptError;
pub use shape::Shape;
pub use storage::Storage;
pub use tensor::{standard_normal, Tensor};

pub type Result<T> = std::result::Result<T, TgptError>;
