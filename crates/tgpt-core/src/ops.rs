//! Tensor operations: arithmetic, reduction, manipulation, comparison.
//!
//! All operations return new tensors; views share storage.

pub mod arithmetic;
pub mod comparison;
pub mod manipulation;
pub mod reduction;
