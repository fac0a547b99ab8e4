//! Element-wise arithmetic and matrix multiplication.

use rayon::prelude::*;
use smallvec::SmallVec;

use crate::dtype::DType;
use crate::error::TgptError;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::Result;

/// Minimum number of output rows before matmul fans out over rayon.
const PAR_ROWS: usize = 64;

impl Tensor {
    /// Element-wise addition with broadcasting.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, |a, b| a + b)
    }

    /// Element-wise subtraction with broadcasting.
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, |a, b| a - b)
    }

    /// Element-wise multiplication with broadcasting.
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, |a, b| a * b)
    }

    /// Element-wise division with broadcasting.
    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, |a, b| a / b)
    }

    pub fn neg(&self) -> Result<Tensor> {
        self.map(|a| -a)
    }

    pub fn sqrt(&self) -> Result<Tensor> {
        self.map(f32::sqrt)
    }

    pub fn exp(&self) -> Result<Tensor> {
        self.map(f32::exp)
    }

    pub fn add_scalar(&self, scalar: f32) -> Result<Tensor> {
        self.map(|a| a + scalar)
    }

    pub fn mul_scalar(&self, scalar: f32) -> Result<Tensor> {
        self.map(|a| a * scalar)
    }

    /// Apply `op` to every element (f32 only).
    pub fn map(&self, op: impl Fn(f32) -> f32) -> Result<Tensor> {
        let a = self.contiguous();
        let data = a
            .as_f32_slice()
            .ok_or(TgptError::UnsupportedDType(self.dtype()))?;
        let result: Vec<f32> = data.iter().map(|&v| op(v)).collect();
        Ok(Tensor::from_parts(result, a.dims()))
    }

    /// Matrix multiplication over the last two axes.
    ///
    /// - `[M, K] @ [K, N] -> [M, N]`
    /// - `[..., M, K] @ [..., K, N] -> [..., M, N]` with identical leading axes
    /// - `[..., M, K] @ [K, N] -> [..., M, N]` (right operand shared by every batch)
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        if self.dtype() != DType::F32 || other.dtype() != DType::F32 {
            return Err(TgptError::DTypeMismatch {
                expected: DType::F32,
                got: if self.dtype() != DType::F32 {
                    self.dtype()
                } else {
                    other.dtype()
                },
            });
        }
        let a_dims = self.dims();
        let b_dims = other.dims();
        if a_dims.len() < 2 || b_dims.len() < 2 {
            return Err(TgptError::ShapeMismatch {
                expected: a_dims.to_vec(),
                got: b_dims.to_vec(),
            });
        }

        let (m, k1) = (a_dims[a_dims.len() - 2], a_dims[a_dims.len() - 1]);
        let (k2, n) = (b_dims[b_dims.len() - 2], b_dims[b_dims.len() - 1]);
        if k1 != k2 {
            return Err(TgptError::MatmulDimMismatch { m, k1, k2, n });
        }

        let a_batch = &a_dims[..a_dims.len() - 2];
        let b_batch = &b_dims[..b_dims.len() - 2];
        let shared_rhs = b_batch.is_empty();
        if !shared_rhs && a_batch != b_batch {
            return Err(TgptError::ShapeMismatch {
                expected: a_dims.to_vec(),
                got: b_dims.to_vec(),
            });
        }
        let batch: usize = a_batch.iter().product();

        let a = self.contiguous();
        let b = other.contiguous();
        let a_data = a
            .as_f32_slice()
            .ok_or(TgptError::UnsupportedDType(a.dtype()))?;
        let b_data = b
            .as_f32_slice()
            .ok_or(TgptError::UnsupportedDType(b.dtype()))?;

        let mut out = vec![0.0f32; batch * m * n];
        let row_kernel = |(row, c_row): (usize, &mut [f32])| {
            let bi = row / m.max(1);
            let a_row = &a_data[row * k1..(row + 1) * k1];
            let b_off = if shared_rhs { 0 } else { bi * k1 * n };
            for (p, &a_val) in a_row.iter().enumerate() {
                let b_row = &b_data[b_off + p * n..b_off + (p + 1) * n];
                for (c, &b_val) in c_row.iter_mut().zip(b_row) {
                    *c += a_val * b_val;
                }
            }
        };
        if n > 0 {
            if batch * m >= PAR_ROWS {
                out.par_chunks_mut(n).enumerate().for_each(row_kernel);
            } else {
                out.chunks_mut(n).enumerate().for_each(row_kernel);
            }
        }

        let mut out_dims = a_batch.to_vec();
        out_dims.extend_from_slice(&[m, n]);
        Ok(Tensor::from_parts(out, &out_dims))
    }
}

/// Apply a binary operation element-wise with numpy broadcasting (f32 only).
fn binary_op(a: &Tensor, b: &Tensor, op: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
    if a.dtype() != DType::F32 || b.dtype() != DType::F32 {
        return Err(TgptError::DTypeMismatch {
            expected: a.dtype(),
            got: b.dtype(),
        });
    }

    let out_shape = a.shape().broadcast_with(b.shape()).ok_or_else(|| {
        TgptError::BroadcastError {
            a: a.dims().to_vec(),
            b: b.dims().to_vec(),
        }
    })?;

    let a = a.contiguous();
    let b = b.contiguous();
    let a_data = a
        .as_f32_slice()
        .ok_or(TgptError::UnsupportedDType(a.dtype()))?;
    let b_data = b
        .as_f32_slice()
        .ok_or(TgptError::UnsupportedDType(b.dtype()))?;

    if a.shape() == b.shape() {
        let result = a_data.iter().zip(b_data).map(|(&x, &y)| op(x, y)).collect();
        return Ok(Tensor::from_parts(result, out_shape.dims()));
    }

    let a_strides = broadcast_strides(a.shape(), &out_shape);
    let b_strides = broadcast_strides(b.shape(), &out_shape);
    let dims = out_shape.dims();
    let numel = out_shape.numel();

    let mut result = Vec::with_capacity(numel);
    let mut index = vec![0usize; dims.len()];
    let (mut ai, mut bi) = (0usize, 0usize);
    for _ in 0..numel {
        result.push(op(a_data[ai], b_data[bi]));
        for axis in (0..dims.len()).rev() {
            index[axis] += 1;
            ai += a_strides[axis];
            bi += b_strides[axis];
            if index[axis] < dims[axis] {
                break;
            }
            ai -= a_strides[axis] * dims[axis];
            bi -= b_strides[axis] * dims[axis];
            index[axis] = 0;
        }
    }

    Ok(Tensor::from_parts(result, dims))
}

/// Strides of `src` laid against the broadcast `out` shape; broadcast axes get 0.
fn broadcast_strides(src: &Shape, out: &Shape) -> SmallVec<[usize; 5]> {
    let src_strides = src.contiguous_strides();
    let lead = out.ndim() - src.ndim();
    (0..out.ndim())
        .map(|axis| {
            if axis < lead || src.dims()[axis - lead] == 1 {
                0
            } else {
                src_strides[axis - lead]
            }
        })
        .collect()
}
