//! Reductions: axis sums, means, argmax.

use rayon::prelude::*;

use crate::dtype::DType;
use crate::error::TgptError;
use crate::tensor::Tensor;
use crate::Result;

const PAR_THRESHOLD: usize = 8192;

impl Tensor {
    /// Sum along one axis, removing it.
    pub fn sum_axis(&self, axis: isize) -> Result<Tensor> {
        let axis = self.shape().normalize_axis(axis)?;
        let reduced = self.reduce_axes(&[axis], |acc, v| acc + v, 0.0)?;
        let mut out_dims = self.dims().to_vec();
        out_dims.remove(axis);
        reduced.reshape(&out_dims.iter().map(|&d| d as isize).collect::<Vec<_>>())
    }

    /// Mean over a set of axes, keeping them as size-1 axes so the result
    /// broadcasts back against `self`.
    pub fn mean_axes_keepdim(&self, axes: &[isize]) -> Result<Tensor> {
        let axes = axes
            .iter()
            .map(|&a| self.shape().normalize_axis(a))
            .collect::<Result<Vec<_>>>()?;
        let count: usize = axes.iter().map(|&a| self.dims()[a]).product();
        let summed = self.reduce_axes(&axes, |acc, v| acc + v, 0.0)?;
        summed.mul_scalar(1.0 / count.max(1) as f32)
    }

    /// Index of the first maximum along `axis`, returned as an i32 tensor with
    /// that axis removed.
    pub fn argmax(&self, axis: isize) -> Result<Tensor> {
        if self.dtype() != DType::F32 {
            return Err(TgptError::UnsupportedDType(self.dtype()));
        }
        let axis = self.shape().normalize_axis(axis)?;
        let data = self.contiguous();
        let dims = data.dims();
        let slice = data
            .as_f32_slice()
            .ok_or(TgptError::UnsupportedDType(self.dtype()))?;

        let axis_size = dims[axis];
        let outer: usize = dims[..axis].iter().product();
        let inner: usize = dims[axis + 1..].iter().product();

        let mut result = vec![0i32; outer * inner];
        let fill = |(o, row): (usize, &mut [i32])| {
            for (i, out) in row.iter_mut().enumerate() {
                let mut best_val = f32::NEG_INFINITY;
                let mut best_idx = 0usize;
                for k in 0..axis_size {
                    let v = slice[(o * axis_size + k) * inner + i];
                    if v > best_val {
                        best_val = v;
                        best_idx = k;
                    }
                }
                *out = best_idx as i32;
            }
        };
        if slice.len() >= PAR_THRESHOLD {
            result.par_chunks_mut(inner.max(1)).enumerate().for_each(&fill);
        } else {
            result.chunks_mut(inner.max(1)).enumerate().for_each(&fill);
        }

        let mut out_dims = dims.to_vec();
        out_dims.remove(axis);
        Ok(Tensor::from_i32(&result, &out_dims))
    }

    /// Fold every listed axis down to size 1.
    fn reduce_axes(&self, axes: &[usize], op: impl Fn(f32, f32) -> f32, init: f32) -> Result<Tensor> {
        let data = self.contiguous();
        let slice = data
            .as_f32_slice()
            .ok_or(TgptError::UnsupportedDType(self.dtype()))?;
        let dims = data.dims();

        let mut out_dims = dims.to_vec();
        for &a in axes {
            out_dims[a] = 1;
        }
        let out_strides = crate::Shape::new(&out_dims).contiguous_strides();
        let mut out = vec![init; out_dims.iter().product()];

        let mut index = vec![0usize; dims.len()];
        for &v in slice {
            let dst: usize = index
                .iter()
                .zip(&out_dims)
                .zip(out_strides.iter())
                .map(|((&i, &d), &s)| if d == 1 { 0 } else { i * s })
                .sum();
            out[dst] = op(out[dst], v);
            for axis in (0..dims.len()).rev() {
                index[axis] += 1;
                if index[axis] < dims[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }

        Ok(Tensor::from_parts(out, &out_dims))
    }
}
