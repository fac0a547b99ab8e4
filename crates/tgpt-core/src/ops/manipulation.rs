//! Tensor manipulation: cat, split, row gather, softmax.

use crate::dtype::DType;
use crate::error::TgptError;
use crate::tensor::Tensor;
use crate::Result;

impl Tensor {
    /// Concatenate tensors along `axis`.
    ///
    /// All tensors must agree on every other axis.
    pub fn cat(tensors: &[&Tensor], axis: isize) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| TgptError::StorageError("cat: empty tensor list".into()))?;
        let axis = first.shape().normalize_axis(axis)?;
        let ndim = first.ndim();

        for t in &tensors[1..] {
            let compatible = t.ndim() == ndim
                && (0..ndim).all(|d| d == axis || t.dims()[d] == first.dims()[d]);
            if !compatible {
                return Err(TgptError::ShapeMismatch {
                    expected: first.dims().to_vec(),
                    got: t.dims().to_vec(),
                });
            }
        }

        let mut out_shape = first.dims().to_vec();
        let cat_dim: usize = tensors.iter().map(|t| t.dims()[axis]).sum();
        out_shape[axis] = cat_dim;

        let outer: usize = out_shape[..axis].iter().product();
        let inner: usize = out_shape[axis + 1..].iter().product();
        let mut result = vec![0.0f32; out_shape.iter().product()];

        let mut cat_offset = 0;
        for t in tensors {
            let t_cont = t.contiguous();
            let t_data = t_cont
                .as_f32_slice()
                .ok_or(TgptError::UnsupportedDType(t.dtype()))?;
            let t_axis = t.dims()[axis];
            for o in 0..outer {
                let src = o * t_axis * inner;
                let dst = (o * cat_dim + cat_offset) * inner;
                result[dst..dst + t_axis * inner].copy_from_slice(&t_data[src..src + t_axis * inner]);
            }
            cat_offset += t_axis;
        }

        Ok(Tensor::from_parts(result, &out_shape))
    }

    /// Split into `parts` equal pieces along `axis`.
    pub fn split_equal(&self, parts: usize, axis: isize) -> Result<Vec<Tensor>> {
        let axis = self.shape().normalize_axis(axis)?;
        let dim = self.dims()[axis];
        if parts == 0 || dim % parts != 0 {
            return Err(TgptError::DimensionMismatch { dim, heads: parts });
        }
        let size = dim / parts;
        (0..parts)
            .map(|p| self.narrow(axis as isize, p * size, size).map(|v| v.contiguous()))
            .collect()
    }

    /// Gather rows of a 2-D table: `[V, D]` indexed by `ids` gives `[ids.len(), D]`.
    pub fn index_select_rows(&self, ids: &[usize]) -> Result<Tensor> {
        if self.ndim() != 2 {
            return Err(TgptError::ShapeMismatch {
                expected: vec![0, 0],
                got: self.dims().to_vec(),
            });
        }
        let (rows, width) = (self.dims()[0], self.dims()[1]);
        let table = self.contiguous();
        let data = table
            .as_f32_slice()
            .ok_or(TgptError::UnsupportedDType(self.dtype()))?;

        let mut out = Vec::with_capacity(ids.len() * width);
        for &id in ids {
            if id >= rows {
                return Err(TgptError::IndexOutOfRange {
                    index: id as i64,
                    size: rows,
                });
            }
            out.extend_from_slice(&data[id * width..(id + 1) * width]);
        }
        Ok(Tensor::from_parts(out, &[ids.len(), width]))
    }

    /// Numerically stable softmax along `axis`.
    pub fn softmax(&self, axis: isize) -> Result<Tensor> {
        if self.dtype() != DType::F32 {
            return Err(TgptError::UnsupportedDType(self.dtype()));
        }
        let axis = self.shape().normalize_axis(axis)?;
        let data = self.contiguous();
        let mut result = data
            .as_f32_slice()
            .ok_or(TgptError::UnsupportedDType(self.dtype()))?
            .to_vec();

        let dims = self.dims();
        let outer: usize = dims[..axis].iter().product();
        let axis_size = dims[axis];
        let inner: usize = dims[axis + 1..].iter().product();

        for o in 0..outer {
            for i in 0..inner {
                let at = |a: usize| (o * axis_size + a) * inner + i;
                let max_val = (0..axis_size)
                    .map(|a| result[at(a)])
                    .fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0f32;
                for a in 0..axis_size {
                    let e = (result[at(a)] - max_val).exp();
                    result[at(a)] = e;
                    sum += e;
                }
                if sum > 0.0 {
                    for a in 0..axis_size {
                        result[at(a)] /= sum;
                    }
                }
            }
        }

        Ok(Tensor::from_parts(result, dims))
    }
}
