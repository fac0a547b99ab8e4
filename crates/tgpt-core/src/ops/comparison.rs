//! Comparison operations.

use crate::dtype::DType;
use crate::error::TgptError;
use crate::tensor::Tensor;
use crate::Result;

impl Tensor {
    /// 1.0 where the element equals `value`, else 0.0. Works on id tensors
    /// (i32) and on f32 tensors holding integral values.
    pub fn eq_scalar(&self, value: i32) -> Result<Tensor> {
        let c = self.contiguous();
        let mask: Vec<f32> = match self.dtype() {
            DType::I32 => c
                .as_i32_slice()
                .ok_or(TgptError::UnsupportedDType(DType::I32))?
                .iter()
                .map(|&v| if v == value { 1.0 } else { 0.0 })
                .collect(),
            DType::F32 => c
                .as_f32_slice()
                .ok_or(TgptError::UnsupportedDType(DType::F32))?
                .iter()
                .map(|&v| if v == value as f32 { 1.0 } else { 0.0 })
                .collect(),
        };
        Ok(Tensor::from_parts(mask, self.dims()))
    }
}
