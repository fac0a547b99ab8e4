use std::fmt;

use rand::Rng;
use smallvec::SmallVec;

use crate::dtype::DType;
use crate::error::TgptError;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::Result;

/// A dense, row-major, multi-dimensional array.
///
/// Storage is reference counted: `reshape`, `permute`, `transpose` and
/// `narrow` return views that share it, and `contiguous()` materializes a
/// view into a fresh buffer when a kernel needs flat data.
///
/// # Examples
///
/// ```
/// use tgpt_core::Tensor;
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
/// let t2 = t.transpose().unwrap();
/// assert_eq!(t2.dims(), &[3, 2]);
/// assert_eq!(t2.contiguous().as_f32_slice().unwrap(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    strides: SmallVec<[usize; 5]>,
    offset: usize,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a tensor from f32 data with the given shape.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape. Use [`Tensor::from_vec`]
    /// for a fallible version.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self::from_storage(Storage::from_f32_vec(data.to_vec()), s)
    }

    /// Create an i32 tensor (token and position ids).
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape.
    pub fn from_i32(data: &[i32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(s.numel(), data.len(), "shape {:?} mismatch", shape);
        Self::from_storage(Storage::from_i32_vec(data.to_vec()), s)
    }

    /// Take ownership of an f32 buffer.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(TgptError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Self::from_storage(Storage::from_f32_vec(data), s))
    }

    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let s = Shape::new(shape);
        Self::from_storage(Storage::zeros(dtype, s.numel()), s)
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    /// Tensor filled with a constant.
    pub fn full(shape: &[usize], value: f32) -> Self {
        let s = Shape::new(shape);
        Self::from_storage(Storage::from_f32_vec(vec![value; s.numel()]), s)
    }

    /// Standard normal samples from the thread-local RNG.
    pub fn randn(shape: &[usize]) -> Self {
        Self::randn_with(shape, 0.0, 1.0, &mut rand::thread_rng())
    }

    /// Normal samples `N(mean, std²)` drawn from `rng` (Box-Muller).
    pub fn randn_with<R: Rng + ?Sized>(shape: &[usize], mean: f32, std: f32, rng: &mut R) -> Self {
        let s = Shape::new(shape);
        let data: Vec<f32> = (0..s.numel())
            .map(|_| mean + std * standard_normal(rng))
            .collect();
        Self::from_storage(Storage::from_f32_vec(data), s)
    }

    pub(crate) fn from_storage(storage: Storage, shape: Shape) -> Self {
        let strides = shape.contiguous_strides();
        Self {
            storage,
            shape,
            strides,
            offset: 0,
        }
    }

    /// Wrap a freshly computed f32 buffer whose length already matches `shape`.
    pub(crate) fn from_parts(data: Vec<f32>, shape: &[usize]) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Self::from_storage(Storage::from_f32_vec(data), Shape::new(shape))
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Dimensions as a plain slice.
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    /// Strides in elements.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Whether both tensors are views of the same buffer.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        self.storage.ptr_eq(&other.storage)
    }

    pub fn is_contiguous(&self) -> bool {
        self.offset == 0
            && self.strides == self.shape.contiguous_strides()
            && self.storage.numel() == self.numel()
    }

    // =========================================================================
    // Data access
    // =========================================================================

    /// Flat f32 data (contiguous tensors only).
    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        if !self.is_contiguous() {
            return None;
        }
        self.storage.as_f32_slice()
    }

    pub fn as_i32_slice(&self) -> Option<&[i32]> {
        if !self.is_contiguous() {
            return None;
        }
        self.storage.as_i32_slice()
    }

    /// Single f32 element by logical (row-major) index.
    pub fn get_f32(&self, flat_index: usize) -> Option<f32> {
        let slice = self.storage.as_f32_slice()?;
        let physical = self.flat_to_physical(flat_index)?;
        slice.get(physical).copied()
    }

    /// Copy of the data in logical order.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let c = self.contiguous();
        c.as_f32_slice()
            .map(<[f32]>::to_vec)
            .ok_or(TgptError::UnsupportedDType(self.dtype()))
    }

    /// Interpret the elements as non-negative indices (ids may be stored as
    /// i32 or as integral f32 values).
    pub fn to_index_vec(&self) -> Result<Vec<usize>> {
        let c = self.contiguous();
        let raw: Vec<i64> = match self.dtype() {
            DType::I32 => c
                .as_i32_slice()
                .ok_or(TgptError::UnsupportedDType(DType::I32))?
                .iter()
                .map(|&v| v as i64)
                .collect(),
            DType::F32 => c
                .as_f32_slice()
                .ok_or(TgptError::UnsupportedDType(DType::F32))?
                .iter()
                .map(|&v| {
                    if v.is_finite() && v.fract() == 0.0 {
                        Ok(v as i64)
                    } else {
                        Err(TgptError::NonIntegralIndex(v))
                    }
                })
                .collect::<Result<_>>()?,
        };
        raw.into_iter()
            .map(|v| {
                usize::try_from(v).map_err(|_| TgptError::IndexOutOfRange {
                    index: v,
                    size: 0,
                })
            })
            .collect()
    }

    fn flat_to_physical(&self, flat_index: usize) -> Option<usize> {
        if flat_index >= self.numel() {
            return None;
        }
        let mut remaining = flat_index;
        let mut physical = self.offset;
        for axis in (0..self.ndim()).rev() {
            let dim = self.shape.dims()[axis];
            physical += (remaining % dim) * self.strides[axis];
            remaining /= dim;
        }
        Some(physical)
    }

    /// Physical storage indices of every element, in logical order.
    fn physical_indices(&self) -> Vec<usize> {
        let dims = self.shape.dims();
        let numel = self.numel();
        let mut out = Vec::with_capacity(numel);
        if numel == 0 {
            return out;
        }
        let mut index = vec![0usize; dims.len()];
        let mut physical = self.offset;
        for _ in 0..numel {
            out.push(physical);
            for axis in (0..dims.len()).rev() {
                index[axis] += 1;
                physical += self.strides[axis];
                if index[axis] < dims[axis] {
                    break;
                }
                physical -= self.strides[axis] * dims[axis];
                index[axis] = 0;
            }
        }
        out
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// Reshape a contiguous tensor (zero-copy). One entry may be `-1`.
    pub fn reshape(&self, new_shape: &[isize]) -> Result<Tensor> {
        let resolved = self.shape.resolve_reshape(new_shape).ok_or_else(|| {
            TgptError::InvalidReshape {
                numel: self.numel(),
                shape: new_shape.to_vec(),
            }
        })?;

        let base = self.contiguous();
        let strides = resolved.contiguous_strides();
        Ok(Tensor {
            storage: base.storage,
            shape: resolved,
            strides,
            offset: 0,
        })
    }

    /// Reorder axes (zero-copy view).
    pub fn permute(&self, order: &[usize]) -> Result<Tensor> {
        let shape = self.shape.permute(order).ok_or_else(|| TgptError::ShapeMismatch {
            expected: (0..self.ndim()).collect(),
            got: order.to_vec(),
        })?;
        Ok(Tensor {
            storage: self.storage.clone(),
            shape,
            strides: order.iter().map(|&axis| self.strides[axis]).collect(),
            offset: self.offset,
        })
    }

    /// Swap the last two axes (zero-copy view).
    pub fn transpose(&self) -> Result<Tensor> {
        let ndim = self.ndim();
        if ndim < 2 {
            return Err(TgptError::InvalidAxis { axis: -2, ndim });
        }
        let mut order: Vec<usize> = (0..ndim).collect();
        order.swap(ndim - 2, ndim - 1);
        self.permute(&order)
    }

    /// Restrict `axis` to `start..start + len` (zero-copy view).
    pub fn narrow(&self, axis: isize, start: usize, len: usize) -> Result<Tensor> {
        let axis = self.shape.normalize_axis(axis)?;
        let size = self.dims()[axis];
        if start + len > size {
            return Err(TgptError::IndexOutOfRange {
                index: (start + len) as i64,
                size,
            });
        }
        let mut dims = self.dims().to_vec();
        dims[axis] = len;
        Ok(Tensor {
            storage: self.storage.clone(),
            shape: Shape::from(dims),
            strides: self.strides.clone(),
            offset: self.offset + start * self.strides[axis],
        })
    }

    /// Contiguous copy of a view; a contiguous tensor is returned as-is.
    pub fn contiguous(&self) -> Tensor {
        if self.is_contiguous() {
            return self.clone();
        }
        let indices = self.physical_indices();
        let storage = match self.dtype() {
            DType::F32 => {
                let src = self.storage.as_f32_slice().unwrap_or_default();
                Storage::from_f32_vec(indices.iter().map(|&i| src[i]).collect())
            }
            DType::I32 => {
                let src = self.storage.as_i32_slice().unwrap_or_default();
                Storage::from_i32_vec(indices.iter().map(|&i| src[i]).collect())
            }
        };
        Tensor::from_storage(storage, self.shape.clone())
    }
}

/// One `N(0, 1)` sample via Box-Muller.
pub fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    let u1: f32 = rng.gen_range(1e-7f32..1.0f32);
    let u2: f32 = rng.gen_range(0.0f32..std::f32::consts::TAU);
    (-2.0 * u1.ln()).sqrt() * u2.cos()
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, contiguous={})",
            self.shape,
            self.dtype(),
            self.is_contiguous(),
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.contiguous();
        match (c.as_f32_slice(), c.as_i32_slice()) {
            (Some(data), _) if data.len() <= 20 => {
                write!(f, "tensor({:?}, shape={})", data, self.shape)
            }
            (Some(data), _) if !data.is_empty() => write!(
                f,
                "tensor([{:.4}, {:.4}, ..., {:.4}], shape={})",
                data[0],
                data[1],
                data[data.len() - 1],
                self.shape
            ),
            (_, Some(data)) if data.len() <= 20 => {
                write!(f, "tensor({:?}, shape={})", data, self.shape)
            }
            _ => write!(f, "tensor(shape={}, dtype={})", self.shape, self.dtype()),
        }
    }
}
