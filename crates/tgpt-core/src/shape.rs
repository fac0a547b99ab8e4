use smallvec::SmallVec;
use std::fmt;

use crate::error::TgptError;
use crate::Result;

/// Tensor shape with inline storage for up to five dimensions.
///
/// Attention intermediates are at most `[batch, heads, seq, seq]` or
/// `[batch, seq, heads, head_dim]`, so the inline capacity covers every tensor
/// the model produces.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: SmallVec<[usize; 5]>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    pub fn scalar() -> Self {
        Self {
            dims: SmallVec::new(),
        }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements; a scalar holds one.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    /// Size of the trailing axis, if any.
    pub fn last_dim(&self) -> Option<usize> {
        self.dims.last().copied()
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Resolve a possibly negative axis against this rank.
    pub fn normalize_axis(&self, axis: isize) -> Result<usize> {
        let ndim = self.ndim() as isize;
        let resolved = if axis < 0 { ndim + axis } else { axis };
        if resolved < 0 || resolved >= ndim {
            return Err(TgptError::InvalidAxis {
                axis,
                ndim: self.ndim(),
            });
        }
        Ok(resolved as usize)
    }

    /// Row-major strides for a contiguous layout.
    pub fn contiguous_strides(&self) -> SmallVec<[usize; 5]> {
        let ndim = self.dims.len();
        let mut strides = SmallVec::from_elem(1usize, ndim);
        for i in (0..ndim.saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Numpy-style broadcast of two shapes, or `None` if incompatible.
    pub fn broadcast_with(&self, other: &Shape) -> Option<Shape> {
        let max_ndim = self.ndim().max(other.ndim());
        let mut result = SmallVec::with_capacity(max_ndim);

        for i in 0..max_ndim {
            let a = if i < self.ndim() {
                self.dims[self.ndim() - 1 - i]
            } else {
                1
            };
            let b = if i < other.ndim() {
                other.dims[other.ndim() - 1 - i]
            } else {
                1
            };

            match (a, b) {
                (a, b) if a == b => result.push(a),
                (1, b) => result.push(b),
                (a, 1) => result.push(a),
                _ => return None,
            }
        }

        result.reverse();
        Some(Shape { dims: result })
    }

    /// Resolve a reshape target where at most one entry may be `-1`.
    pub fn resolve_reshape(&self, target: &[isize]) -> Option<Shape> {
        let numel = self.numel();
        let mut inferred_idx = None;
        let mut known_product: usize = 1;

        for (i, &d) in target.iter().enumerate() {
            if d == -1 {
                if inferred_idx.replace(i).is_some() {
                    return None;
                }
            } else if d < 0 {
                return None;
            } else {
                known_product = known_product.checked_mul(d as usize)?;
            }
        }

        let mut dims: SmallVec<[usize; 5]> = target
            .iter()
            .map(|&d| if d == -1 { 0 } else { d as usize })
            .collect();

        if let Some(idx) = inferred_idx {
            if known_product == 0 || numel % known_product != 0 {
                return None;
            }
            dims[idx] = numel / known_product;
        }

        let resolved = Shape { dims };
        (resolved.numel() == numel).then_some(resolved)
    }

    /// Shape after reordering axes; `order` must be a permutation of `0..ndim`.
    pub fn permute(&self, order: &[usize]) -> Option<Shape> {
        if order.len() != self.ndim() {
            return None;
        }
        let mut seen = vec![false; order.len()];
        for &axis in order {
            if axis >= order.len() || std::mem::replace(&mut seen[axis], true) {
                return None;
            }
        }
        Some(Shape {
            dims: order.iter().map(|&axis| self.dims[axis]).collect(),
        })
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape {
            dims: SmallVec::from_vec(dims),
        }
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(&dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar() {
        let s = Shape::scalar();
        assert_eq!(s.ndim(), 0);
        assert_eq!(s.numel(), 1);
        assert!(s.is_scalar());
    }

    #[test]
    fn test_contiguous_strides() {
        let s = Shape::new(&[2, 3, 4]);
        assert_eq!(s.contiguous_strides().as_slice(), &[12, 4, 1]);
    }

    #[test]
    fn test_normalize_axis() {
        let s = Shape::new(&[2, 3, 4]);
        assert_eq!(s.normalize_axis(-1).unwrap(), 2);
        assert_eq!(s.normalize_axis(0).unwrap(), 0);
        assert!(s.normalize_axis(3).is_err());
        assert!(s.normalize_axis(-4).is_err());
    }

    #[test]
    fn test_broadcast() {
        let c = Shape::new(&[3, 1]).broadcast_with(&Shape::new(&[1, 4])).unwrap();
        assert_eq!(c.dims(), &[3, 4]);

        let c = Shape::new(&[2, 5, 3]).broadcast_with(&Shape::new(&[3])).unwrap();
        assert_eq!(c.dims(), &[2, 5, 3]);

        assert!(Shape::new(&[2, 3]).broadcast_with(&Shape::new(&[4, 3])).is_none());
    }

    #[test]
    fn test_reshape() {
        let s = Shape::new(&[2, 3, 4]);
        assert_eq!(s.resolve_reshape(&[-1, 4]).unwrap().dims(), &[6, 4]);
        assert_eq!(s.resolve_reshape(&[2, -1]).unwrap().dims(), &[2, 12]);
        assert!(s.resolve_reshape(&[-1, -1]).is_none());
        assert!(s.resolve_reshape(&[5, 5]).is_none());
    }

    #[test]
    fn test_permute() {
        let s = Shape::new(&[2, 7, 4, 3]);
        assert_eq!(s.permute(&[0, 2, 1, 3]).unwrap().dims(), &[2, 4, 7, 3]);
        assert!(s.permute(&[0, 0, 1, 2]).is_none());
        assert!(s.permute(&[0, 1]).is_none());
    }
}
