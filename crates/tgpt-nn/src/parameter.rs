//! Learned parameters as shared, lockable tensor handles.

use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tgpt_core::{DType, Result, Tensor, TgptError};

/// Initializer for a freshly created parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    /// `N(0, std²)`
    Normal { std: f32 },
}

impl Init {
    /// The default weight initializer, `N(0, 0.02²)`.
    pub const WEIGHT: Init = Init::Normal { std: 0.02 };

    pub fn build<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> Tensor {
        match *self {
            Init::Zeros => Tensor::zeros(shape, DType::F32),
            Init::Ones => Tensor::ones(shape),
            Init::Normal { std } => Tensor::randn_with(shape, 0.0, std, rng),
        }
    }
}

/// RNG for parameter initialization: seeded when a seed is given, otherwise
/// seeded from the thread-local generator.
pub fn init_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::seed_from_u64(rand::thread_rng().gen()),
    }
}

/// A named, shaped tensor owned by a layer.
///
/// Cloning a `Parameter` clones the handle, not the data: both handles see
/// every later [`Parameter::set`]. That is how the LM head shares the
/// embedding table. The shape is fixed at creation.
#[derive(Clone)]
pub struct Parameter {
    name: Arc<str>,
    value: Arc<RwLock<Tensor>>,
    trainable: bool,
}

impl Parameter {
    pub fn new(name: impl Into<Arc<str>>, value: Tensor, trainable: bool) -> Self {
        Self {
            name: name.into(),
            value: Arc::new(RwLock::new(value)),
            trainable,
        }
    }

    /// Create and initialize a parameter of the given shape.
    pub fn init<R: Rng + ?Sized>(
        name: impl Into<Arc<str>>,
        shape: &[usize],
        init: Init,
        trainable: bool,
        rng: &mut R,
    ) -> Self {
        Self::new(name, init.build(shape, rng), trainable)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn dims(&self) -> Vec<usize> {
        self.value.read().dims().to_vec()
    }

    pub fn numel(&self) -> usize {
        self.value.read().numel()
    }

    /// Snapshot of the current value. Cheap: storage is reference counted.
    pub fn value(&self) -> Tensor {
        self.value.read().clone()
    }

    /// Borrow the current value under a read lock.
    pub fn read(&self) -> RwLockReadGuard<'_, Tensor> {
        self.value.read()
    }

    /// Replace the value. The new tensor must have the same shape.
    pub fn set(&self, value: Tensor) -> Result<()> {
        let mut slot = self.value.write();
        if slot.dims() != value.dims() {
            return Err(TgptError::ShapeMismatch {
                expected: slot.dims().to_vec(),
                got: value.dims().to_vec(),
            });
        }
        *slot = value;
        Ok(())
    }

    /// Whether both handles refer to the same parameter.
    pub fn is_tied_to(&self, other: &Parameter) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parameter({}, shape={:?}, trainable={})",
            self.name,
            self.dims(),
            self.trainable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_value() {
        let p = Parameter::new("w", Tensor::zeros(&[2, 2], DType::F32), true);
        let tied = p.clone();
        p.set(Tensor::ones(&[2, 2])).unwrap();
        assert_eq!(tied.value().as_f32_slice().unwrap(), &[1.0; 4]);
        assert!(tied.is_tied_to(&p));
    }

    #[test]
    fn test_set_rejects_new_shape() {
        let p = Parameter::new("w", Tensor::zeros(&[2, 2], DType::F32), true);
        assert!(matches!(
            p.set(Tensor::ones(&[4])),
            Err(TgptError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_seeded_init_is_reproducible() {
        let a = Parameter::init("w", &[8], Init::WEIGHT, true, &mut init_rng(Some(3)));
        let b = Parameter::init("w", &[8], Init::WEIGHT, true, &mut init_rng(Some(3)));
        assert_eq!(a.value().as_f32_slice(), b.value().as_f32_slice());
        assert!(!a.is_tied_to(&b));
    }
}
