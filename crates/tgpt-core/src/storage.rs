use std::sync::Arc;

use crate::DType;

/// Typed element buffer behind a [`Storage`].
#[derive(Debug, Clone)]
enum StorageData {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

/// Shared, reference-counted tensor storage.
///
/// Views produced by reshape or permute clone the `Arc`, never the data.
#[derive(Debug, Clone)]
pub struct Storage {
    data: Arc<StorageData>,
}

impl Storage {
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        let data = match dtype {
            DType::F32 => StorageData::F32(vec![0.0; numel]),
            DType::I32 => StorageData::I32(vec![0; numel]),
        };
        Self {
            data: Arc::new(data),
        }
    }

    pub fn from_f32_vec(data: Vec<f32>) -> Self {
        Self {
            data: Arc::new(StorageData::F32(data)),
        }
    }

    pub fn from_i32_vec(data: Vec<i32>) -> Self {
        Self {
            data: Arc::new(StorageData::I32(data)),
        }
    }

    pub fn dtype(&self) -> DType {
        match self.data.as_ref() {
            StorageData::F32(_) => DType::F32,
            StorageData::I32(_) => DType::I32,
        }
    }

    pub fn numel(&self) -> usize {
        match self.data.as_ref() {
            StorageData::F32(v) => v.len(),
            StorageData::I32(v) => v.len(),
        }
    }

    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        match self.data.as_ref() {
            StorageData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32_slice(&self) -> Option<&[i32]> {
        match self.data.as_ref() {
            StorageData::I32(v) => Some(v),
            _ => None,
        }
    }

    /// Whether two storages point at the same buffer.
    pub fn ptr_eq(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}
