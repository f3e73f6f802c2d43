//! Lockstep replication of batches across tensor-parallel replicas.
//!
//! Rank 0 builds every batch. Each iteration it broadcasts a fixed-size shape
//! descriptor, followers allocate matching buffers, then all payload buffers are
//! broadcast in a fixed field order. A barrier closes each phase. Any failure of a
//! collective is a desync and is fatal to the whole group.

use candle_core::Tensor;

use crate::lora::AdapterReadGuard;
use crate::pipeline::{ModelInputs, ModelOutputs};

mod descriptor;
mod error;
mod local;
mod sync;

pub use descriptor::{Control, InputField, OptionalFields, ShapeDescriptor};
pub use error::{DistributedError, Result};
pub use local::{LocalBackend, LocalFabric};
pub use sync::synchronize;

/// Where a buffer should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Host,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferDType {
    I32,
    F32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BufferData {
    I32(Vec<i32>),
    F32(Vec<f32>),
}

/// A flat, shaped buffer exchanged between replicas.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBuffer {
    shape: Vec<usize>,
    data: BufferData,
}

impl HostBuffer {
    pub fn from_i32(shape: &[usize], data: Vec<i32>) -> Result<Self> {
        Self::check_len(shape, data.len())?;
        Ok(Self {
            shape: shape.to_vec(),
            data: BufferData::I32(data),
        })
    }

    pub fn from_f32(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        Self::check_len(shape, data.len())?;
        Ok(Self {
            shape: shape.to_vec(),
            data: BufferData::F32(data),
        })
    }

    /// A one-dimensional i32 buffer.
    pub fn vec_i32(data: Vec<i32>) -> Self {
        Self {
            shape: vec![data.len()],
            data: BufferData::I32(data),
        }
    }

    pub fn zeros(dtype: BufferDType, shape: &[usize]) -> Self {
        let n = shape.iter().product();
        let data = match dtype {
            BufferDType::I32 => BufferData::I32(vec![0; n]),
            BufferDType::F32 => BufferData::F32(vec![0.; n]),
        };
        Self {
            shape: shape.to_vec(),
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dims1(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn dtype(&self) -> BufferDType {
        match self.data {
            BufferData::I32(_) => BufferDType::I32,
            BufferData::F32(_) => BufferDType::F32,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            BufferData::I32(v) => Some(v),
            BufferData::F32(_) => None,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            BufferData::F32(v) => Some(v),
            BufferData::I32(_) => None,
        }
    }

    /// Overwrite this buffer with `src`, which must have the same shape and dtype.
    pub fn copy_from(&mut self, src: &HostBuffer, what: &str) -> Result<()> {
        if self.shape != src.shape {
            return Err(DistributedError::ShapeMismatch {
                what: what.to_string(),
                expected: self.shape.clone(),
                actual: src.shape.clone(),
            });
        }
        match (&mut self.data, &src.data) {
            (BufferData::I32(dst), BufferData::I32(src)) => dst.copy_from_slice(src),
            (BufferData::F32(dst), BufferData::F32(src)) => dst.copy_from_slice(src),
            _ => {
                return Err(DistributedError::DTypeMismatch {
                    what: what.to_string(),
                })
            }
        }
        Ok(())
    }

    fn check_len(shape: &[usize], len: usize) -> Result<()> {
        let expected: usize = shape.iter().product();
        if expected != len {
            return Err(DistributedError::ShapeMismatch {
                what: "buffer data".to_string(),
                expected: shape.to_vec(),
                actual: vec![len],
            });
        }
        Ok(())
    }
}

/// Collective and compute primitives of one replica.
///
/// Implementations must make every rank observe the same outcome of a
/// collective: either all ranks succeed or all of them fail.
pub trait DeviceBackend: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn allocate_buffer(
        &self,
        dtype: BufferDType,
        shape: &[usize],
        kind: BufferKind,
    ) -> Result<HostBuffer>;

    /// Replace the contents of `buffers` on every rank with those of `root`.
    /// Buffers are matched by position.
    fn broadcast(&self, buffers: &mut [&mut HostBuffer], root: usize) -> Result<()>;

    fn barrier(&self) -> Result<()>;

    /// Concatenate every rank's `tensor` along `dim`, in rank order.
    fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor>;

    /// Run the model on this rank's shard. `adapters` is sorted by id.
    fn forward_pass(
        &self,
        inputs: &ModelInputs,
        adapters: &[AdapterReadGuard],
    ) -> candle_core::Result<ModelOutputs>;
}
