//! In-process replica group: one [`LocalBackend`] per rank, all sharing a
//! [`LocalFabric`]. Every collective is a rendezvous on a timed barrier; a rank
//! that times out poisons the fabric so that its peers fail fast instead of
//! waiting out their own timeouts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use candle_core::Tensor;
use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use super::{
    BufferDType, BufferKind, DeviceBackend, DistributedError, HostBuffer, Result,
};
use crate::lora::AdapterReadGuard;
use crate::pipeline::{ModelInputs, ModelOutputs, ShardedModel};

struct BarrierState {
    arrived: usize,
    generation: u64,
}

/// A reusable barrier whose waits are bounded.
struct TimedBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl TimedBarrier {
    fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            cvar: Condvar::new(),
        }
    }

    fn wait(&self, timeout: Duration, poisoned: &AtomicBool) -> Result<()> {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        while state.generation == generation {
            if poisoned.load(Ordering::Acquire) {
                state.arrived -= 1;
                return Err(DistributedError::Poisoned);
            }
            if self.cvar.wait_until(&mut state, deadline).timed_out()
                && state.generation == generation
            {
                state.arrived -= 1;
                return Err(DistributedError::Timeout {
                    op: "barrier",
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    fn wake_all(&self) {
        let _state = self.state.lock();
        self.cvar.notify_all();
    }
}

/// Shared state of an in-process replica group.
pub struct LocalFabric {
    world_size: usize,
    timeout: Duration,
    barrier: TimedBarrier,
    staged: Mutex<Vec<HostBuffer>>,
    gathered: Mutex<Vec<Option<Tensor>>>,
    poisoned: AtomicBool,
}

impl LocalFabric {
    /// `timeout` bounds every wait inside a collective.
    pub fn new(world_size: usize, timeout: Duration) -> Arc<Self> {
        let world_size = world_size.max(1);
        Arc::new(Self {
            world_size,
            timeout,
            barrier: TimedBarrier::new(world_size),
            staged: Mutex::new(Vec::new()),
            gathered: Mutex::new(vec![None; world_size]),
            poisoned: AtomicBool::new(false),
        })
    }

    /// One backend per rank, each running `model` on its own shard.
    pub fn backends(self: &Arc<Self>, model: Arc<dyn ShardedModel>) -> Vec<Arc<LocalBackend>> {
        (0..self.world_size)
            .map(|rank| {
                Arc::new(LocalBackend {
                    rank,
                    fabric: self.clone(),
                    model: model.clone(),
                })
            })
            .collect()
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Fail every current and future collective on this fabric.
    pub fn poison(&self) {
        if !self.poisoned.swap(true, Ordering::AcqRel) {
            error!("Replica group poisoned.");
        }
        self.barrier.wake_all();
    }

    fn wait(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(DistributedError::Poisoned);
        }
        self.barrier.wait(self.timeout, &self.poisoned)
    }

    /// Run one collective, poisoning the group if this rank fails it.
    fn collective<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let out = f();
        if let Err(e) = &out {
            if *e != DistributedError::Poisoned {
                error!("Collective failed: {e}");
            }
            self.poison();
        }
        out
    }
}

/// One rank of a [`LocalFabric`].
pub struct LocalBackend {
    rank: usize,
    fabric: Arc<LocalFabric>,
    model: Arc<dyn ShardedModel>,
}

impl LocalBackend {
    pub fn fabric(&self) -> &Arc<LocalFabric> {
        &self.fabric
    }
}

impl DeviceBackend for LocalBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.fabric.world_size
    }

    fn allocate_buffer(
        &self,
        dtype: BufferDType,
        shape: &[usize],
        _kind: BufferKind,
    ) -> Result<HostBuffer> {
        Ok(HostBuffer::zeros(dtype, shape))
    }

    fn broadcast(&self, buffers: &mut [&mut HostBuffer], root: usize) -> Result<()> {
        let fabric = &self.fabric;
        if root >= fabric.world_size {
            return Err(DistributedError::InvalidRank {
                rank: root,
                world_size: fabric.world_size,
            });
        }
        fabric.collective(|| {
            if self.rank == root {
                *fabric.staged.lock() = buffers.iter().map(|b| (**b).clone()).collect();
            }
            fabric.wait()?;
            if self.rank != root {
                let staged = fabric.staged.lock();
                if staged.len() != buffers.len() {
                    return Err(DistributedError::BufferCount {
                        expected: buffers.len(),
                        actual: staged.len(),
                    });
                }
                for (i, (dst, src)) in buffers.iter_mut().zip(staged.iter()).enumerate() {
                    dst.copy_from(src, &format!("broadcast buffer {i}"))?;
                }
            }
            fabric.wait()?;
            trace!("Rank {} finished broadcast of {} buffers", self.rank, buffers.len());
            Ok(())
        })
    }

    fn barrier(&self) -> Result<()> {
        self.fabric.collective(|| self.fabric.wait())
    }

    fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor> {
        let fabric = &self.fabric;
        if fabric.world_size == 1 {
            return Ok(tensor.clone());
        }
        fabric.collective(|| {
            fabric.gathered.lock()[self.rank] = Some(tensor.clone());
            fabric.wait()?;
            let parts = fabric
                .gathered
                .lock()
                .iter()
                .cloned()
                .collect::<Option<Vec<Tensor>>>()
                .ok_or(DistributedError::Poisoned)?;
            fabric.wait()?;
            Ok(Tensor::cat(&parts, dim)?)
        })
    }

    fn forward_pass(
        &self,
        inputs: &ModelInputs,
        adapters: &[AdapterReadGuard],
    ) -> candle_core::Result<ModelOutputs> {
        self.model
            .forward(inputs, adapters, self.rank, self.fabric.world_size)
    }
}
