//! Registry of adapter deltas with per-adapter reader/writer exclusion.
//!
//! The map from id to slot has its own lock, held only to look up, create or
//! unlink a slot. Each slot carries an independent `RwLock`: forward passes hold
//! it shared for the duration of the pass, `add`/`remove` hold it exclusively.
//! Mutating adapter X therefore waits for readers of X only.
//!
//! Writers never queue on a slot, so a pending mutation does not stall new
//! readers: once one replica of a batch holds an adapter, the others must be
//! able to acquire it too. The price is that a writer can starve while readers
//! of the same id keep overlapping. A registry built with
//! [`AdapterRegistry::with_write_timeout`] gives up after the timeout and
//! reports [`AdapterError::Busy`]; the default waits as long as it takes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock, RwLock,
};
use thiserror::Error;
use tracing::info;

use super::{AdapterId, AdapterWeights};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("adapter {0} is not registered")]
    NotFound(AdapterId),

    #[error("adapter {0} is held by an in-flight forward pass")]
    Busy(AdapterId),

    #[error("adapter {id} has mismatched factors: {reason}")]
    Mismatched { id: AdapterId, reason: String },
}

struct AdapterSlot {
    /// Cleared once the slot is unlinked from the map; writers that raced the
    /// unlink must retry against the fresh slot.
    alive: bool,
    version: u64,
    weights: Option<Arc<AdapterWeights>>,
}

type SlotLock = Arc<RwLock<AdapterSlot>>;
type SlotWriteGuard = ArcRwLockWriteGuard<RawRwLock, AdapterSlot>;

const WRITE_RETRY: Duration = Duration::from_micros(200);

/// Exclusive access to a slot once its readers are gone, or `None` once
/// `timeout` has passed.
fn write_slot(slot: &SlotLock, timeout: Option<Duration>) -> Option<SlotWriteGuard> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if let Some(guard) = slot.try_write_arc() {
            return Some(guard);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return None;
        }
        std::thread::sleep(WRITE_RETRY);
    }
}

/// Shared access to one adapter, released on drop.
pub struct AdapterReadGuard {
    id: AdapterId,
    version: u64,
    weights: Arc<AdapterWeights>,
    _lock: ArcRwLockReadGuard<RawRwLock, AdapterSlot>,
}

impl AdapterReadGuard {
    pub fn id(&self) -> AdapterId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn weights(&self) -> &AdapterWeights {
        &self.weights
    }
}

impl std::fmt::Debug for AdapterReadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterReadGuard")
            .field("id", &self.id)
            .field("version", &self.version)
            .finish()
    }
}

#[derive(Default)]
pub struct AdapterRegistry {
    slots: RwLock<HashMap<AdapterId, SlotLock>>,
    versions: AtomicU64,
    write_timeout: Option<Duration>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry whose `add` and `remove` fail with [`AdapterError::Busy`]
    /// when readers of the id hold it longer than `timeout`.
    pub fn with_write_timeout(timeout: Duration) -> Self {
        Self {
            write_timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Register `weights` under `id`, atomically replacing any previous set.
    /// Waits for in-flight readers of the same id, up to the write timeout if
    /// one is set. Returns the new version.
    pub fn add(&self, id: AdapterId, weights: AdapterWeights) -> Result<u64, AdapterError> {
        weights
            .check_shape()
            .map_err(|reason| AdapterError::Mismatched { id, reason })?;
        let weights = Arc::new(weights);
        loop {
            let slot = {
                let mut slots = self.slots.write();
                slots
                    .entry(id)
                    .or_insert_with(|| {
                        Arc::new(RwLock::new(AdapterSlot {
                            alive: true,
                            version: 0,
                            weights: None,
                        }))
                    })
                    .clone()
            };
            let mut guard =
                write_slot(&slot, self.write_timeout).ok_or(AdapterError::Busy(id))?;
            if !guard.alive {
                // A concurrent remove is about to unlink this slot.
                drop(guard);
                std::thread::yield_now();
                continue;
            }
            let version = self.versions.fetch_add(1, Ordering::Relaxed) + 1;
            let replaced = guard.weights.replace(weights.clone()).is_some();
            guard.version = version;
            if replaced {
                info!("Replaced adapter {id} (version {version}).");
            } else {
                info!("Registered adapter {id} (version {version}).");
            }
            return Ok(version);
        }
    }

    /// Unregister `id`, waiting for in-flight readers. Unknown ids are a no-op.
    /// Returns whether an adapter was removed.
    pub fn remove(&self, id: AdapterId) -> Result<bool, AdapterError> {
        let Some(slot) = self.slot(id) else {
            return Ok(false);
        };
        let guard = write_slot(&slot, self.write_timeout).ok_or(AdapterError::Busy(id))?;
        Ok(self.retire(id, &slot, guard))
    }

    /// Like [`AdapterRegistry::remove`], but fails with [`AdapterError::Busy`]
    /// instead of waiting for readers.
    pub fn try_remove(&self, id: AdapterId) -> Result<bool, AdapterError> {
        let Some(slot) = self.slot(id) else {
            return Ok(false);
        };
        let guard = slot.try_write_arc().ok_or(AdapterError::Busy(id))?;
        Ok(self.retire(id, &slot, guard))
    }

    /// Take shared access to `id` for the duration of a forward pass.
    pub fn acquire_read(&self, id: AdapterId) -> Result<AdapterReadGuard, AdapterError> {
        let slot = self.slot(id).ok_or(AdapterError::NotFound(id))?;
        let lock = slot.read_arc();
        let weights = match (&lock.weights, lock.alive) {
            (Some(weights), true) => weights.clone(),
            _ => return Err(AdapterError::NotFound(id)),
        };
        Ok(AdapterReadGuard {
            id,
            version: lock.version,
            weights,
            _lock: lock,
        })
    }

    pub fn contains(&self, id: AdapterId) -> bool {
        self.slot(id)
            .is_some_and(|slot| {
                let slot = slot.read();
                slot.alive && slot.weights.is_some()
            })
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> Vec<AdapterId> {
        let slots: Vec<(AdapterId, SlotLock)> = self
            .slots
            .read()
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();
        let mut ids: Vec<AdapterId> = slots
            .into_iter()
            .filter(|(_, slot)| {
                let slot = slot.read();
                slot.alive && slot.weights.is_some()
            })
            .map(|(id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn slot(&self, id: AdapterId) -> Option<SlotLock> {
        self.slots.read().get(&id).cloned()
    }

    fn retire(
        &self,
        id: AdapterId,
        slot: &SlotLock,
        mut guard: SlotWriteGuard,
    ) -> bool {
        if !guard.alive {
            return false;
        }
        guard.alive = false;
        let removed = guard.weights.take().is_some();
        drop(guard);

        let mut slots = self.slots.write();
        if slots.get(&id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(&id);
        }
        if removed {
            info!("Removed adapter {id}.");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use candle_core::{DType, Device, Tensor};

    use super::*;

    fn weights(value: f32) -> AdapterWeights {
        let dev = Device::Cpu;
        let a = (Tensor::ones((2, 4), DType::F32, &dev).unwrap() * value as f64).unwrap();
        let b = (Tensor::ones((4, 2), DType::F32, &dev).unwrap() * value as f64).unwrap();
        AdapterWeights::new(
            vec![HashMap::from([("hidden".to_string(), a)])],
            vec![HashMap::from([("hidden".to_string(), b)])],
        )
    }

    #[test]
    fn add_then_read() {
        let registry = AdapterRegistry::new();
        let v1 = registry.add(3, weights(1.)).unwrap();
        let guard = registry.acquire_read(3).unwrap();
        assert_eq!(guard.id(), 3);
        assert_eq!(guard.version(), v1);
        assert_eq!(guard.weights().num_layers(), 1);
        drop(guard);

        let v2 = registry.add(3, weights(2.)).unwrap();
        assert!(v2 > v1);
        assert_eq!(registry.acquire_read(3).unwrap().version(), v2);
        assert_eq!(registry.ids(), vec![3]);
    }

    #[test]
    fn remove_unknown_is_noop() {
        let registry = AdapterRegistry::new();
        assert_eq!(registry.remove(42), Ok(false));
        assert_eq!(registry.try_remove(42), Ok(false));
    }

    #[test]
    fn remove_then_read_fails() {
        let registry = AdapterRegistry::new();
        registry.add(1, weights(1.)).unwrap();
        assert_eq!(registry.remove(1), Ok(true));
        assert!(!registry.contains(1));
        assert_eq!(
            registry.acquire_read(1).unwrap_err(),
            AdapterError::NotFound(1)
        );
        assert_eq!(registry.remove(1), Ok(false));
    }

    #[test]
    fn try_remove_reports_busy_reader() {
        let registry = AdapterRegistry::new();
        registry.add(1, weights(1.)).unwrap();
        let guard = registry.acquire_read(1).unwrap();
        assert_eq!(registry.try_remove(1), Err(AdapterError::Busy(1)));
        drop(guard);
        assert_eq!(registry.try_remove(1), Ok(true));
    }

    #[test]
    fn remove_waits_for_reader() {
        let registry = Arc::new(AdapterRegistry::new());
        registry.add(5, weights(1.)).unwrap();
        let guard = registry.acquire_read(5).unwrap();

        let (tx, rx) = mpsc::channel();
        let r = registry.clone();
        let handle = std::thread::spawn(move || {
            let removed = r.remove(5).unwrap();
            tx.send(removed).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(guard);
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn other_adapters_are_not_blocked() {
        let registry = AdapterRegistry::new();
        registry.add(1, weights(1.)).unwrap();
        registry.add(2, weights(1.)).unwrap();
        let _reader = registry.acquire_read(1).unwrap();
        assert_eq!(registry.try_remove(2), Ok(true));
        registry.add(2, weights(3.)).unwrap();
        assert!(registry.contains(2));
    }

    #[test]
    fn mismatched_weights_rejected() {
        let registry = AdapterRegistry::new();
        let bad = AdapterWeights::new(vec![HashMap::new()], vec![]);
        assert!(matches!(
            registry.add(9, bad),
            Err(AdapterError::Mismatched { id: 9, .. })
        ));
        assert!(!registry.contains(9));
    }

    #[test]
    fn write_timeout_reports_busy() {
        let registry = AdapterRegistry::with_write_timeout(Duration::from_millis(20));
        registry.add(4, weights(1.)).unwrap();
        let guard = registry.acquire_read(4).unwrap();
        assert_eq!(registry.add(4, weights(2.)), Err(AdapterError::Busy(4)));
        assert_eq!(registry.remove(4), Err(AdapterError::Busy(4)));
        assert_eq!(guard.version(), registry.acquire_read(4).unwrap().version());
        drop(guard);
        assert_eq!(registry.remove(4), Ok(true));
    }
}
