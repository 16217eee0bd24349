use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use batchport_core::{
    BackendError, BufferView, BufferViewMut, CopyStatus, MemoryKind, MemoryManager,
    MemoryPlacement, OwnedBuffer, Result,
};
use tracing::trace;

/// Capacities of the pools a `PoolMemoryManager` serves. `None` is
/// unbounded.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub host_capacity: Option<usize>,
    pub pinned_capacity: Option<usize>,
    pub device_capacity: Option<usize>,
    /// Device ids `0..devices` get a pool each.
    pub devices: u32,
    /// Allow direct copies between different devices.
    pub peer_access: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            host_capacity: None,
            pinned_capacity: Some(256 << 20),
            device_capacity: Some(1 << 30),
            devices: 1,
            peer_access: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub async_copies: usize,
    pub synchronizations: usize,
    pub pending_copies: usize,
}

#[derive(Debug)]
struct Pool {
    placement: MemoryPlacement,
    capacity: Option<usize>,
    used: AtomicUsize,
}

impl Pool {
    fn reserve(&self, bytes: usize) -> bool {
        let Some(capacity) = self.capacity else {
            self.used.fetch_add(bytes, Ordering::AcqRel);
            return true;
        };
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= capacity)
            })
            .is_ok()
    }
}

/// Returns its bytes to the pool when the owning buffer is dropped.
#[derive(Debug)]
struct PoolLease {
    pool: Arc<Pool>,
    bytes: usize,
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.pool.used.fetch_sub(self.bytes, Ordering::AcqRel);
        trace!(placement = %self.pool.placement, bytes = self.bytes, "released");
    }
}

/// Reference memory services for the in-process host.
///
/// Device memory is simulated with host allocations tagged as device
/// resident. Every copy touching a device is reported as asynchronous and
/// stays pending until `synchronize`.
#[derive(Debug)]
pub struct PoolMemoryManager {
    pools: HashMap<MemoryPlacement, Arc<Pool>>,
    peer_access: bool,
    pending: AtomicUsize,
    async_copies: AtomicUsize,
    synchronizations: AtomicUsize,
}

impl PoolMemoryManager {
    pub fn new(config: PoolConfig) -> Self {
        let mut pools = HashMap::new();
        let mut add = |placement: MemoryPlacement, capacity: Option<usize>| {
            pools.insert(
                placement,
                Arc::new(Pool {
                    placement,
                    capacity,
                    used: AtomicUsize::new(0),
                }),
            );
        };
        add(MemoryPlacement::HOST, config.host_capacity);
        add(MemoryPlacement::PINNED, config.pinned_capacity);
        for device_id in 0..config.devices {
            add(
                MemoryPlacement::device(i64::from(device_id)),
                config.device_capacity,
            );
        }
        Self {
            pools,
            peer_access: config.peer_access,
            pending: AtomicUsize::new(0),
            async_copies: AtomicUsize::new(0),
            synchronizations: AtomicUsize::new(0),
        }
    }

    fn pool(&self, placement: MemoryPlacement) -> Option<&Arc<Pool>> {
        let key = match placement.kind {
            MemoryKind::Host => MemoryPlacement::HOST,
            MemoryKind::Pinned => MemoryPlacement::PINNED,
            MemoryKind::Device => placement,
        };
        self.pools.get(&key)
    }

    /// Bytes currently handed out from the pool serving `placement`.
    pub fn in_use(&self, placement: MemoryPlacement) -> usize {
        self.pool(placement)
            .map(|pool| pool.used.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            async_copies: self.async_copies.load(Ordering::Acquire),
            synchronizations: self.synchronizations.load(Ordering::Acquire),
            pending_copies: self.pending.load(Ordering::Acquire),
        }
    }

    fn transfer_status(&self, from: MemoryPlacement, to: MemoryPlacement) -> Result<CopyStatus> {
        let unsupported = || BackendError::UnsupportedTransfer { from, to };
        for placement in [from, to] {
            if placement.kind == MemoryKind::Device && self.pool(placement).is_none() {
                return Err(unsupported());
            }
        }
        match (from.kind, to.kind) {
            (MemoryKind::Device, MemoryKind::Device)
                if from.device_id != to.device_id && !self.peer_access =>
            {
                Err(unsupported())
            }
            (a, b) if a.is_host_accessible() && b.is_host_accessible() => Ok(CopyStatus::Complete),
            _ => Ok(CopyStatus::Pending),
        }
    }
}

impl Default for PoolMemoryManager {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl MemoryManager for PoolMemoryManager {
    fn allocate(&self, placement: MemoryPlacement, byte_size: usize) -> Result<OwnedBuffer> {
        let out_of_memory = || BackendError::OutOfMemory {
            bytes: byte_size,
            tried: placement.to_string(),
        };
        let pool = self.pool(placement).ok_or_else(out_of_memory)?;
        if !pool.reserve(byte_size) {
            return Err(out_of_memory());
        }
        let lease = PoolLease {
            pool: Arc::clone(pool),
            bytes: byte_size,
        };
        Ok(OwnedBuffer::zeroed(pool.placement, byte_size).with_lease(lease))
    }

    fn copy(&self, src: &BufferView<'_>, dst: &mut BufferViewMut<'_>) -> Result<CopyStatus> {
        if src.len() != dst.len() {
            return Err(BackendError::Internal(format!(
                "copy of {} bytes into a {}-byte region",
                src.len(),
                dst.len()
            )));
        }
        let status = self.transfer_status(src.placement(), dst.placement())?;
        dst.raw_bytes_mut().copy_from_slice(src.raw_bytes());
        if status == CopyStatus::Pending {
            self.pending.fetch_add(1, Ordering::AcqRel);
            self.async_copies.fetch_add(1, Ordering::AcqRel);
        }
        Ok(status)
    }

    fn synchronize(&self) -> Result<()> {
        let drained = self.pending.swap(0, Ordering::AcqRel);
        self.synchronizations.fetch_add(1, Ordering::AcqRel);
        trace!(drained, "synchronized copy streams");
        Ok(())
    }
}
