//! Per-device allocation accounting.
//!
//! The ledger only observes what the runtime hands to the driver; it never
//! refuses an allocation or a release.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::driver::DevicePtr;

/// Allocation counters for one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationStats {
    /// Allocations not yet released.
    pub live_allocations: usize,
    /// Bytes currently allocated.
    pub live_bytes: u64,
    /// High-water mark of `live_bytes`.
    pub peak_bytes: u64,
    /// Bytes ever allocated.
    pub total_allocated_bytes: u64,
    /// Successful allocations.
    pub allocation_count: u64,
    /// Releases of pointers this ledger knew about.
    pub release_count: u64,
    /// Releases of pointers this ledger never saw.
    pub unknown_releases: u64,
}

#[derive(Debug, Default)]
struct LedgerState {
    live: HashMap<DevicePtr, usize>,
    stats: AllocationStats,
}

/// Tracks the allocations made on one device.
#[derive(Debug, Default)]
pub struct AllocationLedger {
    device_id: usize,
    state: Mutex<LedgerState>,
}

impl AllocationLedger {
    /// Create an empty ledger for `device_id`.
    pub fn new(device_id: usize) -> Self {
        Self {
            device_id,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Record a successful allocation.
    pub fn record_alloc(&self, ptr: DevicePtr, size: usize) {
        let mut state = self.state.lock();
        if let Some(previous) = state.live.insert(ptr, size) {
            // The driver handed out an address we still consider live.
            tracing::warn!(
                device = self.device_id,
                %ptr,
                previous,
                "Device address reused before release"
            );
            state.stats.live_bytes -= previous as u64;
            state.stats.live_allocations -= 1;
        }

        let stats = &mut state.stats;
        stats.live_allocations += 1;
        stats.live_bytes += size as u64;
        stats.total_allocated_bytes += size as u64;
        stats.allocation_count += 1;
        stats.peak_bytes = stats.peak_bytes.max(stats.live_bytes);
    }

    /// Record a release. Returns the size of the allocation if it was known.
    pub fn record_release(&self, ptr: DevicePtr) -> Option<usize> {
        let mut state = self.state.lock();
        match state.live.remove(&ptr) {
            Some(size) => {
                state.stats.live_allocations -= 1;
                state.stats.live_bytes -= size as u64;
                state.stats.release_count += 1;
                Some(size)
            }
            None => {
                state.stats.unknown_releases += 1;
                tracing::warn!(device = self.device_id, %ptr, "Releasing untracked device pointer");
                None
            }
        }
    }

    /// Size of a live allocation.
    pub fn size_of(&self, ptr: DevicePtr) -> Option<usize> {
        self.state.lock().live.get(&ptr).copied()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> AllocationStats {
        self.state.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_release_accounting() {
        let ledger = AllocationLedger::new(0);
        let a = DevicePtr::new(0x1000);
        let b = DevicePtr::new(0x2000);

        ledger.record_alloc(a, 4096);
        ledger.record_alloc(b, 1024);
        assert_eq!(ledger.size_of(a), Some(4096));

        let stats = ledger.stats();
        assert_eq!(stats.live_allocations, 2);
        assert_eq!(stats.live_bytes, 5120);
        assert_eq!(stats.peak_bytes, 5120);

        assert_eq!(ledger.record_release(a), Some(4096));
        let stats = ledger.stats();
        assert_eq!(stats.live_allocations, 1);
        assert_eq!(stats.live_bytes, 1024);
        assert_eq!(stats.peak_bytes, 5120);
        assert_eq!(stats.total_allocated_bytes, 5120);
        assert_eq!(stats.release_count, 1);
    }

    #[test]
    fn test_unknown_release_counted() {
        let ledger = AllocationLedger::new(1);
        assert_eq!(ledger.record_release(DevicePtr::new(0xdead)), None);
        assert_eq!(ledger.stats().unknown_releases, 1);
        assert_eq!(ledger.stats().release_count, 0);
    }

    #[test]
    fn test_reused_address_replaces_entry() {
        let ledger = AllocationLedger::new(0);
        let ptr = DevicePtr::new(0x3000);
        ledger.record_alloc(ptr, 100);
        ledger.record_alloc(ptr, 300);

        let stats = ledger.stats();
        assert_eq!(stats.live_allocations, 1);
        assert_eq!(stats.live_bytes, 300);
        assert_eq!(stats.allocation_count, 2);
    }
}
