//! Fixed-pool rollback history.
//!
//! [`SnapshotStore`] carves one buffer into equally sized slots, one per
//! snapshot, where a slot holds every byte described by the
//! [`RegionCatalog`]. Saving past capacity evicts the oldest entry; loading
//! rewinds to the newest entry at or before a target and discards everything
//! after it.

pub mod region;

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::config::SnapshotConfig;
use crate::report_violation;
use crate::sync_manager::SyncState;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{IndexedFrame, NetplayError};

use region::{MemoryAccessor, RegionCatalog};

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    state: SyncState,
    offset: usize,
}

/// Captures and restores host memory keyed by [`IndexedFrame`].
///
/// History is kept sorted ascending by key. Saving a key that is not newer
/// than the newest entry first drops every entry at or after it, which is what
/// happens when frames are re-simulated after a rewind.
///
/// ```
/// use rollback_netplay::{
///     IndexedFrame, MemoryAccessor, NetplayError, Phase, RegionCatalog, RegionDescriptor,
///     SnapshotStore, SyncState,
/// };
///
/// struct Ram(Vec<u8>);
///
/// impl MemoryAccessor for Ram {
///     fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), NetplayError> {
///         buf.copy_from_slice(&self.0[address..address + buf.len()]);
///         Ok(())
///     }
///     fn write(&mut self, address: usize, bytes: &[u8]) -> Result<(), NetplayError> {
///         self.0[address..address + bytes.len()].copy_from_slice(bytes);
///         Ok(())
///     }
///     fn read_pointer(&self, _address: usize) -> Result<usize, NetplayError> {
///         Ok(0)
///     }
/// }
///
/// let mut ram = Ram(vec![0; 8]);
/// let mut store = SnapshotStore::new();
/// store
///     .allocate(RegionCatalog::from_regions(vec![RegionDescriptor::new(0, 8)]), 4)
///     .unwrap();
///
/// let state = SyncState::new(Phase::InGame, 100, IndexedFrame::new(3, 10));
/// ram.0[0] = 7;
/// store.save(state, &ram).unwrap();
/// ram.0[0] = 9;
///
/// let restored = store.load(IndexedFrame::new(3, 12), &mut ram).unwrap();
/// assert_eq!(restored, Some(state));
/// assert_eq!(ram.0[0], 7);
/// ```
#[derive(Debug, Default)]
pub struct SnapshotStore {
    catalog: RegionCatalog,
    slot_size: usize,
    capacity: usize,
    pool: Vec<u8>,
    free_slots: Vec<usize>,
    history: VecDeque<Snapshot>,
}

impl SnapshotStore {
    /// Creates an unallocated store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes the pool for `capacity` snapshots of `catalog` and clears history.
    ///
    /// The catalog is optimized first. A pool of the same total size is
    /// reused.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::ConfigValueOutOfRange`] for a zero capacity and
    /// [`NetplayError::InvalidRequest`] for an empty or malformed catalog.
    pub fn allocate(&mut self, mut catalog: RegionCatalog, capacity: usize) -> Result<(), NetplayError> {
        if capacity == 0 {
            return Err(NetplayError::ConfigValueOutOfRange {
                field: "capacity",
                min: 1,
                max: u64::MAX,
                actual: 0,
            });
        }
        catalog.validate()?;
        catalog.optimize();

        let slot_size = catalog.total_size();
        let pool_size = slot_size.checked_mul(capacity).ok_or_else(|| NetplayError::InvalidRequest {
            info: format!("{} snapshots of {} bytes overflow the address space", capacity, slot_size),
        })?;

        if self.pool.len() != pool_size {
            self.pool = vec![0; pool_size];
        }
        self.catalog = catalog;
        self.slot_size = slot_size;
        self.capacity = capacity;
        self.free_slots = (0..capacity).rev().map(|slot| slot * slot_size).collect();
        self.history.clear();

        debug!(capacity, slot_size, "snapshot pool allocated");
        Ok(())
    }

    /// [`allocate`](Self::allocate) with a validated [`SnapshotConfig`].
    ///
    /// # Errors
    ///
    /// As [`allocate`](Self::allocate), plus the config's own validation.
    pub fn allocate_with_config(
        &mut self,
        catalog: RegionCatalog,
        config: &SnapshotConfig,
    ) -> Result<(), NetplayError> {
        config.validate()?;
        self.allocate(catalog, config.capacity)
    }

    /// Releases the pool and forgets all history.
    pub fn deallocate(&mut self) {
        self.pool = Vec::new();
        self.free_slots.clear();
        self.history.clear();
        self.capacity = 0;
        self.slot_size = 0;
    }

    /// Returns `true` between [`allocate`](Self::allocate) and
    /// [`deallocate`](Self::deallocate).
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.capacity > 0
    }

    /// Copies every registered region into a slot tagged with `state`.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::SnapshotsNotAllocated`] before `allocate()`,
    /// and propagates memory accessor failures. A failed save stores nothing,
    /// but entries it would have replaced or evicted are already gone.
    pub fn save(&mut self, state: SyncState, memory: &dyn MemoryAccessor) -> Result<(), NetplayError> {
        if !self.is_allocated() {
            return Err(NetplayError::SnapshotsNotAllocated);
        }

        self.truncate_from(state.indexed_frame);

        if self.free_slots.is_empty() {
            let Some(evicted) = self.history.pop_front() else {
                report_violation!(
                    ViolationSeverity::Critical,
                    ViolationKind::SnapshotStore,
                    "no free slot and no history to evict (capacity={})",
                    self.capacity
                );
                return Err(NetplayError::InternalError {
                    context: "snapshot pool exhausted with empty history".to_owned(),
                });
            };
            trace!(frame = %evicted.state.indexed_frame, "evicting oldest snapshot");
            self.free_slots.push(evicted.offset);
        }

        let Some(offset) = self.free_slots.pop() else {
            return Err(NetplayError::InternalError {
                context: "free slot stack emptied during save".to_owned(),
            });
        };

        let result = match self.pool.get_mut(offset..offset + self.slot_size) {
            Some(slot) => self.catalog.save_into(memory, slot),
            None => Err(NetplayError::InternalError {
                context: format!("slot offset {} outside pool", offset),
            }),
        };
        if let Err(err) = result {
            self.free_slots.push(offset);
            return Err(err);
        }

        self.history.push_back(Snapshot { state, offset });
        trace!(frame = %state.indexed_frame, offset, "saved snapshot");

        crate::debug_check_invariants!(self, "SnapshotStore::save");
        Ok(())
    }

    /// Rewinds to the newest entry whose key is `<= target`.
    ///
    /// Every newer entry is discarded. `Ok(None)` means nothing old enough
    /// exists; memory and history are untouched in that case.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::SnapshotsNotAllocated`] before `allocate()`,
    /// and propagates memory accessor failures.
    pub fn load(
        &mut self,
        target: IndexedFrame,
        memory: &mut dyn MemoryAccessor,
    ) -> Result<Option<SyncState>, NetplayError> {
        if !self.is_allocated() {
            return Err(NetplayError::SnapshotsNotAllocated);
        }

        let Some(position) = self
            .history
            .iter()
            .rposition(|snapshot| snapshot.state.indexed_frame <= target)
        else {
            debug!(
                %target,
                oldest = ?self.oldest(),
                newest = ?self.newest(),
                "no snapshot old enough"
            );
            return Ok(None);
        };

        let Some(&snapshot) = self.history.get(position) else {
            return Ok(None);
        };
        let slot = self
            .pool
            .get(snapshot.offset..snapshot.offset + self.slot_size)
            .ok_or_else(|| NetplayError::InternalError {
                context: format!("slot offset {} outside pool", snapshot.offset),
            })?;
        self.catalog.load_from(memory, slot)?;

        for discarded in self.history.drain(position + 1..) {
            self.free_slots.push(discarded.offset);
        }

        debug!(%target, restored = %snapshot.state.indexed_frame, "loaded snapshot");
        crate::debug_check_invariants!(self, "SnapshotStore::load");
        Ok(Some(snapshot.state))
    }

    fn truncate_from(&mut self, key: IndexedFrame) {
        while let Some(newest) = self.history.back() {
            if newest.state.indexed_frame < key {
                break;
            }
            trace!(frame = %newest.state.indexed_frame, "replacing snapshot");
            self.free_slots.push(newest.offset);
            self.history.pop_back();
        }
    }

    /// Number of snapshots held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Returns `true` if no snapshot is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Maximum number of snapshots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes per snapshot.
    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Key of the oldest snapshot.
    #[must_use]
    pub fn oldest(&self) -> Option<IndexedFrame> {
        self.history.front().map(|snapshot| snapshot.state.indexed_frame)
    }

    /// Key of the newest snapshot.
    #[must_use]
    pub fn newest(&self) -> Option<IndexedFrame> {
        self.history.back().map(|snapshot| snapshot.state.indexed_frame)
    }

    /// The catalog in use, after optimization.
    #[must_use]
    pub fn catalog(&self) -> &RegionCatalog {
        &self.catalog
    }
}

impl InvariantChecker for SnapshotStore {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.history.len() + self.free_slots.len() != self.capacity {
            return Err(InvariantViolation::new("SnapshotStore", "every slot is either used or free")
                .with_details(format!(
                    "history={}, free={}, capacity={}",
                    self.history.len(),
                    self.free_slots.len(),
                    self.capacity
                )));
        }

        let mut keys = self.history.iter().map(|snapshot| snapshot.state.indexed_frame);
        if let Some(mut previous) = keys.next() {
            for key in keys {
                if key <= previous {
                    return Err(InvariantViolation::new(
                        "SnapshotStore",
                        "history sorted strictly ascending",
                    )
                    .with_details(format!("{} follows {}", key, previous)));
                }
                previous = key;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::snapshot_store::region::RegionDescriptor;
    use crate::sync_manager::Phase;

    struct Ram(Vec<u8>);

    impl MemoryAccessor for Ram {
        fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), NetplayError> {
            buf.copy_from_slice(&self.0[address..address + buf.len()]);
            Ok(())
        }

        fn write(&mut self, address: usize, bytes: &[u8]) -> Result<(), NetplayError> {
            self.0[address..address + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }

        fn read_pointer(&self, _address: usize) -> Result<usize, NetplayError> {
            Ok(0)
        }
    }

    fn store(capacity: usize) -> SnapshotStore {
        let mut store = SnapshotStore::new();
        store
            .allocate(
                RegionCatalog::from_regions(vec![
                    RegionDescriptor::new(0, 4),
                    RegionDescriptor::new(8, 4),
                ]),
                capacity,
            )
            .unwrap();
        store
    }

    fn state(frame: u32) -> SyncState {
        SyncState::new(Phase::InGame, 0, IndexedFrame::new(1, frame))
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    #[test]
    fn unallocated_store_rejects_everything() {
        let mut store = SnapshotStore::new();
        let mut ram = Ram(vec![0; 16]);
        assert!(!store.is_allocated());
        assert_eq!(
            store.save(state(0), &ram),
            Err(NetplayError::SnapshotsNotAllocated)
        );
        assert_eq!(
            store.load(IndexedFrame::new(1, 0), &mut ram),
            Err(NetplayError::SnapshotsNotAllocated)
        );
    }

    #[test]
    fn allocate_sizes_pool_from_catalog() {
        let store = store(8);
        assert_eq!(store.slot_size(), 8);
        assert_eq!(store.capacity(), 8);
        assert!(store.is_empty());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut store = SnapshotStore::new();
        let catalog = RegionCatalog::from_regions(vec![RegionDescriptor::new(0, 4)]);
        assert!(matches!(
            store.allocate(catalog, 0),
            Err(NetplayError::ConfigValueOutOfRange { .. })
        ));
    }

    #[test]
    fn deallocate_forgets_history() {
        let mut store = store(2);
        store.save(state(0), &Ram(vec![0; 16])).unwrap();
        store.deallocate();
        assert!(!store.is_allocated());
        assert!(store.is_empty());
    }

    // ========================================================================
    // Save / load
    // ========================================================================

    #[test]
    fn load_restores_bytes_and_state() {
        let mut store = store(4);
        let mut ram = Ram(vec![0; 16]);
        ram.0[0..4].copy_from_slice(&[1, 2, 3, 4]);
        ram.0[8..12].copy_from_slice(&[5, 6, 7, 8]);
        store.save(state(5), &ram).unwrap();

        ram.0.fill(0xEE);
        let restored = store.load(IndexedFrame::new(1, 5), &mut ram).unwrap();

        assert_eq!(restored, Some(state(5)));
        assert_eq!(&ram.0[0..4], &[1, 2, 3, 4]);
        assert_eq!(&ram.0[8..12], &[5, 6, 7, 8]);
        // Gap between the regions is not part of the snapshot.
        assert_eq!(&ram.0[4..8], &[0xEE; 4]);
    }

    #[test]
    fn load_picks_newest_at_or_before_target_and_truncates() {
        let mut store = store(8);
        let ram = Ram(vec![0; 16]);
        for frame in [2, 4, 6] {
            store.save(state(frame), &ram).unwrap();
        }

        let mut ram = Ram(vec![0; 16]);
        let restored = store.load(IndexedFrame::new(1, 5), &mut ram).unwrap();
        assert_eq!(restored.map(|s| s.indexed_frame), Some(IndexedFrame::new(1, 4)));
        assert_eq!(store.newest(), Some(IndexedFrame::new(1, 4)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn load_miss_changes_nothing() {
        let mut store = store(4);
        let mut ram = Ram(vec![3; 16]);
        store.save(state(10), &ram).unwrap();
        ram.0.fill(9);

        assert_eq!(store.load(IndexedFrame::new(1, 9), &mut ram).unwrap(), None);
        assert_eq!(store.len(), 1);
        assert!(ram.0.iter().all(|&b| b == 9));
    }

    #[test]
    fn full_pool_evicts_oldest() {
        let mut store = store(3);
        let ram = Ram(vec![0; 16]);
        for frame in 0..5 {
            store.save(state(frame), &ram).unwrap();
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.oldest(), Some(IndexedFrame::new(1, 2)));
        assert_eq!(store.newest(), Some(IndexedFrame::new(1, 4)));
    }

    #[test]
    fn resave_after_rewind_reuses_freed_slot() {
        let mut store = store(3);
        let mut ram = Ram(vec![0; 16]);
        for frame in [1, 2, 3] {
            ram.0[0] = frame as u8;
            store.save(state(frame), &ram).unwrap();
        }

        store.load(IndexedFrame::new(1, 2), &mut ram).unwrap();
        ram.0[0] = 42;
        store.save(state(3), &ram).unwrap();
        assert_eq!(store.len(), 3);

        // Frame 1 must not have been clobbered by the new frame 3.
        store.load(IndexedFrame::new(1, 1), &mut ram).unwrap();
        assert_eq!(ram.0[0], 1);
    }

    #[test]
    fn saving_an_older_key_replaces_newer_entries() {
        let mut store = store(4);
        let ram = Ram(vec![0; 16]);
        for frame in [1, 2, 3] {
            store.save(state(frame), &ram).unwrap();
        }
        store.save(state(2), &ram).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.newest(), Some(IndexedFrame::new(1, 2)));
        assert!(store.check_invariants().is_ok());
    }

    #[test]
    fn keys_order_across_epochs() {
        let mut store = store(4);
        let mut ram = Ram(vec![0; 16]);
        store
            .save(SyncState::new(Phase::InGame, 0, IndexedFrame::new(1, 900)), &ram)
            .unwrap();
        store
            .save(SyncState::new(Phase::InGame, 900, IndexedFrame::new(2, 0)), &ram)
            .unwrap();
        let restored = store.load(IndexedFrame::new(1, 1000), &mut ram).unwrap();
        assert_eq!(restored.map(|s| s.indexed_frame), Some(IndexedFrame::new(1, 900)));
    }
}
