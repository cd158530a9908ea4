//! Snapshot store integration tests against pointer-linked memory.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

#[path = "common/mod.rs"]
mod common;

use common::VecMemory;
use rollback_netplay::telemetry::InvariantChecker;
use rollback_netplay::{
    IndexedFrame, NetplayError, Phase, PointerRegion, RegionCatalog, RegionDescriptor,
    SnapshotStore, SyncState,
};

// Layout:
//   0x00..0x10  player block: 8 bytes of state, then a pointer to its effect
//   0x10..0x18  round timer
//   0x40..0x48  effect: 4 bytes of state, then the low half of a pointer to a particle
//   0x80..0x84  particle
//   0xA0..0xA8  second effect, swapped in by the game
const PLAYER: usize = 0x00;
const TIMER: usize = 0x10;
const EFFECT: usize = 0x40;
const PARTICLE: usize = 0x80;
const OTHER_EFFECT: usize = 0xA0;

fn catalog() -> RegionCatalog {
    RegionCatalog::from_regions(vec![
        RegionDescriptor::new(TIMER, 8),
        RegionDescriptor::new(PLAYER, 16).with_child(
            PointerRegion::new(8, 0, 8).with_child(PointerRegion::new(4, 0, 4)),
        ),
    ])
}

fn memory() -> VecMemory {
    let mut memory = VecMemory::new(0x100);
    memory.set_u32(PLAYER, 100);
    memory.set_pointer(PLAYER + 8, EFFECT);
    memory.set_u32(TIMER, 99);
    memory.set_u32(EFFECT, 5);
    memory.set_pointer(EFFECT + 4, 0);
    memory
}

fn state(frame: u32) -> SyncState {
    SyncState::new(Phase::InGame, 1_000, IndexedFrame::new(4, frame))
}

#[test]
fn catalog_is_optimized_on_allocate() {
    let mut store = SnapshotStore::new();
    store.allocate(catalog(), 8).unwrap();

    // The player block and the timer are back to back and merge into one.
    assert_eq!(store.catalog().regions().len(), 1);
    assert_eq!(store.catalog().regions()[0].address, PLAYER);
    assert_eq!(store.catalog().regions()[0].size, 24);
    assert_eq!(store.slot_size(), 24 + 8 + 4);
}

#[test]
fn pointer_targets_are_restored_through_the_restored_pointer() {
    let mut memory = memory();
    memory.set_pointer(EFFECT + 4, PARTICLE);
    memory.set_u32(PARTICLE, 0xAAAA);

    let mut store = SnapshotStore::new();
    store.allocate(catalog(), 8).unwrap();
    store.save(state(10), &memory).unwrap();

    // The game swaps the effect out and scribbles over everything.
    memory.set_pointer(PLAYER + 8, OTHER_EFFECT);
    memory.set_u32(PLAYER, 1);
    memory.set_u32(TIMER, 2);
    memory.set_u32(EFFECT, 3);
    memory.set_u32(PARTICLE, 4);

    let restored = store.load(IndexedFrame::new(4, 10), &mut memory).unwrap();
    assert_eq!(restored, Some(state(10)));
    assert_eq!(memory.u32_at(PLAYER), 100);
    assert_eq!(memory.u32_at(TIMER), 99);
    assert_eq!(memory.u32_at(EFFECT), 5);
    assert_eq!(memory.u32_at(PARTICLE), 0xAAAA);
    // The other effect was never part of the snapshot.
    assert_eq!(memory.u32_at(OTHER_EFFECT), 0);
}

#[test]
fn null_pointers_save_zeros_and_skip_restore() {
    let mut memory = memory();
    memory.set_pointer(PLAYER + 8, 0);
    memory.set_u32(EFFECT, 77);

    let mut store = SnapshotStore::new();
    store.allocate(catalog(), 4).unwrap();
    store.save(state(0), &memory).unwrap();

    memory.set_u32(EFFECT, 78);
    store.load(IndexedFrame::new(4, 0), &mut memory).unwrap();
    // Nothing pointed at the effect when saved, so it is left alone.
    assert_eq!(memory.u32_at(EFFECT), 78);
}

#[test]
fn history_is_bounded_and_rewrites_drop_the_future() {
    let mut memory = memory();
    let mut store = SnapshotStore::new();
    store.allocate(catalog(), 4).unwrap();

    for frame in 0..10 {
        memory.set_u32(TIMER, frame);
        store.save(state(frame), &memory).unwrap();
        assert!(store.check_invariants().is_ok());
    }
    assert_eq!(store.len(), 4);
    assert_eq!(store.oldest(), Some(IndexedFrame::new(4, 6)));
    assert_eq!(store.newest(), Some(IndexedFrame::new(4, 9)));

    // Too old: nothing changes.
    memory.set_u32(TIMER, 500);
    assert_eq!(store.load(IndexedFrame::new(4, 3), &mut memory).unwrap(), None);
    assert_eq!(memory.u32_at(TIMER), 500);
    assert_eq!(store.len(), 4);

    // Between two entries: the older one wins and everything newer goes.
    let restored = store.load(IndexedFrame::new(4, 7), &mut memory).unwrap();
    assert_eq!(restored.map(|s| s.indexed_frame), Some(IndexedFrame::new(4, 7)));
    assert_eq!(memory.u32_at(TIMER), 7);
    assert_eq!(store.newest(), Some(IndexedFrame::new(4, 7)));

    // Re-saving an existing key replaces it.
    memory.set_u32(TIMER, 70);
    store.save(state(7), &memory).unwrap();
    assert_eq!(store.len(), 2);
    memory.set_u32(TIMER, 0);
    store.load(IndexedFrame::new(4, 7), &mut memory).unwrap();
    assert_eq!(memory.u32_at(TIMER), 70);
}

#[test]
fn failed_reads_leave_history_alone() {
    let mut memory = VecMemory::new(0x20);
    let mut store = SnapshotStore::new();
    store
        .allocate(
            RegionCatalog::from_regions(vec![
                RegionDescriptor::new(0, 16).with_child(PointerRegion::new(8, 0, 4))
            ]),
            4,
        )
        .unwrap();

    store.save(state(0), &memory).unwrap();
    memory.set_pointer(8, 0x1000);
    let err = store.save(state(1), &memory).unwrap_err();
    assert!(matches!(err, NetplayError::MemoryAccess { address: 0x1000, len: 4 }));
    assert_eq!(store.len(), 1);
    assert!(store.check_invariants().is_ok());
}

#[test]
fn catalog_round_trips_through_the_codec() {
    let bytes = catalog().to_bytes().unwrap();
    assert_eq!(RegionCatalog::from_bytes(&bytes).unwrap(), catalog());
}

#[test]
fn unallocated_store_refuses_work() {
    let mut store = SnapshotStore::new();
    let mut memory = memory();
    assert!(matches!(
        store.save(state(0), &memory),
        Err(NetplayError::SnapshotsNotAllocated)
    ));
    assert!(matches!(
        store.load(IndexedFrame::new(4, 0), &mut memory),
        Err(NetplayError::SnapshotsNotAllocated)
    ));

    assert!(store.allocate(RegionCatalog::new(), 4).is_err());
    assert!(store.allocate(catalog(), 0).is_err());
    assert!(!store.is_allocated());
}
