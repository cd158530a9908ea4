//! Property-based tests for the building blocks under a session.
//!
//! # Properties Tested
//!
//! ## Positions
//! - `IndexedFrame` orders exactly like its `(index, frame)` tuple
//! - Stepping back and forward within an epoch is lossless
//!
//! ## InputTimeline
//! - Reads between writes see the nearest prior write
//! - `set` keeps the first write, `assign` replaces it
//! - Pruning never changes what newer epochs read
//!
//! ## ChaosLink
//! - Every packet handed to the link is accounted for
//!
//! ## ReliableChannel
//! - In-order, exactly-once delivery under random loss and reordering
//! - Outstanding packets always sit strictly above the acknowledged sequence
//!
//! ## SnapshotStore
//! - The newest entry is always the last one saved and history stays bounded

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::VecMemory;
use proptest::prelude::*;
use rollback_netplay::telemetry::InvariantChecker;
use rollback_netplay::{
    ChannelConfig, ChannelEvent, ChannelPacket, ChaosConfig, ChaosLink, IndexedFrame,
    InputSample, InputTimeline, Phase, RegionCatalog, RegionDescriptor, ReliableChannel,
    SnapshotStore, SyncState, Transport,
};

// ============================================================================
// Property Test Strategies
// ============================================================================

fn indexed_frame_strategy() -> impl Strategy<Value = IndexedFrame> {
    (0u32..8, 0u32..1_000).prop_map(|(index, frame)| IndexedFrame::new(index, frame))
}

/// Gaps between consecutive writes (at least one frame) and the value written.
fn writes_strategy() -> impl Strategy<Value = Vec<(u32, u16)>> {
    prop::collection::vec((1u32..12, 1u16..0x7FF), 1..24)
}

fn chaos_strategy() -> impl Strategy<Value = ChaosConfig> {
    (
        any::<u64>(),
        0.0f64..0.4,
        0.0f64..0.2,
        0u32..4,
        0u32..4,
        prop_oneof![Just(0usize), 2usize..6],
    )
        .prop_map(|(seed, loss, duplication, latency, jitter, reorder)| {
            ChaosConfig::builder()
                .loss_rate(loss)
                .duplication_rate(duplication)
                .latency_ticks(latency)
                .jitter_ticks(jitter)
                .reorder(reorder, 0.3)
                .seed(seed)
                .build()
        })
}

/// Absolute frames of each write, starting from `first`.
fn frames_of(first: u32, writes: &[(u32, u16)]) -> Vec<(u32, InputSample)> {
    let mut frame = first;
    writes
        .iter()
        .enumerate()
        .map(|(i, (gap, value))| {
            if i > 0 {
                frame += gap;
            }
            (frame, InputSample::new(*value))
        })
        .collect()
}

// ============================================================================
// Positions
// ============================================================================

proptest! {
    #[test]
    fn prop_indexed_frame_orders_like_its_tuple(
        a in indexed_frame_strategy(),
        b in indexed_frame_strategy(),
    ) {
        prop_assert_eq!(a.cmp(&b), (a.index, a.frame).cmp(&(b.index, b.frame)));
        prop_assert!(a < IndexedFrame::MAX);
    }

    #[test]
    fn prop_frame_steps_are_lossless(at in indexed_frame_strategy(), n in 0u32..2_000) {
        match at.minus_frames(n) {
            Some(earlier) => {
                prop_assert_eq!(earlier.index, at.index);
                prop_assert_eq!(earlier.plus_frames(n), at);
            },
            None => prop_assert!(n > at.frame),
        }
    }
}

// ============================================================================
// InputTimeline
// ============================================================================

proptest! {
    #[test]
    fn prop_timeline_reads_see_the_nearest_prior_write(
        index in 0u32..4,
        first in 0u32..20,
        writes in writes_strategy(),
    ) {
        let writes = frames_of(first, &writes);
        let mut timeline = InputTimeline::new();
        for (frame, value) in &writes {
            timeline.set(IndexedFrame::new(index, *frame), *value);
        }

        let last = writes.last().map_or(0, |(frame, _)| *frame);
        for frame in 0..last + 10 {
            let expected = writes
                .iter()
                .rev()
                .find(|(written, _)| *written <= frame)
                .map_or(InputSample::NONE, |(_, value)| *value);
            prop_assert_eq!(
                timeline.get(IndexedFrame::new(index, frame)),
                expected,
                "frame {}",
                frame
            );
        }
        prop_assert_eq!(timeline.end_frame_of(index), last + 1);
        prop_assert!(timeline.is_epoch_empty(index + 1));
        prop_assert!(timeline.check_invariants().is_ok());
    }

    #[test]
    fn prop_set_keeps_the_first_write_and_assign_replaces_it(
        writes in writes_strategy(),
        pick in any::<prop::sample::Index>(),
        replacement in 0x800u16..0xFFF,
    ) {
        let writes = frames_of(0, &writes);
        let mut timeline = InputTimeline::new();
        for (frame, value) in &writes {
            timeline.set(IndexedFrame::new(0, *frame), *value);
        }

        let (frame, original) = writes[pick.index(writes.len())];
        let at = IndexedFrame::new(0, frame);
        timeline.set(at, InputSample::new(replacement));
        prop_assert_eq!(timeline.get(at), original);

        timeline.assign(at, InputSample::new(replacement));
        prop_assert_eq!(timeline.get(at), InputSample::new(replacement));
    }

    #[test]
    fn prop_pruning_keeps_newer_epochs_intact(
        epochs in 2u32..8,
        cut in 0u32..8,
        len in 1u32..40,
    ) {
        let sample = |index: u32, frame: u32| InputSample::new((index * 100 + frame) as u16);
        let mut timeline = InputTimeline::new();
        for index in 0..epochs {
            for frame in 0..len {
                timeline.set(IndexedFrame::new(index, frame), sample(index, frame));
            }
        }

        timeline.erase_older_than(cut);
        prop_assert!(timeline.check_invariants().is_ok());
        for index in 0..epochs {
            for frame in 0..len {
                let expected = if index < cut { InputSample::NONE } else { sample(index, frame) };
                prop_assert_eq!(timeline.get(IndexedFrame::new(index, frame)), expected);
            }
        }
    }
}

// ============================================================================
// ChaosLink
// ============================================================================

proptest! {
    #[test]
    fn prop_chaos_link_accounts_for_every_packet(
        chaos in chaos_strategy(),
        burst in 0.0f64..0.1,
        count in 1u32..200,
    ) {
        let mut chaos = chaos;
        chaos.burst_loss_probability = burst;
        chaos.burst_loss_length = 3;
        let mut link: ChaosLink<u32> = ChaosLink::new(chaos);

        let mut delivered = 0usize;
        for sequence in 0..count {
            link.send_raw(&ChannelPacket::Data { sequence, message: sequence });
            delivered += link.advance().len();
        }
        delivered += link.drain().len();

        let stats = link.stats().clone();
        prop_assert_eq!(stats.packets_sent, u64::from(count));
        prop_assert_eq!(
            stats.packets_delivered,
            stats.packets_sent - stats.packets_dropped - stats.packets_dropped_burst
                + stats.packets_duplicated
        );
        prop_assert_eq!(stats.packets_delivered, delivered as u64);
        prop_assert_eq!(link.packets_in_flight(), 0);
    }
}

// ============================================================================
// ReliableChannel
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_channel_delivers_in_order_exactly_once(
        chaos in chaos_strategy(),
        count in 1u32..60,
        per_tick in 1u32..5,
    ) {
        let mut reverse = chaos.clone();
        reverse.seed = chaos.seed.wrapping_add(1);
        let mut a: ReliableChannel<u32> = ReliableChannel::new(ChannelConfig::default());
        let mut b: ReliableChannel<u32> = ReliableChannel::new(ChannelConfig::default());
        let mut a_to_b = ChaosLink::new(chaos);
        let mut b_to_a = ChaosLink::new(reverse);
        let mut received = Vec::new();

        let mut next = 0;
        for _ in 0..20_000 {
            for _ in 0..per_tick {
                if next < count {
                    a.send(next).unwrap();
                    next += 1;
                }
            }
            if next == count && a.pending_len() == 0 {
                break;
            }

            for packet in a_to_b.advance() {
                b.recv(packet);
            }
            for packet in b_to_a.advance() {
                a.recv(packet);
            }
            a.on_tick();
            b.on_tick();
            a.events().for_each(drop);
            for event in b.events() {
                if let ChannelEvent::Delivered(message) = event {
                    received.push(message);
                }
            }
            a.send_all_packets(&mut a_to_b);
            b.send_all_packets(&mut b_to_a);

            prop_assert!(a.check_invariants().is_ok(), "{:?}", a.check_invariants());
            prop_assert!(a.ack_sequence() <= a.send_sequence());
            prop_assert_eq!(b.recv_sequence() as usize, received.len());
        }

        prop_assert_eq!(a.pending_len(), 0, "channel never settled");
        prop_assert_eq!(received, (0..count).collect::<Vec<_>>());
        prop_assert_eq!(a.ack_sequence(), count);
    }
}

// ============================================================================
// SnapshotStore
// ============================================================================

proptest! {
    #[test]
    fn prop_store_newest_is_the_last_save(
        keys in prop::collection::vec(indexed_frame_strategy(), 1..40),
        capacity in 1usize..10,
    ) {
        let mut memory = VecMemory::new(16);
        let mut store = SnapshotStore::new();
        store
            .allocate(RegionCatalog::from_regions(vec![RegionDescriptor::new(0, 16)]), capacity)
            .unwrap();

        for key in keys {
            memory.set_u32(0, key.frame);
            store.save(SyncState::new(Phase::InGame, 0, key), &memory).unwrap();

            prop_assert_eq!(store.newest(), Some(key));
            prop_assert!(store.len() <= capacity);
            prop_assert!(store.oldest().is_some_and(|oldest| oldest <= key));
            prop_assert!(store.check_invariants().is_ok());
        }
    }
}
