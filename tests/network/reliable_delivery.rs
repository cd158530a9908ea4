//! Reliable channel behavior over simulated bad networks.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::init_tracing;
use rollback_netplay::{ChannelConfig, ChannelEvent, ChaosConfig, ChaosLink, ReliableChannel};
use serde::{de::DeserializeOwned, Serialize};
use web_time::Duration;

/// Two channels and the links between them.
struct Wire<M> {
    a: ReliableChannel<M>,
    b: ReliableChannel<M>,
    a_to_b: ChaosLink<M>,
    b_to_a: ChaosLink<M>,
    received_by_b: Vec<M>,
    timeouts: [usize; 2],
}

impl<M> Wire<M>
where
    M: Clone + Serialize + DeserializeOwned,
{
    fn new(config: ChannelConfig, chaos: &ChaosConfig) -> Self {
        let mut reverse = chaos.clone();
        reverse.seed = chaos.seed.wrapping_add(1);
        Self {
            a: ReliableChannel::new(config),
            b: ReliableChannel::new(config),
            a_to_b: ChaosLink::new(chaos.clone()),
            b_to_a: ChaosLink::new(reverse),
            received_by_b: Vec::new(),
            timeouts: [0; 2],
        }
    }

    fn tick(&mut self) {
        for packet in self.a_to_b.advance() {
            self.b.recv(packet);
        }
        for packet in self.b_to_a.advance() {
            self.a.recv(packet);
        }

        self.a.on_tick();
        self.b.on_tick();

        for event in self.a.events() {
            if matches!(event, ChannelEvent::TimedOut) {
                self.timeouts[0] += 1;
            }
        }
        for event in self.b.events() {
            match event {
                ChannelEvent::Delivered(message) => self.received_by_b.push(message),
                ChannelEvent::TimedOut => self.timeouts[1] += 1,
                ChannelEvent::Unreliable(_) => {},
            }
        }

        self.a.send_all_packets(&mut self.a_to_b);
        self.b.send_all_packets(&mut self.b_to_a);
    }

    /// Ticks until A has nothing outstanding, or `limit` runs out.
    fn settle(&mut self, limit: usize) -> usize {
        for tick in 0..limit {
            if self.a.pending_len() == 0 {
                return tick;
            }
            self.tick();
        }
        panic!(
            "still {} packets outstanding after {limit} ticks",
            self.a.pending_len()
        );
    }
}

// ============================================================================
// Ordering and exactly-once delivery
// ============================================================================

#[test]
fn delivers_in_order_exactly_once_over_terrible_network() {
    init_tracing();
    for seed in [1, 2, 3] {
        let chaos = ChaosConfig {
            seed,
            ..ChaosConfig::terrible_network()
        };
        let mut wire: Wire<u32> = Wire::new(ChannelConfig::default(), &chaos);

        for value in 0..100 {
            wire.a.send(value).unwrap();
            if value % 2 == 1 {
                wire.tick();
            }
        }
        wire.settle(10_000);

        assert_eq!(wire.received_by_b, (0..100).collect::<Vec<_>>(), "seed {seed}");
        assert_eq!(wire.a.ack_sequence(), 100);
        assert_eq!(wire.b.recv_sequence(), 100);
        assert!(wire.a_to_b.stats().packets_dropped > 0, "seed {seed} dropped nothing");
    }
}

#[test]
fn duplicates_are_delivered_once() {
    let chaos = ChaosConfig::builder()
        .duplication_rate(0.9)
        .jitter_ticks(3)
        .seed(5)
        .build();
    let mut wire: Wire<u32> = Wire::new(ChannelConfig::default(), &chaos);
    for value in 0..40 {
        wire.a.send(value).unwrap();
        wire.tick();
    }
    wire.settle(2_000);

    assert_eq!(wire.received_by_b, (0..40).collect::<Vec<_>>());
    assert!(wire.a_to_b.stats().packets_duplicated > 0);
}

#[test]
fn unreliable_messages_bypass_the_stream() {
    let mut wire: Wire<u32> = Wire::new(ChannelConfig::default(), &ChaosConfig::passthrough());
    wire.a.send_unreliable(7);
    wire.a.send_all_packets(&mut wire.a_to_b);
    for packet in wire.a_to_b.advance() {
        wire.b.recv(packet);
    }

    assert_eq!(
        wire.b.events().collect::<Vec<_>>(),
        vec![ChannelEvent::Unreliable(7)]
    );
    assert_eq!(wire.b.recv_sequence(), 0);
    assert_eq!(wire.a.pending_len(), 0);
}

// ============================================================================
// Fragmentation
// ============================================================================

#[test]
fn oversized_messages_survive_loss_in_fragments() {
    let config = ChannelConfig {
        mtu: 32,
        ..ChannelConfig::default()
    };
    let chaos = ChaosConfig::builder().loss_rate(0.2).seed(9).build();
    let mut wire: Wire<Vec<u8>> = Wire::new(config, &chaos);

    let big: Vec<u8> = (0..500).map(|i| (i * 7 % 251) as u8).collect();
    wire.a.send(vec![1, 2, 3]).unwrap();
    wire.a.send(big.clone()).unwrap();
    wire.a.send(vec![4]).unwrap();
    assert!(wire.a.send_sequence() > 3, "500 bytes should not fit one packet");

    wire.settle(5_000);
    assert_eq!(wire.received_by_b, vec![vec![1, 2, 3], big, vec![4]]);
}

// ============================================================================
// Keepalive
// ============================================================================

#[test]
fn silence_times_out_once() {
    let config = ChannelConfig {
        send_interval: Duration::from_millis(50),
        keep_alive: Some(Duration::from_millis(100)),
        ..ChannelConfig::default()
    };
    let mut wire: Wire<u32> = Wire::new(config, &ChaosConfig::lossy(1.0));
    wire.a.send(1).unwrap();
    for _ in 0..20 {
        wire.tick();
    }

    assert_eq!(wire.timeouts[0], 1);
    assert!(!wire.a.is_timer_running());
    // B never heard anything, so its timer never started.
    assert_eq!(wire.timeouts[1], 0);
}

#[test]
fn keepalives_hold_an_idle_link_open() {
    let config = ChannelConfig {
        send_interval: Duration::from_millis(50),
        keep_alive: Some(Duration::from_millis(100)),
        ..ChannelConfig::default()
    };
    let mut wire: Wire<u32> = Wire::new(config, &ChaosConfig::passthrough());
    wire.a.send(1).unwrap();
    for _ in 0..200 {
        wire.tick();
    }

    assert_eq!(wire.timeouts, [0, 0]);
    assert_eq!(wire.received_by_b, vec![1]);
    assert!(wire.a.is_timer_running());
    assert!(wire.b.is_timer_running());
}
