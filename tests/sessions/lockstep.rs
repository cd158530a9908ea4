//! Two netplay peers simulating the same match.
//!
//! Every test wires a host and a client through a pair of
//! [`ChaosLink`](rollback_netplay::ChaosLink)s and checks that both sides
//! simulated identical frames.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::{
    connect, init_tracing, run_for, scripted_input, settled_end, Pair, MATCH_INDEX,
};
use rollback_netplay::{
    ChaosConfig, InputSample, NetplayConfig, NetplayEvent, Phase, Player, WARMUP_FRAMES,
};

/// Checks that both peers agree on every settled frame and that each player's
/// input arrived `delay` frames after it was scripted.
fn assert_agreement(pair: &Pair, end: u32, delay: u32) {
    let host = pair.host.records_before(end);
    let client = pair.client.records_before(end);
    assert_eq!(host.len(), end as usize, "host skipped frames");
    assert_eq!(host, client, "peers desynced before frame {end}");

    for (frame, record) in &host {
        if *frame < WARMUP_FRAMES {
            assert_eq!(record.inputs, [InputSample::NONE; 2], "warmup frame {frame}");
            continue;
        }
        for player in Player::BOTH {
            assert_eq!(
                record.inputs[player.slot()],
                scripted_input(player, frame - delay),
                "{player} at frame {frame}"
            );
        }
    }
}

// ============================================================================
// Delay-based netcode
// ============================================================================

#[test]
fn delay_peers_agree_over_a_perfect_link() {
    init_tracing();
    let mut pair = connect(NetplayConfig::lan(), &ChaosConfig::passthrough());
    run_for(&mut pair, 300);

    let end = settled_end(&pair, 2);
    assert!(end > 100, "only {end} frames simulated");
    assert_agreement(&pair, end, 1);

    assert_eq!(pair.host.rollbacks + pair.client.rollbacks, 0);
    assert_eq!(pair.client.session.sync().remote_index(), MATCH_INDEX);
    assert_eq!(pair.host.session.sync().remote_index(), MATCH_INDEX);
}

#[test]
fn delay_peers_agree_over_a_bad_link() {
    init_tracing();
    let chaos = ChaosConfig::builder()
        .latency_ticks(1)
        .jitter_ticks(2)
        .loss_rate(0.1)
        .duplication_rate(0.05)
        .reorder(4, 0.2)
        .seed(7)
        .build();
    let mut pair = connect(NetplayConfig::lan(), &chaos);
    run_for(&mut pair, 1500);

    let end = settled_end(&pair, 2);
    assert!(end > 50, "only {end} frames simulated");
    assert_agreement(&pair, end, 1);
    assert!(pair.to_client.stats().packets_dropped > 0);
}

#[test]
fn a_silent_peer_stalls_the_match() {
    let mut pair = connect(NetplayConfig::lan(), &ChaosConfig::lossy(1.0));
    run_for(&mut pair, 100);

    // Neither side has heard that the other even reached the match.
    for peer in [&pair.host, &pair.client] {
        assert_eq!(peer.frame(), 0);
        assert_eq!(peer.stalls, 100);
        assert!(peer.log.is_empty());
    }
    assert!(pair.host.session.channel().pending_len() > 0);
}

#[test]
fn client_waits_for_the_match_rng_state() {
    // Only the host's first packets are lost: the rng state is delivered by a
    // retransmit later on.
    let mut pair = connect(NetplayConfig::lan(), &ChaosConfig::passthrough());
    pair.host.session.flush(&mut rollback_netplay::ChaosLink::new(ChaosConfig::lossy(1.0)));
    run_for(&mut pair, 200);

    let end = settled_end(&pair, 2);
    assert!(end > 50, "only {end} frames simulated");
    assert_agreement(&pair, end, 1);
    assert!(pair
        .client
        .session
        .events()
        .any(|event| event == NetplayEvent::RngStateReceived { index: MATCH_INDEX }));
}

// ============================================================================
// Rollback netcode
// ============================================================================

#[test]
fn rollback_peers_converge_after_mispredictions() {
    init_tracing();
    let chaos = ChaosConfig::builder()
        .latency_ticks(2)
        .jitter_ticks(3)
        .loss_rate(0.05)
        .seed(11)
        .build();
    let config = NetplayConfig::rollback();
    let mut pair = connect(config, &chaos);
    run_for(&mut pair, 800);

    let end = settled_end(&pair, 8);
    assert!(end > 100, "only {end} frames simulated");
    assert_agreement(&pair, end, u32::from(config.rollback_delay));
    assert!(
        pair.host.rollbacks + pair.client.rollbacks > 0,
        "latency should force at least one misprediction"
    );
    assert!(pair.host.session.snapshots().len() <= 16);
}

#[test]
fn rollback_runs_ahead_of_the_peer() {
    let chaos = ChaosConfig::builder().latency_ticks(6).seed(3).build();
    let config = NetplayConfig::rollback();
    let mut pair = connect(config, &chaos);
    run_for(&mut pair, 200);

    // One-way latency of seven ticks would stall delay-based netcode on
    // almost every frame; prediction keeps both sides moving.
    let end = settled_end(&pair, 8);
    assert!(end > 40, "only {end} frames simulated");
    assert_agreement(&pair, end, u32::from(config.rollback_delay));
}

// ============================================================================
// Retry menu
// ============================================================================

#[test]
fn retry_menu_choice_is_agreed_over_the_wire() {
    let mut pair = connect(NetplayConfig::lan(), &ChaosConfig::passthrough());
    run_for(&mut pair, 60);

    for peer in [&mut pair.host, &mut pair.client] {
        peer.session.set_phase(Phase::Skippable).unwrap();
        peer.session.set_phase(Phase::RetryMenu).unwrap();
    }
    let retry_index = MATCH_INDEX + 2;
    pair.host.session.share_rng_state(vec![9]).unwrap();

    pair.host.session.sync_mut().host_mut().menu_index = 0;
    pair.client.session.sync_mut().host_mut().menu_index = 1;
    for peer in [&mut pair.host, &mut pair.client] {
        peer.session.sync_mut().host_mut().confirm = rollback_netplay::MenuConfirmState::Confirmed;
    }
    run_for(&mut pair, 30);

    for peer in [&pair.host, &pair.client] {
        let sync = peer.session.sync();
        assert_eq!(sync.index(), retry_index);
        assert_eq!(sync.retry_menu_index(retry_index), Some(1));
        assert_eq!(sync.menu_target(), Some(1));
    }
}
