//! A broadcast match streamed to spectators.
//!
//! The broadcaster plays both sides locally; each spectator rebuilds the
//! match from [`SpectatorMessage`]s alone and must see the same inputs on
//! every frame.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::collections::BTreeMap;

use crate::common::{init_tracing, scripted_input, HostStub, VecMemory};
use rollback_netplay::{
    ChannelConfig, InputSample, NetplayConfig, NetplayError, NetplayEvent, NetplaySession, Phase,
    Player, Role, SpectatorMessage, SpectatorTransport,
};

type Session = NetplaySession<HostStub, u32>;

/// Epoch of the match after `Loading -> Skippable -> InGame`.
const MATCH_INDEX: u32 = 4;

#[derive(Default)]
struct Fanout {
    queue: Vec<(u32, SpectatorMessage)>,
}

impl SpectatorTransport<u32> for Fanout {
    fn send(&mut self, observer: &u32, message: &SpectatorMessage) {
        self.queue.push((*observer, message.clone()));
    }
}

impl Fanout {
    fn deliver(&mut self, observer: u32, spectator: &mut Session) {
        let (mine, rest): (Vec<_>, Vec<_>) =
            self.queue.drain(..).partition(|(to, _)| *to == observer);
        self.queue = rest;
        for (_, message) in mine {
            spectator.handle_spectator_message(message);
        }
    }
}

struct Station {
    session: Session,
    memory: VecMemory,
    log: BTreeMap<u32, [InputSample; 2]>,
}

impl Station {
    fn new(config: NetplayConfig) -> Self {
        Self {
            session: NetplaySession::new(HostStub::default(), config, ChannelConfig::default())
                .unwrap(),
            memory: VecMemory::new(4),
            log: BTreeMap::new(),
        }
    }

    fn frame(&self) -> u32 {
        self.session.sync().frame()
    }

    /// Simulates one frame; both players come from the local controllers.
    fn step(&mut self) -> bool {
        let frame = self.frame();
        for player in Player::BOTH {
            self.session.sync_mut().host_mut().raw[player.slot()] = scripted_input(player, frame);
        }
        match self.session.advance_frame(&self.memory) {
            Ok(inputs) => {
                if self.session.sync().phase() == Phase::InGame {
                    self.log.insert(frame, inputs);
                }
                self.session.sync_mut().host_mut().time += 1;
                self.session.sync_mut().update_frame();
                true
            },
            Err(NetplayError::NotReady { .. }) => false,
            Err(err) => panic!("advance_frame failed at {frame}: {err}"),
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.session.set_phase(phase).unwrap();
        if self.session.sync().config().role == Role::Broadcast {
            let index = self.session.sync().index();
            self.session.share_rng_state(vec![index as u8]).unwrap();
        }
    }
}

fn broadcaster() -> Station {
    let config = NetplayConfig {
        role: Role::Broadcast,
        delay: 2,
        ..NetplayConfig::default()
    };
    let mut broadcaster = Station::new(config);
    broadcaster.enter(Phase::Initial);
    broadcaster.enter(Phase::CharaSelect);
    broadcaster.enter(Phase::Loading);
    for _ in 0..5 {
        assert!(broadcaster.step());
    }
    broadcaster
}

fn spectator() -> Station {
    Station::new(NetplayConfig::default().with_role(Role::SpectateNetplay))
}

/// Follows the broadcaster into the match once the join message has arrived.
fn follow_into_match(spectator: &mut Station) {
    for phase in [
        Phase::Initial,
        Phase::AutoCharaSelect,
        Phase::Loading,
        Phase::Skippable,
        Phase::InGame,
    ] {
        spectator.enter(phase);
    }
    assert_eq!(spectator.session.sync().index(), MATCH_INDEX);
}

/// Runs both sides for `ticks`, streaming to observer `id`.
fn stream(broadcaster: &mut Station, spectator: &mut Station, fanout: &mut Fanout, id: u32, ticks: usize) {
    for _ in 0..ticks {
        assert!(broadcaster.step());
        broadcaster.session.tick_spectators(fanout);
        fanout.deliver(id, &mut spectator.session);
        spectator.step();
    }
}

fn assert_replayed(broadcaster: &Station, spectator: &Station, at_least: usize) {
    let watched: Vec<_> = spectator.log.iter().collect();
    assert!(
        watched.len() >= at_least,
        "spectator only reached frame {}",
        spectator.frame()
    );
    for (frame, inputs) in watched {
        assert_eq!(
            broadcaster.log.get(frame),
            Some(inputs),
            "spectator diverged at frame {frame}"
        );
    }
}

// ============================================================================
// Streaming
// ============================================================================

#[test]
fn spectator_from_loading_sees_the_whole_match() {
    init_tracing();
    let mut broadcaster = broadcaster();
    let mut fanout = Fanout::default();
    broadcaster.session.add_spectator(7, &mut fanout);

    broadcaster.enter(Phase::Skippable);
    for _ in 0..3 {
        assert!(broadcaster.step());
    }
    broadcaster.enter(Phase::InGame);

    let mut spectator = spectator();
    fanout.deliver(7, &mut spectator.session);
    assert_eq!(spectator.session.sync().delay(), 2);
    follow_into_match(&mut spectator);

    stream(&mut broadcaster, &mut spectator, &mut fanout, 7, 400);

    assert_replayed(&broadcaster, &spectator, 250);
    assert_eq!(spectator.log.keys().next(), Some(&0));
    // Warmup and delay apply on the spectator exactly as on the broadcaster.
    assert_eq!(spectator.log[&0], [InputSample::NONE; 2]);
    assert_eq!(
        spectator.log[&20],
        [
            scripted_input(Player::One, 18),
            scripted_input(Player::Two, 18)
        ]
    );
}

#[test]
fn late_spectator_catches_the_match_rng_at_join() {
    let mut broadcaster = broadcaster();
    broadcaster.enter(Phase::Skippable);
    for _ in 0..3 {
        assert!(broadcaster.step());
    }
    broadcaster.enter(Phase::InGame);
    for _ in 0..100 {
        assert!(broadcaster.step());
    }

    let mut fanout = Fanout::default();
    broadcaster.session.add_spectator(9, &mut fanout);
    let mut spectator = spectator();
    fanout.deliver(9, &mut spectator.session);
    assert!(spectator
        .session
        .events()
        .any(|event| event == NetplayEvent::RngStateReceived { index: MATCH_INDEX }));

    follow_into_match(&mut spectator);
    stream(&mut broadcaster, &mut spectator, &mut fanout, 9, 300);

    // Starts at the beginning of the match, well behind live.
    assert_eq!(spectator.log.keys().next(), Some(&0));
    assert_replayed(&broadcaster, &spectator, 150);
    assert!(spectator.frame() < broadcaster.frame());
}

#[test]
fn watermark_tracks_the_audience() {
    let mut broadcaster = broadcaster();
    let mut fanout = Fanout::default();
    assert_eq!(broadcaster.session.sync().preserve_start_index(), u32::MAX);

    broadcaster.session.add_spectator(1, &mut fanout);
    broadcaster.session.add_spectator(2, &mut fanout);
    assert_eq!(broadcaster.session.sync().preserve_start_index(), 2);

    broadcaster.enter(Phase::Skippable);
    broadcaster.enter(Phase::InGame);
    for _ in 0..120 {
        assert!(broadcaster.step());
        broadcaster.session.tick_spectators(&mut fanout);
    }
    // Both cursors have moved into the match epoch.
    assert_eq!(broadcaster.session.sync().preserve_start_index(), MATCH_INDEX);

    assert!(broadcaster.session.remove_spectator(&1));
    assert!(broadcaster.session.remove_spectator(&2));
    assert!(!broadcaster.session.remove_spectator(&2));
    broadcaster.session.tick_spectators(&mut fanout);
    assert_eq!(broadcaster.session.sync().preserve_start_index(), u32::MAX);
    assert!(broadcaster.session.spectators().is_empty());
}
