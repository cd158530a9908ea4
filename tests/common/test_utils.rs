//! Two netplay peers joined by simulated links, and the loop that drives them.
//!
//! Each [`Peer`] runs the stub game from [`super::stubs`]: the clock and an
//! accumulator live in snapshot-covered memory, so a rollback rewinds both.
//! Every simulated frame the accumulator absorbs both players' inputs, which
//! makes any desync visible in [`Peer::log`].

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::collections::BTreeMap;

use rollback_netplay::{
    ChannelConfig, ChaosConfig, ChaosLink, IndexedFrame, InputSample, NetplayConfig,
    NetplayError, NetplayMessage, NetplaySession, Phase, Player, RegionCatalog,
    RegionDescriptor, SnapshotConfig,
};

use super::stubs::{scripted_input, HostStub, VecMemory, GAME_MEMORY_SIZE};

/// Epoch of the match after `Initial -> CharaSelect -> Loading -> InGame`.
pub const MATCH_INDEX: u32 = 3;

const CLOCK: usize = 0;
const ACCUMULATOR: usize = 4;

/// Installs a test-friendly tracing subscriber once per binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// One direction of the network between two peers.
pub type Link = ChaosLink<NetplayMessage>;

/// What a peer saw on one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRecord {
    pub inputs: [InputSample; 2],
    pub accumulator: u32,
}

/// A netplay participant plus the memory of the game it drives.
pub struct Peer {
    pub session: NetplaySession<HostStub, u32>,
    pub memory: VecMemory,
    /// Newest simulation of each frame of the match epoch.
    pub log: BTreeMap<u32, FrameRecord>,
    pub rollbacks: usize,
    pub stalls: usize,
}

impl Peer {
    /// Creates a peer; rollback configs get a snapshot pool over the game memory.
    pub fn new(config: NetplayConfig) -> Self {
        let mut session =
            NetplaySession::new(HostStub::default(), config, ChannelConfig::default()).unwrap();
        if config.has_rollback() {
            session
                .allocate_snapshots(
                    RegionCatalog::from_regions(vec![RegionDescriptor::new(0, GAME_MEMORY_SIZE)]),
                    &SnapshotConfig::minimal(),
                )
                .unwrap();
        }
        Self {
            session,
            memory: VecMemory::new(GAME_MEMORY_SIZE),
            log: BTreeMap::new(),
            rollbacks: 0,
            stalls: 0,
        }
    }

    /// Walks the menus straight into a match.
    pub fn enter_match(&mut self) {
        for phase in [Phase::Initial, Phase::CharaSelect, Phase::Loading, Phase::InGame] {
            self.session.set_phase(phase).unwrap();
        }
        assert_eq!(self.session.sync().index(), MATCH_INDEX);
    }

    pub fn local_player(&self) -> Player {
        self.session.sync().local_player()
    }

    /// Current frame of the match epoch.
    pub fn frame(&self) -> u32 {
        self.session.sync().frame()
    }

    fn sync_clock_from_memory(&mut self) {
        let clock = self.memory.u32_at(CLOCK);
        self.session.sync_mut().host_mut().time = clock;
        self.session.sync_mut().update_frame();
    }

    /// Tries to simulate the current frame. Returns `false` on a stall.
    pub fn simulate(&mut self) -> bool {
        let frame = self.session.sync().frame();
        let local = self.local_player();
        self.session.sync_mut().host_mut().raw[local.slot()] = scripted_input(local, frame);

        match self.session.advance_frame(&self.memory) {
            Ok(inputs) => {
                let accumulator = self
                    .memory
                    .u32_at(ACCUMULATOR)
                    .wrapping_mul(31)
                    .wrapping_add(u32::from(inputs[0].raw()) * 7)
                    .wrapping_add(u32::from(inputs[1].raw()));
                self.memory.set_u32(ACCUMULATOR, accumulator);
                self.memory.set_u32(CLOCK, self.memory.u32_at(CLOCK) + 1);
                self.sync_clock_from_memory();
                self.log.insert(frame, FrameRecord { inputs, accumulator });
                true
            },
            Err(NetplayError::NotReady { .. }) => {
                self.stalls += 1;
                false
            },
            Err(err) => panic!("advance_frame failed at {frame}: {err}"),
        }
    }

    /// Rewinds if a correction is pending and re-simulates back to where the
    /// game was.
    pub fn rollback_and_catch_up(&mut self) {
        let before = self.frame();
        let Some(restored) = self.session.rollback(&mut self.memory).unwrap() else {
            return;
        };
        self.rollbacks += 1;
        self.sync_clock_from_memory();
        assert_eq!(self.session.sync().indexed_frame(), restored);
        while self.frame() < before {
            if !self.simulate() {
                break;
            }
        }
    }

    /// Everything this peer saw for frames `..end`.
    pub fn records_before(&self, end: u32) -> Vec<(u32, FrameRecord)> {
        self.log.range(..end).map(|(f, r)| (*f, *r)).collect()
    }
}

/// A host and a client in the match epoch, and the links between them.
pub struct Pair {
    pub host: Peer,
    pub client: Peer,
    pub to_client: Link,
    pub to_host: Link,
}

/// Builds a host/client pair over links with `chaos`, already in a match.
///
/// The host shares the match RNG state so the client may start simulating.
pub fn connect(config: NetplayConfig, chaos: &ChaosConfig) -> Pair {
    let mut host = Peer::new(config);
    let mut client = Peer::new(config.with_role(rollback_netplay::Role::Client));
    host.enter_match();
    client.enter_match();
    host.session.share_rng_state(vec![0x5e, 0xed]).unwrap();

    let mut reverse = chaos.clone();
    reverse.seed = chaos.seed.wrapping_add(1);
    Pair {
        host,
        client,
        to_client: ChaosLink::new(chaos.clone()),
        to_host: ChaosLink::new(reverse),
    }
}

/// Runs `ticks` iterations of receive, rollback, simulate, retransmit, send.
pub fn run_for(pair: &mut Pair, ticks: usize) {
    for _ in 0..ticks {
        for packet in pair.to_client.advance() {
            pair.client.session.handle_packet(packet);
        }
        for packet in pair.to_host.advance() {
            pair.host.session.handle_packet(packet);
        }

        for peer in [&mut pair.host, &mut pair.client] {
            peer.rollback_and_catch_up();
            peer.simulate();
            peer.session.on_tick();
        }

        pair.host.session.flush(&mut pair.to_client);
        pair.client.session.flush(&mut pair.to_host);
    }
}

/// Frames both peers have simulated far enough behind their current frame
/// that no correction can still be in flight.
pub fn settled_end(pair: &Pair, margin: u32) -> u32 {
    pair.host
        .frame()
        .min(pair.client.frame())
        .saturating_sub(margin)
}

pub fn match_frame(frame: u32) -> IndexedFrame {
    IndexedFrame::new(MATCH_INDEX, frame)
}
