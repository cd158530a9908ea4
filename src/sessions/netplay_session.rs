//! One netplay participant: a [`SyncManager`], its reliable channel to the
//! peer, an optional rollback [`SnapshotStore`] and a spectator fan-out.
//!
//! Per tick the owner calls [`NetplaySession::handle_packet`] for every
//! received datagram, [`NetplaySession::rollback`] and then
//! [`NetplaySession::advance_frame`], and finally
//! [`NetplaySession::flush`] and [`NetplaySession::tick_spectators`]. The
//! channel's retransmit timer is driven separately through
//! [`NetplaySession::on_tick`].

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::config::{ChannelConfig, NetplayConfig, Role, SnapshotConfig};
use crate::network::messages::{
    MenuIndex, NetplayMessage, RngState, SpectatorMessage, TransitionIndex,
};
use crate::network::reliable_channel::{ChannelEvent, ChannelPacket, ReliableChannel};
use crate::sessions::spectator_broadcaster::SpectatorBroadcaster;
use crate::snapshot_store::region::{MemoryAccessor, RegionCatalog};
use crate::snapshot_store::SnapshotStore;
use crate::sync_manager::{HostBindings, Phase, SyncManager};
use crate::{IndexedFrame, InputSample, NetplayError, Player, SpectatorTransport, Transport};

/// Notifications for the session owner, drained with
/// [`NetplaySession::events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetplayEvent {
    /// The peer announced that it entered a new epoch.
    RemoteEpoch {
        /// The peer's new epoch.
        index: u32,
    },
    /// An RNG state arrived and is available through
    /// [`SyncManager::rng_state`].
    RngStateReceived {
        /// Epoch the state belongs to.
        index: u32,
    },
    /// The peer's retry menu choice for the current epoch arrived.
    RemoteMenuIndex {
        /// The peer's choice.
        menu_index: u8,
    },
    /// Nothing was heard from the peer for the keepalive period.
    PeerTimedOut,
}

/// A netplay participant (or spectator) and everything it talks to.
///
/// `O` identifies spectators connected to this process.
pub struct NetplaySession<H, O> {
    sync: SyncManager<H>,
    channel: ReliableChannel<NetplayMessage>,
    snapshots: SnapshotStore,
    spectators: SpectatorBroadcaster<O>,
    events: VecDeque<NetplayEvent>,
    sent_local_menu_index: bool,
}

impl<H: std::fmt::Debug, O: std::fmt::Debug> std::fmt::Debug for NetplaySession<H, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetplaySession")
            .field("sync", &self.sync)
            .field("channel", &self.channel)
            .field("snapshots", &self.snapshots.len())
            .field("spectators", &self.spectators)
            .finish_non_exhaustive()
    }
}

impl<H: HostBindings, O: Ord + Clone> NetplaySession<H, O> {
    /// Creates a session without snapshots.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::ConfigValueOutOfRange`] if either configuration
    /// is invalid.
    pub fn new(
        host: H,
        config: NetplayConfig,
        channel_config: ChannelConfig,
    ) -> Result<Self, NetplayError> {
        channel_config.validate()?;
        let sync = SyncManager::new(host, config)?;
        debug!(role = ?config.role, local = %sync.local_player(), "netplay session created");

        Ok(Self {
            sync,
            channel: ReliableChannel::new(channel_config),
            snapshots: SnapshotStore::new(),
            spectators: SpectatorBroadcaster::new(),
            events: VecDeque::new(),
            sent_local_menu_index: false,
        })
    }

    /// Sizes the rollback snapshot pool. Without this, rollback is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid `config` or catalog.
    pub fn allocate_snapshots(
        &mut self,
        catalog: RegionCatalog,
        config: &SnapshotConfig,
    ) -> Result<(), NetplayError> {
        self.snapshots.allocate_with_config(catalog, config)
    }

    /// The sync manager.
    pub fn sync(&self) -> &SyncManager<H> {
        &self.sync
    }

    /// The sync manager, mutably.
    ///
    /// Phase changes should go through [`NetplaySession::set_phase`] so the
    /// peer hears about new epochs.
    pub fn sync_mut(&mut self) -> &mut SyncManager<H> {
        &mut self.sync
    }

    /// The channel to the peer.
    pub fn channel(&self) -> &ReliableChannel<NetplayMessage> {
        &self.channel
    }

    /// The rollback snapshot store.
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// The spectator fan-out.
    pub fn spectators(&self) -> &SpectatorBroadcaster<O> {
        &self.spectators
    }

    /// Drains events in the order they happened.
    pub fn events(&mut self) -> Drain<'_, NetplayEvent> {
        self.events.drain(..)
    }

    fn is_netplay(&self) -> bool {
        self.sync.config().role.is_netplay()
    }

    // ###############
    // # PHASES      #
    // ###############

    /// Moves the sync manager to `next` and announces a new epoch to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidPhaseTransition`] for a transition
    /// outside the table, or a serialization error from the channel.
    pub fn set_phase(&mut self, next: Phase) -> Result<(), NetplayError> {
        let previous = self.sync.index();
        self.sync.set_phase(next)?;

        if self.sync.index() != previous {
            self.sent_local_menu_index = false;
            if self.is_netplay() {
                let index = self.sync.index();
                trace!(index, "announcing epoch");
                self.channel
                    .send(NetplayMessage::TransitionIndex(TransitionIndex { index }))?;
            }
        }
        Ok(())
    }

    /// Records the host's RNG state for the current epoch and, on the host,
    /// sends it to the peer. Spectators pick it up on their next service.
    ///
    /// # Errors
    ///
    /// Returns a serialization error from the channel.
    pub fn share_rng_state(&mut self, bytes: Vec<u8>) -> Result<(), NetplayError> {
        let state = RngState {
            index: self.sync.index(),
            bytes,
        };
        self.sync.set_rng_state(state.clone());
        if self.sync.config().role == Role::Host {
            debug!(index = state.index, "sharing rng state");
            self.channel.send(NetplayMessage::RngState(state))?;
        }
        Ok(())
    }

    // ###############
    // # NETWORK     #
    // ###############

    /// Feeds one datagram from the peer into the channel and applies what it
    /// delivers.
    pub fn handle_packet(&mut self, packet: ChannelPacket<NetplayMessage>) {
        self.channel.recv(packet);
        self.drain_channel();
    }

    /// Advances the channel's retransmit timer by one interval.
    pub fn on_tick(&mut self) {
        self.channel.on_tick();
        self.drain_channel();
    }

    /// Hands every queued packet to `transport`.
    pub fn flush<T>(&mut self, transport: &mut T)
    where
        T: Transport<NetplayMessage> + ?Sized,
    {
        self.channel.send_all_packets(transport);
    }

    fn drain_channel(&mut self) {
        let events: Vec<_> = self.channel.events().collect();
        for event in events {
            match event {
                ChannelEvent::Delivered(message) | ChannelEvent::Unreliable(message) => {
                    self.apply(message);
                },
                ChannelEvent::TimedOut => {
                    debug!(frame = %self.sync.indexed_frame(), "peer timed out");
                    self.events.push_back(NetplayEvent::PeerTimedOut);
                },
            }
        }
    }

    fn apply(&mut self, message: NetplayMessage) {
        match message {
            NetplayMessage::PlayerInputs(batch) => {
                let remote = self.sync.remote_player();
                self.sync.set_inputs(remote, &batch);
            },
            NetplayMessage::RngState(state) => {
                let index = state.index;
                self.sync.set_rng_state(state);
                self.events.push_back(NetplayEvent::RngStateReceived { index });
            },
            NetplayMessage::MenuIndex(MenuIndex { index, menu_index }) => {
                if index == self.sync.index() {
                    self.sync.set_remote_retry_menu_index(menu_index);
                    self.events
                        .push_back(NetplayEvent::RemoteMenuIndex { menu_index });
                } else {
                    trace!(index, local = self.sync.index(), "stale retry menu choice");
                }
            },
            NetplayMessage::TransitionIndex(TransitionIndex { index }) => {
                self.sync.set_remote_index(index);
                self.events.push_back(NetplayEvent::RemoteEpoch { index });
            },
        }
    }

    /// Applies one message from a broadcaster, as a spectator.
    pub fn handle_spectator_message(&mut self, message: SpectatorMessage) {
        match message {
            SpectatorMessage::InitialGameState(initial) => {
                debug!(start = %initial.indexed_frame, phase = %initial.phase, "initial game state");
                self.sync.set_initial_game_state(initial);
            },
            SpectatorMessage::BothInputs(batch) => self.sync.set_both_inputs(&batch),
            SpectatorMessage::RngState(state) => {
                let index = state.index;
                self.sync.set_rng_state(state);
                self.events.push_back(NetplayEvent::RngStateReceived { index });
            },
            SpectatorMessage::MenuIndex(MenuIndex { index, menu_index }) => {
                self.sync.set_retry_menu_index(index, menu_index);
            },
        }
    }

    // ###############
    // # FRAMES      #
    // ###############

    /// Runs the sync side of one simulation tick and returns both players'
    /// inputs.
    ///
    /// Local samples are recorded and the newest batch is queued for the peer
    /// before readiness is checked, so two waiting peers never starve each
    /// other. With rollback active a snapshot is saved after the inputs are
    /// decided.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::NotReady`] while the remote input or RNG state
    /// for this tick is missing; the caller should not simulate and retry on
    /// the next tick. Snapshot and channel errors are propagated.
    pub fn advance_frame(
        &mut self,
        memory: &dyn MemoryAccessor,
    ) -> Result<[InputSample; 2], NetplayError> {
        self.sync.update_frame();

        let role = self.sync.config().role;
        if role.is_local() {
            for player in Player::BOTH {
                let input = self.sync.host().raw_input(player);
                self.sync.set_input(player, input);
            }
        } else if role.is_netplay() {
            let local = self.sync.local_player();
            let input = self.sync.host().raw_input(local);
            self.sync.set_input(local, input);

            if let Some(batch) = self.sync.inputs_message(local) {
                self.channel.send_unreliable(NetplayMessage::PlayerInputs(batch));
            }
        }

        if !self.sync.is_remote_input_ready() || !self.sync.is_rng_state_ready(true) {
            return Err(NetplayError::NotReady {
                local: self.sync.indexed_frame(),
                remote: self.sync.remote_indexed_frame(),
            });
        }

        let inputs = [
            self.sync.get_input(Player::One),
            self.sync.get_input(Player::Two),
        ];

        if self.sync.is_in_rollback() && self.snapshots.is_allocated() {
            self.snapshots.save(self.sync.capture_state(), memory)?;
        }

        if role.is_netplay() && !self.sent_local_menu_index {
            if let Some(choice) = self.sync.local_retry_menu_index() {
                debug!(menu_index = choice.menu_index, "sending retry menu choice");
                self.channel.send(NetplayMessage::MenuIndex(choice))?;
                self.sent_local_menu_index = true;
            }
        }

        Ok(inputs)
    }

    /// Rewinds to before the earliest remote correction, if one is pending
    /// and has already been consumed.
    ///
    /// Returns the restored position; the owner re-simulates forward from
    /// there with [`advance_frame`](Self::advance_frame). `Ok(None)` means
    /// nothing needed rewinding, or no snapshot is old enough.
    ///
    /// # Errors
    ///
    /// Propagates memory accessor failures.
    pub fn rollback(
        &mut self,
        memory: &mut dyn MemoryAccessor,
    ) -> Result<Option<IndexedFrame>, NetplayError> {
        if !self.sync.is_in_rollback() || !self.snapshots.is_allocated() {
            return Ok(None);
        }

        let changed = self.sync.last_changed_frame();
        if changed.is_max() {
            return Ok(None);
        }
        self.sync.clear_last_changed_frame();

        // A sample at `changed` is first read `effective_delay` frames later.
        let target = changed.plus_frames(self.sync.effective_delay());
        if target > self.sync.indexed_frame() {
            trace!(%target, current = %self.sync.indexed_frame(), "correction not consumed yet");
            return Ok(None);
        }

        match self.snapshots.load(target, memory)? {
            Some(state) => {
                debug!(
                    %changed,
                    from = %self.sync.indexed_frame(),
                    to = %state.indexed_frame,
                    "rolling back"
                );
                self.sync.restore_state(state);
                Ok(Some(state.indexed_frame))
            },
            None => {
                debug!(%target, "correction older than snapshot history");
                Ok(None)
            },
        }
    }

    // ###############
    // # SPECTATORS  #
    // ###############

    /// Registers a spectator and sends it where to start.
    pub fn add_spectator(&mut self, observer: O, transport: &mut impl SpectatorTransport<O>) {
        self.spectators.add(observer, &mut self.sync, transport);
    }

    /// Forgets a spectator.
    pub fn remove_spectator(&mut self, observer: &O) -> bool {
        self.spectators.remove(observer)
    }

    /// Streams pending data to the spectators due this tick.
    pub fn tick_spectators(&mut self, transport: &mut impl SpectatorTransport<O>) {
        let world_time = self.sync.host().world_time();
        self.spectators.tick(&mut self.sync, world_time, transport);
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
    use crate::sync_manager::testing::TestHost;
    use crate::{buttons, PlayerInputs, NUM_INPUTS};

    type Session = NetplaySession<TestHost, u32>;

    #[derive(Default)]
    struct Wire {
        packets: Vec<ChannelPacket<NetplayMessage>>,
    }

    impl Transport<NetplayMessage> for Wire {
        fn send_raw(&mut self, packet: &ChannelPacket<NetplayMessage>) {
            self.packets.push(packet.clone());
        }
    }

    struct Ram(Vec<u8>);

    impl MemoryAccessor for Ram {
        fn read(&self, address: usize, buffer: &mut [u8]) -> Result<(), NetplayError> {
            let src = self.0.get(address..address + buffer.len()).ok_or(
                NetplayError::MemoryAccess {
                    address,
                    len: buffer.len(),
                },
            )?;
            buffer.copy_from_slice(src);
            Ok(())
        }

        fn write(&mut self, address: usize, bytes: &[u8]) -> Result<(), NetplayError> {
            let dst = self.0.get_mut(address..address + bytes.len()).ok_or(
                NetplayError::MemoryAccess {
                    address,
                    len: bytes.len(),
                },
            )?;
            dst.copy_from_slice(bytes);
            Ok(())
        }

        fn read_pointer(&self, address: usize) -> Result<usize, NetplayError> {
            let mut raw = [0; 8];
            self.read(address, &mut raw)?;
            Ok(u64::from_le_bytes(raw) as usize)
        }
    }

    fn session(config: NetplayConfig) -> Session {
        NetplaySession::new(TestHost::default(), config, ChannelConfig::default()).unwrap()
    }

    fn to_match(session: &mut Session) {
        for phase in [Phase::Initial, Phase::CharaSelect, Phase::Loading, Phase::InGame] {
            session.set_phase(phase).unwrap();
        }
    }

    fn sent_messages(wire: &Wire) -> Vec<&NetplayMessage> {
        wire.packets
            .iter()
            .filter_map(|packet| match packet {
                ChannelPacket::Data { message, .. } | ChannelPacket::Unreliable(message) => {
                    Some(message)
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn epoch_changes_are_announced() {
        let mut host = session(NetplayConfig::lan());
        to_match(&mut host);
        let mut wire = Wire::default();
        host.flush(&mut wire);

        let announced: Vec<u32> = sent_messages(&wire)
            .into_iter()
            .filter_map(|message| match message {
                NetplayMessage::TransitionIndex(TransitionIndex { index }) => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(announced, vec![1, 2, 3]);
    }

    #[test]
    fn offline_sessions_stay_quiet() {
        let mut offline = session(NetplayConfig::default());
        to_match(&mut offline);
        let ram = Ram(vec![0; 4]);
        offline.advance_frame(&ram).unwrap();
        let mut wire = Wire::default();
        offline.flush(&mut wire);
        assert!(wire.packets.is_empty());
    }

    #[test]
    fn advance_frame_waits_for_remote_but_still_sends() {
        let mut host = session(NetplayConfig::lan());
        to_match(&mut host);
        host.sync_mut().host_mut().time = 20;
        let ram = Ram(vec![0; 4]);

        let err = host.advance_frame(&ram).unwrap_err();
        assert!(matches!(err, NetplayError::NotReady { .. }));

        let mut wire = Wire::default();
        host.flush(&mut wire);
        assert!(sent_messages(&wire)
            .iter()
            .any(|message| matches!(message, NetplayMessage::PlayerInputs(_))));
    }

    #[test]
    fn hostile_batches_are_dropped_without_growing_history() {
        let mut host = session(NetplayConfig::lan());
        to_match(&mut host);
        let index = host.sync().index();

        for last in [u32::MAX, 400_000_000] {
            host.handle_packet(ChannelPacket::Unreliable(NetplayMessage::PlayerInputs(
                PlayerInputs::with_inputs(
                    IndexedFrame::new(index, last),
                    &[InputSample::combine(0, buttons::B); NUM_INPUTS],
                ),
            )));
        }

        let remote = host.sync().remote_player();
        assert!(host.sync().timeline(remote).is_epoch_empty(index));
    }

    #[test]
    fn remote_batches_unblock_the_frame() {
        let mut host = session(NetplayConfig::lan());
        to_match(&mut host);
        let index = host.sync().index();
        host.sync_mut().host_mut().time = 20;
        host.sync_mut().host_mut().raw[0] = InputSample::combine(0, buttons::A);

        let remote = PlayerInputs::with_inputs(
            IndexedFrame::new(index, 20),
            &[InputSample::combine(0, buttons::B); 21],
        );
        host.handle_packet(ChannelPacket::Unreliable(NetplayMessage::PlayerInputs(remote)));

        let ram = Ram(vec![0; 4]);
        let inputs = host.advance_frame(&ram).unwrap();
        // Delay 1: player one's own sample at frame 20 is not due until 21.
        assert_eq!(inputs[0], InputSample::NONE);
        assert_eq!(inputs[1], InputSample::combine(0, buttons::B));
    }

    #[test]
    fn incoming_messages_raise_events() {
        let mut client = session(NetplayConfig::lan().with_role(Role::Client));
        to_match(&mut client);
        let index = client.sync().index();

        client.handle_packet(ChannelPacket::Data {
            sequence: 1,
            message: NetplayMessage::RngState(RngState {
                index,
                bytes: vec![4, 2],
            }),
        });
        client.handle_packet(ChannelPacket::Data {
            sequence: 2,
            message: NetplayMessage::TransitionIndex(TransitionIndex { index: index + 1 }),
        });

        let events: Vec<_> = client.events().collect();
        assert_eq!(
            events,
            vec![
                NetplayEvent::RngStateReceived { index },
                NetplayEvent::RemoteEpoch { index: index + 1 },
            ]
        );
        assert!(client.sync().is_rng_state_ready(true));
        assert_eq!(client.sync().remote_index(), index + 1);
    }

    #[test]
    fn host_shares_rng_state() {
        let mut host = session(NetplayConfig::lan());
        to_match(&mut host);
        host.share_rng_state(vec![1, 2, 3]).unwrap();
        let mut wire = Wire::default();
        host.flush(&mut wire);
        assert!(sent_messages(&wire)
            .iter()
            .any(|message| matches!(message, NetplayMessage::RngState(s) if s.bytes == [1, 2, 3])));
        assert!(host.sync().rng_state(host.sync().index()).is_some());
    }

    #[test]
    fn keepalive_timeout_surfaces_as_event() {
        let channel = ChannelConfig {
            keep_alive: Some(web_time::Duration::from_millis(100)),
            ..ChannelConfig::default()
        };
        let mut host: Session =
            NetplaySession::new(TestHost::default(), NetplayConfig::lan(), channel).unwrap();
        host.set_phase(Phase::Initial).unwrap();
        host.set_phase(Phase::CharaSelect).unwrap();
        for _ in 0..10 {
            host.on_tick();
        }
        assert!(host.events().any(|event| event == NetplayEvent::PeerTimedOut));
    }

    #[test]
    fn rollback_rewinds_to_corrected_frame() {
        let mut host = session(NetplayConfig::rollback());
        host.allocate_snapshots(
            RegionCatalog::from_regions(vec![RegionDescriptor::new(0, 4)]),
            &SnapshotConfig::minimal(),
        )
        .unwrap();
        to_match(&mut host);
        let index = host.sync().index();
        let mut ram = Ram(vec![0; 4]);

        // Predict nothing from the peer for frames 0..=20.
        host.handle_packet(ChannelPacket::Unreliable(NetplayMessage::PlayerInputs(
            PlayerInputs::with_inputs(IndexedFrame::new(index, 20), &[InputSample::NONE; 21]),
        )));
        for frame in 10..=20 {
            host.sync_mut().host_mut().time = frame;
            ram.0[0] = frame as u8;
            host.advance_frame(&ram).unwrap();
        }
        assert!(host.rollback(&mut ram).unwrap().is_none());

        // Frame 14 turns out to have been a punch.
        let mut corrected = [InputSample::NONE; 21];
        corrected[14] = InputSample::combine(0, buttons::A);
        host.handle_packet(ChannelPacket::Unreliable(NetplayMessage::PlayerInputs(
            PlayerInputs::with_inputs(IndexedFrame::new(index, 20), &corrected),
        )));

        let restored = host.rollback(&mut ram).unwrap();
        // Read with a rollback delay of one.
        assert_eq!(restored, Some(IndexedFrame::new(index, 15)));
        assert_eq!(host.sync().frame(), 15);
        assert_eq!(ram.0[0], 15);
        assert_eq!(host.snapshots().newest(), Some(IndexedFrame::new(index, 15)));
    }

    #[test]
    fn spectator_messages_feed_sync_manager() {
        let mut spectator = session(NetplayConfig::default().with_role(Role::SpectateNetplay));
        spectator.handle_spectator_message(SpectatorMessage::MenuIndex(MenuIndex {
            index: 4,
            menu_index: 1,
        }));
        assert_eq!(spectator.sync().retry_menu_index(4), Some(1));

        spectator.handle_spectator_message(SpectatorMessage::InitialGameState(
            crate::InitialGameState {
                indexed_frame: IndexedFrame::new(3, 29),
                phase: Phase::CharaSelect,
                training: false,
                delay: 2,
                rollback: 0,
                rollback_delay: 0,
            },
        ));
        assert_eq!(spectator.sync().delay(), 2);
    }
}
