//! Fan-out of both players' inputs, RNG states and retry menu choices to
//! read-only observers.
//!
//! Observers are serviced round-robin, a few per tick, so the cost of a large
//! audience is spread over the batch window instead of landing on one frame.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::config::GameMode;
use crate::network::messages::{InitialGameState, MenuIndex, RngState, SpectatorMessage};
use crate::sync_manager::{HostBindings, Phase, SyncManager};
use crate::{IndexedFrame, SpectatorTransport, NUM_INPUTS};

#[derive(Debug, Clone)]
struct Observer {
    cursor: IndexedFrame,
    sent_rng_state: bool,
    sent_retry_menu_index: bool,
}

/// Broadcast cadence for `observers` spectators: how many to service per
/// broadcast tick and how many ticks apart broadcasts are.
///
/// One pass over the audience takes about half a batch window, so nobody
/// falls more than a batch behind.
fn cadence(observers: usize) -> (usize, u32) {
    let multiplier = 1 + (observers * 2) / (NUM_INPUTS + 1);
    let interval = ((multiplier * NUM_INPUTS / 2) / observers.max(1)).max(1);
    (multiplier, interval as u32)
}

/// Streams a [`SyncManager`]'s synchronized history to spectators.
///
/// Each observer has its own read cursor. The smallest epoch any cursor
/// still needs is published to the sync manager once per pass, which keeps
/// that history from being pruned.
#[derive(Debug)]
pub struct SpectatorBroadcaster<O> {
    order: Vec<O>,
    observers: BTreeMap<O, Observer>,
    /// Next entry of `order` to service; `order.len()` means a pass just ended.
    position: usize,
    relay_position: usize,
}

impl<O: Ord + Clone> Default for SpectatorBroadcaster<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: Ord + Clone> SpectatorBroadcaster<O> {
    /// Creates a broadcaster with no audience.
    #[must_use]
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            observers: BTreeMap::new(),
            position: 0,
            relay_position: 0,
        }
    }

    /// Number of connected observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if nobody is watching.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Read cursor of `observer`.
    #[must_use]
    pub fn cursor(&self, observer: &O) -> Option<IndexedFrame> {
        self.observers.get(observer).map(|o| o.cursor)
    }

    /// Ticks between broadcasts for the current audience.
    #[must_use]
    pub fn interval(&self) -> u32 {
        cadence(self.order.len()).1
    }

    /// An existing observer that a newcomer could be redirected to, rotating
    /// through the audience on every tick.
    #[must_use]
    pub fn relay_candidate(&self) -> Option<&O> {
        self.observers
            .keys()
            .nth(self.relay_position % self.observers.len().max(1))
    }

    /// Registers `observer` and sends it where to start.
    ///
    /// The newcomer queues right behind the next observer due, so a shrinking
    /// interval does not push that observer's next batch further out.
    pub fn add<H: HostBindings>(
        &mut self,
        observer: O,
        sync: &mut SyncManager<H>,
        transport: &mut impl SpectatorTransport<O>,
    ) {
        if self.observers.contains_key(&observer) {
            return;
        }

        let cursor = IndexedFrame::new(sync.spectate_start_index(), NUM_INPUTS as u32 - 1);
        if self.position >= self.order.len() {
            self.order.insert(0, observer.clone());
            self.position = self.order.len();
        } else {
            self.order.insert(self.position + 1, observer.clone());
        }
        self.observers.insert(
            observer.clone(),
            Observer {
                cursor,
                sent_rng_state: false,
                sent_retry_menu_index: false,
            },
        );

        sync.set_preserve_start_index(sync.preserve_start_index().min(cursor.index));
        debug!(
            %cursor,
            preserve_start_index = sync.preserve_start_index(),
            observers = self.order.len(),
            "spectator added"
        );

        let training = sync.config().game_mode == GameMode::Training;
        let phase = sync.phase();
        let rng_index = match phase {
            Phase::CharaSelect => Some(cursor.index),
            // The match epoch follows the spectate start by one epoch in
            // training (Loading -> InGame) and two otherwise (via Skippable).
            Phase::Skippable | Phase::InGame | Phase::RetryMenu => {
                Some(cursor.index + if training { 1 } else { 2 })
            },
            _ => None,
        };
        if let Some(state) = rng_index.and_then(|index| sync.rng_state(index)) {
            transport.send(&observer, &SpectatorMessage::RngState(state.clone()));
        }

        let config = sync.config();
        let initial = InitialGameState {
            indexed_frame: cursor,
            phase,
            training,
            delay: config.delay,
            rollback: config.rollback,
            rollback_delay: config.rollback_delay,
        };
        transport.send(&observer, &SpectatorMessage::InitialGameState(initial));
    }

    /// Forgets `observer`. Returns `false` if it was not registered.
    pub fn remove(&mut self, observer: &O) -> bool {
        if self.observers.remove(observer).is_none() {
            return false;
        }
        if let Some(at) = self.order.iter().position(|o| o == observer) {
            self.order.remove(at);
            if at < self.position {
                self.position -= 1;
            }
        }
        debug!(observers = self.order.len(), "spectator removed");
        true
    }

    /// Sends a freshly produced RNG state to everyone.
    pub fn broadcast_rng_state(&self, state: &RngState, transport: &mut impl SpectatorTransport<O>) {
        let message = SpectatorMessage::RngState(state.clone());
        for observer in &self.order {
            transport.send(observer, &message);
        }
    }

    /// Services the next observers if `world_time` falls on the broadcast
    /// interval.
    pub fn tick<H: HostBindings>(
        &mut self,
        sync: &mut SyncManager<H>,
        world_time: u32,
        transport: &mut impl SpectatorTransport<O>,
    ) {
        if self.order.is_empty() {
            self.position = 0;
            sync.set_preserve_start_index(u32::MAX);
            return;
        }

        self.relay_position = (self.relay_position + 1) % self.observers.len();

        let (multiplier, interval) = cadence(self.order.len());
        if world_time % interval != 0 {
            return;
        }

        for _ in 0..multiplier {
            if self.position >= self.order.len() {
                self.position = 0;
                let watermark = self.min_cursor_index();
                sync.set_preserve_start_index(watermark);
                trace!(preserve_start_index = watermark, "spectator pass complete");
            }

            let Some(id) = self.order.get(self.position) else {
                break;
            };
            let Some(observer) = self.observers.get_mut(id) else {
                break;
            };
            Self::service(id, observer, sync, transport);
            self.position += 1;
        }
    }

    fn min_cursor_index(&self) -> u32 {
        self.observers
            .values()
            .map(|o| o.cursor.index)
            .min()
            .unwrap_or(u32::MAX)
    }

    fn service<H: HostBindings>(
        id: &O,
        observer: &mut Observer,
        sync: &SyncManager<H>,
        transport: &mut impl SpectatorTransport<O>,
    ) {
        let old_index = observer.cursor.index;
        if let Some(batch) = sync.both_inputs(&mut observer.cursor) {
            trace!(batch = %batch.indexed_frame, cursor = %observer.cursor, "spectator inputs");
            transport.send(id, &SpectatorMessage::BothInputs(batch));
        }

        if observer.cursor.index > old_index {
            observer.sent_rng_state = false;
            observer.sent_retry_menu_index = false;
        }

        let index = observer.cursor.index;
        if !observer.sent_rng_state {
            if let Some(state) = sync.rng_state(index) {
                transport.send(id, &SpectatorMessage::RngState(state.clone()));
                observer.sent_rng_state = true;
            }
        }
        if !observer.sent_retry_menu_index {
            if let Some(menu_index) = sync.retry_menu_index(index) {
                transport.send(id, &SpectatorMessage::MenuIndex(MenuIndex { index, menu_index }));
                observer.sent_retry_menu_index = true;
            }
        }
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
    use crate::sync_manager::testing::TestHost;
    use crate::{InputSample, NetplayConfig, Player, Role};

    #[derive(Default)]
    struct Outbox {
        sent: Vec<(u32, SpectatorMessage)>,
    }

    impl SpectatorTransport<u32> for Outbox {
        fn send(&mut self, observer: &u32, message: &SpectatorMessage) {
            self.sent.push((*observer, message.clone()));
        }
    }

    impl Outbox {
        fn inputs_for(&self, observer: u32) -> Vec<IndexedFrame> {
            self.sent
                .iter()
                .filter_map(|(to, message)| match message {
                    SpectatorMessage::BothInputs(batch) if *to == observer => {
                        Some(batch.indexed_frame)
                    },
                    _ => None,
                })
                .collect()
        }
    }

    fn broadcasting() -> SyncManager<TestHost> {
        let config = NetplayConfig::default().with_role(Role::Broadcast);
        let mut sync = SyncManager::new(TestHost::default(), config).unwrap();
        for phase in [Phase::Initial, Phase::CharaSelect, Phase::Loading] {
            sync.set_phase(phase).unwrap();
        }
        sync
    }

    fn play(sync: &mut SyncManager<TestHost>, frames: std::ops::Range<u32>) {
        for frame in frames {
            sync.host_mut().time = frame;
            sync.update_frame();
            for player in Player::BOTH {
                sync.set_input(player, InputSample::new(frame as u16));
            }
        }
    }

    // ========================================================================
    // Cadence
    // ========================================================================

    #[test]
    fn cadence_spreads_observers_over_half_a_window() {
        assert_eq!(cadence(1), (1, 15));
        assert_eq!(cadence(2), (1, 7));
        assert_eq!(cadence(3), (1, 5));
        assert_eq!(cadence(15), (1, 1));
        // Past a full window the interval stays at one and the per-tick
        // count grows instead.
        assert_eq!(cadence(16), (2, 1));
        assert_eq!(cadence(100), (7, 1));
    }

    // ========================================================================
    // Joining
    // ========================================================================

    #[test]
    fn add_sends_initial_state_and_pins_history() {
        let mut sync = broadcasting();
        let mut outbox = Outbox::default();
        let mut broadcaster = SpectatorBroadcaster::new();

        broadcaster.add(7, &mut sync, &mut outbox);

        let start = IndexedFrame::new(sync.spectate_start_index(), NUM_INPUTS as u32 - 1);
        assert_eq!(broadcaster.cursor(&7), Some(start));
        assert_eq!(sync.preserve_start_index(), start.index);
        match outbox.sent.last() {
            Some((7, SpectatorMessage::InitialGameState(initial))) => {
                assert_eq!(initial.indexed_frame, start);
                assert_eq!(initial.phase, Phase::Loading);
            },
            other => panic!("unexpected: {other:?}"),
        }

        broadcaster.add(7, &mut sync, &mut outbox);
        assert_eq!(broadcaster.len(), 1);
    }

    #[test]
    fn newcomer_queues_behind_next_due() {
        let mut sync = broadcasting();
        let mut outbox = Outbox::default();
        let mut broadcaster = SpectatorBroadcaster::new();
        broadcaster.add(1, &mut sync, &mut outbox);
        broadcaster.add(2, &mut sync, &mut outbox);
        assert_eq!(broadcaster.order, vec![2, 1]);

        play(&mut sync, 0..40);
        // Interval for two is 7; the pass starts with observer 2.
        broadcaster.tick(&mut sync, 7, &mut outbox);
        assert_eq!(outbox.inputs_for(2).len(), 1);
        assert_eq!(broadcaster.position, 1);

        broadcaster.add(3, &mut sync, &mut outbox);
        assert_eq!(broadcaster.order, vec![2, 1, 3]);
        assert_eq!(broadcaster.interval(), 5);

        broadcaster.tick(&mut sync, 10, &mut outbox);
        assert_eq!(outbox.inputs_for(1).len(), 1);
        assert!(outbox.inputs_for(3).is_empty());
        broadcaster.tick(&mut sync, 15, &mut outbox);
        assert_eq!(outbox.inputs_for(3).len(), 1);
    }

    // ========================================================================
    // Streaming
    // ========================================================================

    #[test]
    fn tick_streams_batches_only_on_interval() {
        let mut sync = broadcasting();
        let mut outbox = Outbox::default();
        let mut broadcaster = SpectatorBroadcaster::new();
        broadcaster.add(1, &mut sync, &mut outbox);
        play(&mut sync, 0..70);

        broadcaster.tick(&mut sync, 16, &mut outbox);
        assert!(outbox.inputs_for(1).is_empty());

        broadcaster.tick(&mut sync, 30, &mut outbox);
        broadcaster.tick(&mut sync, 45, &mut outbox);
        broadcaster.tick(&mut sync, 60, &mut outbox);
        let index = sync.index();
        assert_eq!(
            outbox.inputs_for(1),
            vec![IndexedFrame::new(index, 29), IndexedFrame::new(index, 59)]
        );
    }

    #[test]
    fn rng_and_menu_index_sent_once_per_epoch() {
        let mut sync = broadcasting();
        let mut outbox = Outbox::default();
        let mut broadcaster = SpectatorBroadcaster::new();
        play(&mut sync, 0..10);
        sync.set_phase(Phase::Skippable).unwrap();
        let index = sync.index();
        sync.set_rng_state(RngState {
            index,
            bytes: vec![9],
        });
        sync.set_retry_menu_index(index, 1);

        broadcaster.add(1, &mut sync, &mut outbox);
        // Move the spectator into the epoch with the RNG state.
        for time in [15, 30, 45] {
            broadcaster.tick(&mut sync, time, &mut outbox);
        }

        let rng_sends = outbox
            .sent
            .iter()
            .filter(|(_, m)| matches!(m, SpectatorMessage::RngState(s) if s.index == index))
            .count();
        let menu_sends = outbox
            .sent
            .iter()
            .filter(|(_, m)| matches!(m, SpectatorMessage::MenuIndex(MenuIndex { menu_index: 1, .. })))
            .count();
        assert_eq!(rng_sends, 1);
        assert_eq!(menu_sends, 1);
    }

    #[test]
    fn watermark_published_after_each_pass() {
        let mut sync = broadcasting();
        let mut outbox = Outbox::default();
        let mut broadcaster = SpectatorBroadcaster::new();
        broadcaster.add(1, &mut sync, &mut outbox);
        let start = sync.spectate_start_index();

        broadcaster.tick(&mut sync, 0, &mut outbox);
        sync.set_preserve_start_index(u32::MAX);
        // The pass wraps on the next broadcast and republishes the minimum.
        broadcaster.tick(&mut sync, 15, &mut outbox);
        assert_eq!(sync.preserve_start_index(), start);

        assert!(broadcaster.remove(&1));
        assert!(!broadcaster.remove(&1));
        broadcaster.tick(&mut sync, 30, &mut outbox);
        assert_eq!(sync.preserve_start_index(), u32::MAX);
    }

    #[test]
    fn broadcast_rng_reaches_everyone() {
        let mut sync = broadcasting();
        let mut outbox = Outbox::default();
        let mut broadcaster = SpectatorBroadcaster::new();
        for id in 0..3 {
            broadcaster.add(id, &mut sync, &mut outbox);
        }
        outbox.sent.clear();

        broadcaster.broadcast_rng_state(
            &RngState {
                index: 4,
                bytes: vec![1, 2, 3],
            },
            &mut outbox,
        );
        let mut recipients: Vec<u32> = outbox.sent.iter().map(|(to, _)| *to).collect();
        recipients.sort_unstable();
        assert_eq!(recipients, vec![0, 1, 2]);
        assert!(broadcaster.relay_candidate().is_some());
    }
}
