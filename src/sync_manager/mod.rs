//! The per-epoch input and RNG synchronization state machine.
//!
//! [`SyncManager`] decides, every tick, what input each player's simulation
//! sees. It owns both players' [`InputTimeline`]s, the host RNG states and
//! the agreed retry menu choices, all keyed by epoch and pruned together.
//!
//! Local samples are written at the current frame and read back
//! `effective_delay()` frames later, so a peer has that many ticks to deliver
//! its own sample for the same position.

mod host;
mod menu_nav;
mod phase;
#[cfg(test)]
pub(crate) mod testing;
mod training;

pub use host::{HostBindings, MenuConfirmState, SelectorMode, TrainingResetAction, TrainingResetKind};
pub use phase::Phase;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::buttons;
use crate::config::{GameMode, NetplayConfig, Role};
use crate::network::messages::{BothInputs, InitialGameState, MenuIndex, PlayerInputs, RngState};
use crate::report_violation;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{
    IndexedFrame, InputSample, InputTimeline, NetplayError, Player, NUM_INPUTS,
    PRESERVE_START_INDEX_BUFFER, WARMUP_FRAMES,
};

use menu_nav::{mash, MenuNav, NavOutput};
use training::TrainingReset;

/// The part of the sync state a rollback rewinds.
///
/// Everything else (timelines, RNG states, menu choices) is history that
/// stays valid across a rewind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncState {
    /// Phase at capture time.
    pub phase: Phase,
    /// Host world time at which the epoch began.
    pub epoch_start_time: u32,
    /// Position at capture time.
    pub indexed_frame: IndexedFrame,
}

impl SyncState {
    /// Creates a sync state.
    #[must_use]
    pub const fn new(phase: Phase, epoch_start_time: u32, indexed_frame: IndexedFrame) -> Self {
        Self {
            phase,
            epoch_start_time,
            indexed_frame,
        }
    }
}

/// Subtracts the spectator safety margin from a preserve watermark.
fn buffered_preserve(preserve: u32) -> u32 {
    if preserve == u32::MAX {
        u32::MAX
    } else {
        preserve.saturating_sub(PRESERVE_START_INDEX_BUFFER)
    }
}

/// Per-epoch values stored relative to the sync manager's `start_index`.
#[derive(Debug, Clone)]
struct EpochTable<T> {
    entries: Vec<Option<T>>,
}

impl<T> Default for EpochTable<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> EpochTable<T> {
    fn get(&self, start_index: u32, index: u32) -> Option<&T> {
        let slot = index.checked_sub(start_index)? as usize;
        self.entries.get(slot)?.as_ref()
    }

    fn insert(&mut self, start_index: u32, index: u32, value: T) {
        let Some(slot) = index.checked_sub(start_index) else {
            return;
        };
        let slot = slot as usize;
        if slot >= self.entries.len() {
            self.entries.resize_with(slot + 1, || None);
        }
        if let Some(entry) = self.entries.get_mut(slot) {
            *entry = Some(value);
        }
    }

    fn erase_front(&mut self, count: usize) {
        if count >= self.entries.len() {
            self.entries.clear();
        } else {
            self.entries.drain(..count);
        }
    }

    /// Newest epoch with a slot, present or not.
    fn end_index(&self, start_index: u32) -> Option<u32> {
        self.entries
            .len()
            .checked_sub(1)
            .map(|last| start_index + last as u32)
    }
}

/// Decides each player's input per tick and tracks what the peer has sent.
///
/// ```
/// use rollback_netplay::{
///     buttons, HostBindings, InputSample, MenuConfirmState, NetplayConfig, Phase, Player,
///     SyncManager,
/// };
///
/// #[derive(Default)]
/// struct Host {
///     time: u32,
///     confirm: MenuConfirmState,
/// }
///
/// impl HostBindings for Host {
///     fn world_time(&self) -> u32 { self.time }
///     fn current_menu_index(&self) -> u8 { 0 }
///     fn menu_confirm_state(&self) -> MenuConfirmState { self.confirm }
///     fn set_menu_confirm_state(&mut self, state: MenuConfirmState) { self.confirm = state; }
///     fn raw_input(&self, _player: Player) -> InputSample { InputSample::NONE }
/// }
///
/// let config = NetplayConfig { delay: 2, ..NetplayConfig::default() };
/// let mut sync = SyncManager::new(Host::default(), config).unwrap();
/// for phase in [Phase::Initial, Phase::CharaSelect, Phase::Loading, Phase::InGame] {
///     sync.set_phase(phase).unwrap();
/// }
///
/// let punch = InputSample::combine(0, buttons::A);
/// for time in 0..=12 {
///     sync.host_mut().time = time;
///     sync.update_frame();
///     if sync.frame() == 10 {
///         sync.set_input(Player::One, punch);
///     }
/// }
/// assert_eq!(sync.frame(), 12);
/// assert_eq!(sync.get_input(Player::One), punch);
/// ```
pub struct SyncManager<H> {
    host: H,
    config: NetplayConfig,

    phase: Phase,
    indexed_frame: IndexedFrame,
    epoch_start_time: u32,

    start_index: u32,
    spectate_start_index: u32,
    preserve_start_index: u32,

    local_player: Player,
    remote_player: Player,

    inputs: [InputTimeline; 2],
    rng_states: EpochTable<RngState>,
    retry_menu_indices: EpochTable<u8>,

    local_retry_menu_index: Option<u8>,
    remote_retry_menu_index: Option<u8>,

    menu_nav: MenuNav,
    training_reset: TrainingReset,
    initial_state: Option<InitialGameState>,
}

impl<H: std::fmt::Debug> std::fmt::Debug for SyncManager<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("host", &self.host)
            .field("role", &self.config.role)
            .field("phase", &self.phase)
            .field("indexed_frame", &self.indexed_frame)
            .field("start_index", &self.start_index)
            .field("local_player", &self.local_player)
            .finish_non_exhaustive()
    }
}

impl<H: HostBindings> SyncManager<H> {
    /// Creates a sync manager in [`Phase::PreInitial`] at `0:0`.
    ///
    /// The local player is the host player for every role except
    /// [`Role::Client`], which plays the other side.
    ///
    /// # Errors
    ///
    /// Returns the first error from [`NetplayConfig::validate`].
    pub fn new(host: H, config: NetplayConfig) -> Result<Self, NetplayError> {
        config.validate()?;

        let local_player = if config.role == Role::Client {
            config.host_player.opposite()
        } else {
            config.host_player
        };

        Ok(Self {
            host,
            config,
            phase: Phase::PreInitial,
            indexed_frame: IndexedFrame::default(),
            epoch_start_time: 0,
            start_index: 0,
            spectate_start_index: 0,
            preserve_start_index: u32::MAX,
            local_player,
            remote_player: local_player.opposite(),
            inputs: [InputTimeline::new(), InputTimeline::new()],
            rng_states: EpochTable::default(),
            retry_menu_indices: EpochTable::default(),
            local_retry_menu_index: None,
            remote_retry_menu_index: None,
            menu_nav: MenuNav::default(),
            training_reset: TrainingReset::default(),
            initial_state: None,
        })
    }

    // ##############
    // # ACCESSORS  #
    // ##############

    /// The host adapter.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// The host adapter, mutably.
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Active configuration.
    pub fn config(&self) -> &NetplayConfig {
        &self.config
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Current position.
    pub fn indexed_frame(&self) -> IndexedFrame {
        self.indexed_frame
    }

    /// Current epoch.
    pub fn index(&self) -> u32 {
        self.indexed_frame.index
    }

    /// Ticks since the current epoch began.
    pub fn frame(&self) -> u32 {
        self.indexed_frame.frame
    }

    /// Oldest epoch still retained.
    pub fn start_index(&self) -> u32 {
        self.start_index
    }

    /// Epoch a newly joining spectator starts from.
    pub fn spectate_start_index(&self) -> u32 {
        self.spectate_start_index
    }

    /// Oldest epoch any spectator still needs, or `u32::MAX` if none.
    pub fn preserve_start_index(&self) -> u32 {
        self.preserve_start_index
    }

    /// Publishes the spectator watermark used when pruning.
    pub fn set_preserve_start_index(&mut self, index: u32) {
        self.preserve_start_index = index;
    }

    /// Player driven by this process.
    pub fn local_player(&self) -> Player {
        self.local_player
    }

    /// Player driven by the peer.
    pub fn remote_player(&self) -> Player {
        self.remote_player
    }

    /// Sets which player the peer controls; the local player is the other one.
    pub fn set_remote_player(&mut self, player: Player) {
        self.remote_player = player;
        self.local_player = player.opposite();
    }

    /// Configured input delay.
    pub fn delay(&self) -> u8 {
        self.config.delay
    }

    /// Configured rollback window.
    pub fn rollback(&self) -> u8 {
        self.config.rollback
    }

    /// Returns `true` while a match runs with rollback enabled.
    pub fn is_in_rollback(&self) -> bool {
        self.config.has_rollback() && self.phase == Phase::InGame
    }

    /// Frames between writing a sample and reading it back in this phase.
    ///
    /// Zero at the retry menu, the rollback delay while rolling back, and the
    /// plain delay otherwise.
    pub fn effective_delay(&self) -> u32 {
        if self.phase == Phase::RetryMenu {
            0
        } else if self.is_in_rollback() {
            u32::from(self.config.rollback_delay)
        } else {
            u32::from(self.config.delay)
        }
    }

    /// The timeline of `player`.
    pub fn timeline(&self, player: Player) -> &InputTimeline {
        &self.inputs[player.slot()]
    }

    /// Target of the automatic menu navigation, if one is set.
    pub fn menu_target(&self) -> Option<u8> {
        self.menu_nav.target()
    }

    /// Starts automatic navigation to `target` in the current menu.
    pub fn set_menu_target(&mut self, target: u8) {
        self.menu_nav.set_target(target);
    }

    // ###############
    // # PHASES      #
    // ###############

    /// Moves to `next`.
    ///
    /// Phases from [`Phase::CharaSelect`] onward start a new epoch: the index
    /// increments, the frame restarts at zero and menu automation is reset.
    /// Entering [`Phase::Loading`] also prunes history no spectator needs.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidPhaseTransition`] and changes nothing if
    /// `next` may not follow the current phase.
    pub fn set_phase(&mut self, next: Phase) -> Result<(), NetplayError> {
        if !self.phase.can_transition_to(next) {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::PhaseTransition,
                "invalid transition {} -> {} at {}",
                self.phase,
                next,
                self.indexed_frame
            );
            return Err(NetplayError::InvalidPhaseTransition {
                from: self.phase,
                to: next,
            });
        }

        debug!(
            frame = %self.indexed_frame,
            from = %self.phase,
            to = %next,
            "phase transition"
        );

        if next.starts_epoch() {
            let initial = if self.phase == Phase::AutoCharaSelect {
                self.initial_state.take()
            } else {
                None
            };
            match initial {
                Some(initial) => self.jump_to(initial),
                None => {
                    self.indexed_frame = IndexedFrame::new(self.indexed_frame.index + 1, 0);
                    self.epoch_start_time = self.host.world_time();
                },
            }

            if matches!(next, Phase::CharaSelect | Phase::Loading) {
                self.spectate_start_index = self.index();
            }

            if next == Phase::Loading {
                let new_start = buffered_preserve(self.preserve_start_index).min(self.index());
                self.prune_before(new_start);
                self.local_retry_menu_index = None;
                self.remote_retry_menu_index = None;
            }

            self.menu_nav.reset();
            self.host.set_menu_confirm_state(MenuConfirmState::Disabled);
        }

        self.phase = next;
        crate::debug_check_invariants!(self, "SyncManager::set_phase");
        Ok(())
    }

    /// Installs where a late-joining spectator should start. Consumed when
    /// leaving [`Phase::AutoCharaSelect`].
    ///
    /// The broadcaster's delay settings are adopted so samples are read at
    /// the same offset the players used.
    pub fn set_initial_game_state(&mut self, initial: InitialGameState) {
        self.config.delay = initial.delay;
        self.config.rollback = initial.rollback;
        self.config.rollback_delay = initial.rollback_delay;
        self.initial_state = Some(initial);
    }

    fn jump_to(&mut self, initial: InitialGameState) {
        debug!(target = %initial.indexed_frame, "jumping to spectator start");
        self.indexed_frame = initial.indexed_frame;
        self.epoch_start_time = self
            .host
            .world_time()
            .wrapping_sub(initial.indexed_frame.frame);
        self.prune_before(initial.indexed_frame.index);
    }

    fn prune_before(&mut self, new_start: u32) {
        if new_start <= self.start_index {
            return;
        }
        let offset = (new_start - self.start_index) as usize;
        debug!(from = self.start_index, to = new_start, "pruning history");
        for timeline in &mut self.inputs {
            timeline.erase_older_than(new_start);
        }
        self.rng_states.erase_front(offset);
        self.retry_menu_indices.erase_front(offset);
        self.start_index = new_start;
    }

    /// Recomputes the frame from the host's world time.
    pub fn update_frame(&mut self) {
        self.indexed_frame.frame = self
            .host
            .world_time()
            .saturating_sub(self.epoch_start_time);
    }

    /// Snapshot of what a rollback rewinds.
    pub fn capture_state(&self) -> SyncState {
        SyncState::new(self.phase, self.epoch_start_time, self.indexed_frame)
    }

    /// Rewinds to a captured state.
    pub fn restore_state(&mut self, state: SyncState) {
        trace!(from = %self.indexed_frame, to = %state.indexed_frame, "restoring sync state");
        self.phase = state.phase;
        self.epoch_start_time = state.epoch_start_time;
        self.indexed_frame = state.indexed_frame;
    }

    // ###############
    // # INPUT       #
    // ###############

    /// Input `player`'s simulation should see this tick.
    pub fn get_input(&mut self, player: Player) -> InputSample {
        match self.phase {
            Phase::PreInitial => self.mash_confirm(),
            Phase::Initial => self.initial_input(player),
            Phase::AutoCharaSelect => mash(self.frame(), buttons::CONFIRM),
            Phase::CharaSelect => self.chara_select_input(player),
            Phase::Loading | Phase::Skippable => self.skippable_input(player),
            Phase::InGame => self.in_game_input(player),
            Phase::RetryMenu => self.retry_menu_input(player),
            Phase::PauseMenu => self.pause_menu_input(player),
        }
    }

    fn mash_confirm(&mut self) -> InputSample {
        self.host.set_menu_confirm_state(MenuConfirmState::Enabled);
        mash(self.frame(), buttons::CONFIRM)
    }

    fn menu_nav_input(&mut self) -> InputSample {
        let current = self.host.current_menu_index();
        match self.menu_nav.next(current, &self.config.menu_nav) {
            NavOutput::Input(input) => input,
            NavOutput::Confirm => self.mash_confirm(),
        }
    }

    /// Stored sample for `player`, `delay` frames ago; nothing before the epoch began.
    fn delayed_input(&self, player: Player, delay: u32) -> InputSample {
        self.indexed_frame
            .minus_frames(delay)
            .map_or(InputSample::NONE, |at| self.inputs[player.slot()].get(at))
    }

    /// Samples `player` saw `ticks_ago` ticks back, newest first, for each
    /// offset in `ticks_ago` that lies inside the epoch.
    fn history(
        &self,
        player: Player,
        ticks_ago: std::ops::Range<u32>,
    ) -> impl Iterator<Item = InputSample> + '_ {
        let delay = self.effective_delay();
        ticks_ago
            .map_while(move |ago| self.indexed_frame.minus_frames(delay + ago))
            .map(move |at| self.inputs[player.slot()].get(at))
    }

    fn has_buttons_in_history(&self, player: Player, mask: u16, ticks_ago: std::ops::Range<u32>) -> bool {
        self.history(player, ticks_ago)
            .any(|input| input.has_buttons(mask))
    }

    fn has_up_down_in_history(&self, player: Player, ticks_ago: std::ops::Range<u32>) -> bool {
        self.history(player, ticks_ago)
            .any(InputSample::is_vertical)
    }

    fn initial_input(&mut self, player: Player) -> InputSample {
        // The host side drives the main menu alone.
        if player != self.config.host_player {
            return InputSample::NONE;
        }
        if self.menu_nav.is_active() {
            return self.menu_nav_input();
        }
        self.mash_confirm()
    }

    fn chara_select_input(&mut self, player: Player) -> InputSample {
        let timing = self.config.menu_nav;
        let mut input = self.delayed_input(player, self.effective_delay());

        if self.config.role.is_online() && self.frame() < timing.chara_select_lockout {
            input = input.without_buttons(buttons::ANY_CONFIRM);
        }
        if self.host.selector_mode(player) != SelectorMode::Character {
            input = input.without_buttons(buttons::ANY_CANCEL);
        }

        let confirm_or_cancel = buttons::ANY_CONFIRM | buttons::ANY_CANCEL;
        if self.has_buttons_in_history(player, confirm_or_cancel, 1..timing.confirm_cooldown) {
            input = input.without_buttons(confirm_or_cancel);
        }
        input
    }

    fn skippable_input(&mut self, player: Player) -> InputSample {
        let remote_ahead = self.inputs[self.remote_player.slot()]
            .end_index()
            .is_some_and(|remote| remote > self.index());

        if remote_ahead || self.config.role.is_spectate() {
            return self.mash_confirm();
        }

        self.delayed_input(player, self.effective_delay())
            .only_buttons(buttons::CONFIRM)
    }

    fn in_game_input(&mut self, player: Player) -> InputSample {
        if self.frame() < WARMUP_FRAMES {
            return InputSample::NONE;
        }

        let mut input = self.delayed_input(player, self.effective_delay());

        if self.config.is_competitive() || self.config.role.is_spectate() {
            input = input.without_buttons(buttons::START);
        }

        if self.host.is_paused() {
            input = self.pause_menu_input_from(player, input);
        } else if self.config.game_mode == GameMode::Training
            && !self.config.is_competitive()
            && player == self.config.host_player
        {
            let (reset_input, action) = self.training_reset.step(input);
            if let Some(action) = action {
                trace!(?action, %player, "training reset");
                self.host.apply_training_reset(player, action);
            }
            input = reset_input;
        }

        input
    }

    fn pause_menu_input(&mut self, player: Player) -> InputSample {
        let input = self.delayed_input(player, self.effective_delay());
        self.pause_menu_input_from(player, input)
    }

    fn pause_menu_input_from(&mut self, player: Player, input: InputSample) -> InputSample {
        self.host.set_menu_confirm_state(MenuConfirmState::Enabled);
        if self.has_up_down_in_history(player, 0..self.config.menu_nav.confirm_cooldown) {
            input.without_buttons(buttons::ANY_CONFIRM)
        } else {
            input
        }
    }

    fn retry_menu_input(&mut self, player: Player) -> InputSample {
        let role = self.config.role;

        // Each side only drives its own cursor here.
        if role.is_netplay() && player != self.local_player {
            return InputSample::NONE;
        }

        if self.menu_nav.is_active() {
            return self.menu_nav_input();
        }

        let max_index = self.config.max_retry_menu_index();
        let current = self.host.current_menu_index();

        let mut input = if role == Role::SpectateNetplay {
            mash(self.frame(), buttons::CONFIRM)
        } else {
            let cooldown = 0..self.config.menu_nav.confirm_cooldown;
            let moved = if role.is_netplay() {
                self.has_up_down_in_history(player, cooldown)
            } else {
                Player::BOTH
                    .into_iter()
                    .any(|p| self.has_up_down_in_history(p, cooldown.clone()))
            };

            let mut input = self.delayed_input(player, 0);
            if moved || current > max_index {
                input = input.without_buttons(buttons::ANY_CONFIRM);
            }
            input
        };

        if role == Role::SpectateNetplay {
            self.host.set_menu_confirm_state(MenuConfirmState::Disabled);
            if let Some(&target) = self.retry_menu_indices.get(self.start_index, self.index()) {
                self.menu_nav.set_target(target);
                return InputSample::NONE;
            }
        } else if role.is_netplay() {
            match (self.local_retry_menu_index, self.remote_retry_menu_index) {
                (Some(local), Some(remote)) => {
                    let target = local.max(remote).min(max_index);
                    debug!(local, remote, target, "retry menu agreed");
                    self.menu_nav.set_target(target);
                    self.set_retry_menu_index(self.index(), target);
                    input = InputSample::NONE;
                },
                (Some(_), None) => input = InputSample::NONE,
                (None, _) if self.host.menu_confirm_state() == MenuConfirmState::Confirmed => {
                    self.local_retry_menu_index = Some(current);
                    debug!(local = current, "local retry menu choice");
                    input = InputSample::NONE;
                },
                (None, _) => {},
            }
            self.host.set_menu_confirm_state(MenuConfirmState::Disabled);
        } else {
            self.host.set_menu_confirm_state(MenuConfirmState::Enabled);
        }

        input
    }

    /// Records `player`'s sample for the current frame. The first write wins.
    pub fn set_input(&mut self, player: Player, input: InputSample) {
        let at = self.indexed_frame;
        self.inputs[player.slot()].set(at, input);
    }

    /// Overwrites `player`'s sample at `at`.
    pub fn assign_input(&mut self, player: Player, at: IndexedFrame, input: InputSample) {
        self.inputs[player.slot()].assign(at, input);
    }

    /// The newest [`NUM_INPUTS`] samples of `player` in the current epoch.
    pub fn inputs_message(&self, player: Player) -> Option<PlayerInputs> {
        let timeline = &self.inputs[player.slot()];
        let end = timeline.end_frame_of(self.index());
        let last = IndexedFrame::new(self.index(), end.checked_sub(1)?);

        let mut message = PlayerInputs::new(last);
        let count = (message.end_frame() - message.start_frame()) as usize;
        message
            .inputs
            .extend_from_slice(timeline.get_range(message.start(), count));
        Some(message)
    }

    fn accepts_epoch(&self, index: u32) -> bool {
        index.saturating_add(1) >= self.index() && index >= self.start_index
    }

    /// Furthest a received batch may start past everything already known
    /// about its epoch.
    pub fn max_batch_lead(&self) -> u32 {
        u32::from(self.config.delay) + u32::from(self.config.rollback) + 2 * NUM_INPUTS as u32
    }

    /// Returns `true` if a batch for epoch `index` starting at `start_frame`
    /// lies within [`max_batch_lead`](Self::max_batch_lead) of the local
    /// frame or of either player's recorded end for that epoch.
    fn within_batch_lead(&self, index: u32, start_frame: u32) -> bool {
        let local = if index == self.index() { self.frame() } else { 0 };
        let known = Player::BOTH
            .iter()
            .map(|player| self.inputs[player.slot()].end_frame_of(index))
            .fold(local, u32::max);
        start_frame <= known.saturating_add(self.max_batch_lead())
    }

    /// Stores a batch received from the peer.
    ///
    /// Batches more than one epoch old or older than the retained history are
    /// dropped, as are batches starting more than
    /// [`max_batch_lead`](Self::max_batch_lead) frames past anything known
    /// about their epoch. While rolling back, the earliest changed sample is tracked
    /// for [`last_changed_frame`](Self::last_changed_frame).
    pub fn set_inputs(&mut self, player: Player, message: &PlayerInputs) {
        if !self.accepts_epoch(message.index()) {
            trace!(batch = %message.indexed_frame, local = %self.indexed_frame, "stale input batch");
            return;
        }
        if !self.within_batch_lead(message.index(), message.start_frame()) {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::InputTimeline,
                "input batch ending at {} is too far ahead of {}",
                message.indexed_frame,
                self.indexed_frame
            );
            return;
        }
        if !message.is_well_formed() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::InputTimeline,
                "malformed input batch ending at {} with {} samples",
                message.indexed_frame,
                message.inputs.len()
            );
            return;
        }

        let timeline = &mut self.inputs[player.slot()];
        if self.config.has_rollback() && self.phase == Phase::InGame {
            timeline.set_range_tracked(message.start(), &message.inputs, self.indexed_frame.index);
        } else {
            timeline.set_range(message.start(), &message.inputs);
        }
    }

    /// Next batch of both players' inputs for a spectator at `cursor`.
    ///
    /// Advances the cursor by [`NUM_INPUTS`] frames, or to the next epoch
    /// once the cursor's epoch is exhausted. During the current epoch the
    /// spectator is never shown anything newer than both players have
    /// recorded, minus a safety margin while rolling back.
    pub fn both_inputs(&self, cursor: &mut IndexedFrame) -> Option<BothInputs> {
        if cursor.index > self.index() {
            return None;
        }

        let mut last = *cursor;
        let mut common_end = self.inputs[0]
            .end_frame_of(cursor.index)
            .min(self.inputs[1].end_frame_of(cursor.index));

        if cursor.index == self.index() {
            if self.is_in_rollback() {
                common_end = common_end.saturating_sub(2 * NUM_INPUTS as u32);
            }
            if cursor.frame + 1 > common_end {
                return None;
            }
            cursor.frame += NUM_INPUTS as u32;
        } else if cursor.frame + 1 <= common_end {
            cursor.frame += NUM_INPUTS as u32;
        } else {
            *cursor = IndexedFrame::new(cursor.index + 1, NUM_INPUTS as u32 - 1);
            last.frame = common_end.checked_sub(1)?;
        }

        let mut message = BothInputs::new(last);
        let start = message.start();
        let count = message.len();
        for player in Player::BOTH {
            message.inputs[player.slot()]
                .extend_from_slice(self.inputs[player.slot()].get_range(start, count));
        }
        Some(message)
    }

    /// Stores a batch of both players' inputs, as a spectator.
    pub fn set_both_inputs(&mut self, message: &BothInputs) {
        if !self.accepts_epoch(message.index()) {
            trace!(batch = %message.indexed_frame, local = %self.indexed_frame, "stale spectator batch");
            return;
        }
        if !self.within_batch_lead(message.index(), message.start_frame()) {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::InputTimeline,
                "spectator batch ending at {} is too far ahead of {}",
                message.indexed_frame,
                self.indexed_frame
            );
            return;
        }
        let start = message.start();
        for player in Player::BOTH {
            let samples = &message.inputs[player.slot()];
            if samples.len() != message.len() {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::InputTimeline,
                    "spectator batch ending at {} has {} samples for {}, expected {}",
                    message.indexed_frame,
                    samples.len(),
                    player,
                    message.len()
                );
                return;
            }
            self.inputs[player.slot()].set_range(start, samples);
        }
    }

    /// Returns `true` if the remote sample needed this tick has arrived.
    pub fn is_remote_input_ready(&self) -> bool {
        if self.phase < Phase::CharaSelect
            || matches!(self.phase, Phase::Loading | Phase::Skippable | Phase::RetryMenu)
            || self.config.role.is_local()
        {
            return true;
        }

        let remote = &self.inputs[self.remote_player.slot()];
        let Some(remote_index) = remote.end_index() else {
            trace!(frame = %self.indexed_frame, "no remote inputs");
            return false;
        };
        if remote_index < self.index() {
            trace!(remote_index, local_index = self.index(), "remote epoch behind");
            return false;
        }
        if remote_index > self.index() {
            return true;
        }

        let Some(remote_last) = remote.end_frame().checked_sub(1) else {
            trace!(frame = %self.indexed_frame, "remote epoch has no frames");
            return false;
        };
        let ahead = if self.is_in_rollback() {
            u32::from(self.config.rollback)
        } else {
            0
        };
        let ready = remote_last + self.effective_delay() + ahead >= self.frame();
        if !ready {
            trace!(remote_last, local = self.frame(), "remote frame behind");
        }
        ready
    }

    // ###############
    // # RNG         #
    // ###############

    /// Host RNG state recorded for `index`.
    pub fn rng_state(&self, index: u32) -> Option<&RngState> {
        if !self.config.role.is_online() {
            return None;
        }
        self.rng_states.get(self.start_index, index)
    }

    /// Records the host RNG state of an epoch. Ignored offline, for epoch 0
    /// and for pruned epochs.
    pub fn set_rng_state(&mut self, state: RngState) {
        if !self.config.role.is_online() || state.index == 0 || state.index < self.start_index {
            return;
        }
        trace!(index = state.index, "rng state stored");
        self.rng_states.insert(self.start_index, state.index, state);
    }

    /// Returns `true` if the current epoch may start simulating.
    ///
    /// Roles that produce the RNG state never wait.
    pub fn is_rng_state_ready(&self, require_sync: bool) -> bool {
        if !require_sync
            || matches!(self.config.role, Role::Host | Role::Broadcast | Role::Offline)
            || self.phase < Phase::CharaSelect
        {
            return true;
        }
        match self.rng_states.end_index(self.start_index) {
            Some(last) if last >= self.index() => true,
            _ => {
                trace!(frame = %self.indexed_frame, "waiting for rng state");
                false
            },
        }
    }

    // ###############
    // # RETRY MENU  #
    // ###############

    /// Agreed retry menu choice for `index`.
    pub fn retry_menu_index(&self, index: u32) -> Option<u8> {
        if !self.config.role.is_online() {
            return None;
        }
        self.retry_menu_indices.get(self.start_index, index).copied()
    }

    /// Records the agreed retry menu choice for `index`.
    pub fn set_retry_menu_index(&mut self, index: u32, menu_index: u8) {
        if !self.config.role.is_online() || index == 0 || index < self.start_index {
            return;
        }
        trace!(index, menu_index, "retry menu index stored");
        self.retry_menu_indices.insert(self.start_index, index, menu_index);
    }

    /// The local choice at the current retry menu, once made.
    pub fn local_retry_menu_index(&self) -> Option<MenuIndex> {
        if self.phase != Phase::RetryMenu {
            return None;
        }
        self.local_retry_menu_index.map(|menu_index| MenuIndex {
            index: self.index(),
            menu_index,
        })
    }

    /// Records the peer's choice at the current retry menu.
    pub fn set_remote_retry_menu_index(&mut self, menu_index: u8) {
        debug!(menu_index, "remote retry menu choice");
        self.remote_retry_menu_index = Some(menu_index);
    }

    // ###############
    // # REMOTE      #
    // ###############

    /// Newest epoch the peer has reached.
    pub fn remote_index(&self) -> u32 {
        self.remote_indexed_frame().index
    }

    /// Newest frame the peer has recorded in its newest epoch.
    pub fn remote_frame(&self) -> u32 {
        self.remote_indexed_frame().frame
    }

    /// Newest position the peer has recorded.
    pub fn remote_indexed_frame(&self) -> IndexedFrame {
        self.inputs[self.remote_player.slot()].last_indexed_frame()
    }

    /// Notes that the peer entered epoch `index`.
    pub fn set_remote_index(&mut self, index: u32) {
        if index < self.start_index {
            return;
        }
        debug!(index, "remote epoch");
        self.inputs[self.remote_player.slot()].resize_to_index(index);
    }

    /// Earliest remote sample that changed while rolling back, or
    /// [`IndexedFrame::MAX`].
    pub fn last_changed_frame(&self) -> IndexedFrame {
        self.inputs[self.remote_player.slot()].last_changed_frame()
    }

    /// Forgets the change mark after a rollback has consumed it.
    pub fn clear_last_changed_frame(&mut self) {
        self.inputs[self.remote_player.slot()].clear_last_changed_frame();
    }
}

impl<H> InvariantChecker for SyncManager<H> {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.start_index > self.indexed_frame.index {
            return Err(InvariantViolation::new("SyncManager", "start_index <= index")
                .with_details(format!(
                    "start_index={}, index={}",
                    self.start_index, self.indexed_frame.index
                )));
        }
        for (slot, timeline) in self.inputs.iter().enumerate() {
            if timeline.start_index() != self.start_index {
                return Err(InvariantViolation::new(
                    "SyncManager",
                    "timelines share the sync start_index",
                )
                .with_details(format!(
                    "slot {} starts at {}, sync starts at {}",
                    slot,
                    timeline.start_index(),
                    self.start_index
                )));
            }
            timeline.check_invariants()?;
        }
        if self.local_player == self.remote_player {
            return Err(InvariantViolation::new("SyncManager", "local and remote players differ"));
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
    use super::testing::TestHost;
    use super::*;

    type Host = TestHost;

    fn sync(config: NetplayConfig) -> SyncManager<Host> {
        SyncManager::new(Host::default(), config).unwrap()
    }

    fn enter(sync: &mut SyncManager<Host>, phases: &[Phase]) {
        for &phase in phases {
            sync.set_phase(phase).unwrap();
        }
    }

    fn tick_to(sync: &mut SyncManager<Host>, frame: u32) {
        sync.host_mut().time = sync.epoch_start_time + frame;
        sync.update_frame();
    }

    fn in_game(config: NetplayConfig) -> SyncManager<Host> {
        let mut sync = sync(config);
        enter(
            &mut sync,
            &[Phase::Initial, Phase::CharaSelect, Phase::Loading, Phase::InGame],
        );
        sync
    }

    const PUNCH: InputSample = InputSample::combine(0, buttons::A);

    // ========================================================================
    // Phases
    // ========================================================================

    #[test]
    fn epoch_phases_bump_index_and_reset_frame() {
        let mut sync = sync(NetplayConfig::default());
        sync.set_phase(Phase::Initial).unwrap();
        assert_eq!(sync.index(), 0);

        tick_to(&mut sync, 50);
        sync.set_phase(Phase::CharaSelect).unwrap();
        assert_eq!(sync.indexed_frame(), IndexedFrame::new(1, 0));

        tick_to(&mut sync, 7);
        sync.set_phase(Phase::Loading).unwrap();
        assert_eq!(sync.indexed_frame(), IndexedFrame::new(2, 0));
        assert_eq!(sync.spectate_start_index(), 2);
    }

    #[test]
    fn invalid_transition_changes_nothing() {
        let mut sync = sync(NetplayConfig::default());
        let err = sync.set_phase(Phase::InGame).unwrap_err();
        assert_eq!(
            err,
            NetplayError::InvalidPhaseTransition {
                from: Phase::PreInitial,
                to: Phase::InGame
            }
        );
        assert_eq!(sync.phase(), Phase::PreInitial);
        assert_eq!(sync.indexed_frame(), IndexedFrame::default());
    }

    #[test]
    fn loading_starts_with_empty_timelines() {
        let mut sync = in_game(NetplayConfig::default());
        tick_to(&mut sync, 20);
        sync.set_input(Player::One, PUNCH);
        sync.set_input(Player::Two, PUNCH);

        enter(&mut sync, &[Phase::Skippable, Phase::RetryMenu, Phase::Loading]);
        for player in Player::BOTH {
            assert_eq!(sync.timeline(player).get(sync.indexed_frame()), InputSample::NONE);
        }
        assert_eq!(sync.start_index(), sync.index());
    }

    #[test]
    fn spectator_watermark_limits_pruning() {
        const ROUND: [Phase; 4] = [Phase::InGame, Phase::Skippable, Phase::RetryMenu, Phase::Loading];

        let mut sync = sync(NetplayConfig::lan());
        enter(&mut sync, &[Phase::Initial, Phase::CharaSelect, Phase::Loading]);
        assert_eq!(sync.start_index(), 2);

        // Within the margin of epoch 0: nothing can go.
        sync.set_preserve_start_index(3);
        enter(&mut sync, &ROUND);
        assert_eq!(sync.index(), 6);
        assert_eq!(sync.start_index(), 2);

        sync.set_preserve_start_index(12);
        enter(&mut sync, &ROUND);
        assert_eq!(sync.index(), 10);
        assert_eq!(sync.start_index(), 12 - PRESERVE_START_INDEX_BUFFER);
        for player in Player::BOTH {
            assert_eq!(sync.timeline(player).start_index(), 7);
        }

        sync.set_preserve_start_index(u32::MAX);
        enter(&mut sync, &ROUND);
        assert_eq!(sync.start_index(), sync.index());
    }

    #[test]
    fn buffered_preserve_margin() {
        assert_eq!(buffered_preserve(u32::MAX), u32::MAX);
        assert_eq!(buffered_preserve(5), 0);
        assert_eq!(buffered_preserve(3), 0);
        assert_eq!(buffered_preserve(12), 7);
    }

    #[test]
    fn capture_and_restore() {
        let mut sync = in_game(NetplayConfig::rollback());
        tick_to(&mut sync, 30);
        let saved = sync.capture_state();
        tick_to(&mut sync, 40);
        sync.restore_state(saved);
        assert_eq!(sync.frame(), 30);
        assert_eq!(sync.phase(), Phase::InGame);
    }

    // ========================================================================
    // Input timing
    // ========================================================================

    #[test]
    fn delay_two_reads_sample_from_two_frames_ago() {
        let mut sync = in_game(NetplayConfig {
            delay: 2,
            ..NetplayConfig::default()
        });
        let early = InputSample::combine(buttons::RIGHT, 0);

        tick_to(&mut sync, 9);
        sync.set_input(Player::One, early);
        tick_to(&mut sync, 10);
        sync.set_input(Player::One, InputSample::new(0x05));

        tick_to(&mut sync, 11);
        assert_eq!(sync.get_input(Player::One), early);
        tick_to(&mut sync, 12);
        assert_eq!(sync.get_input(Player::One), InputSample::new(0x05));
    }

    #[test]
    fn warmup_forces_zero() {
        let mut sync = in_game(NetplayConfig::default());
        tick_to(&mut sync, 3);
        sync.set_input(Player::One, PUNCH);
        assert_eq!(sync.get_input(Player::One), InputSample::NONE);
        tick_to(&mut sync, WARMUP_FRAMES);
        assert_eq!(sync.get_input(Player::One), PUNCH);
    }

    #[test]
    fn competitive_netplay_masks_start() {
        let mut sync = in_game(NetplayConfig::lan().with_role(Role::Host));
        let start = InputSample::combine(0, buttons::START | buttons::A);
        tick_to(&mut sync, 20);
        sync.set_input(Player::One, start);
        tick_to(&mut sync, 21);
        assert_eq!(sync.get_input(Player::One), PUNCH);
    }

    #[test]
    fn rollback_uses_rollback_delay() {
        let sync = in_game(NetplayConfig::rollback());
        assert!(sync.is_in_rollback());
        assert_eq!(sync.effective_delay(), 1);
    }

    #[test]
    fn set_input_is_first_write_wins() {
        let mut sync = in_game(NetplayConfig::default());
        tick_to(&mut sync, 12);
        sync.set_input(Player::Two, PUNCH);
        sync.set_input(Player::Two, InputSample::NONE);
        assert_eq!(sync.get_input(Player::Two), PUNCH);

        sync.assign_input(Player::Two, sync.indexed_frame(), InputSample::NONE);
        assert_eq!(sync.get_input(Player::Two), InputSample::NONE);
    }

    // ========================================================================
    // Menus
    // ========================================================================

    #[test]
    fn pre_initial_mashes_with_confirm_enabled() {
        let mut sync = sync(NetplayConfig::default());
        tick_to(&mut sync, 4);
        assert!(sync.get_input(Player::One).has_buttons(buttons::CONFIRM));
        assert_eq!(sync.host().confirm, MenuConfirmState::Enabled);
        tick_to(&mut sync, 5);
        assert_eq!(sync.get_input(Player::One), InputSample::NONE);
    }

    #[test]
    fn initial_only_host_player_mashes() {
        let mut sync = sync(NetplayConfig::lan());
        sync.set_phase(Phase::Initial).unwrap();
        tick_to(&mut sync, 2);
        assert_eq!(sync.get_input(Player::Two), InputSample::NONE);
        assert!(sync.get_input(Player::One).has_buttons(buttons::CONFIRM));
    }

    #[test]
    fn chara_select_masks() {
        let mut sync = sync(NetplayConfig::lan());
        enter(&mut sync, &[Phase::Initial, Phase::CharaSelect]);
        let confirm = InputSample::combine(0, buttons::CONFIRM);

        // Online lockout.
        tick_to(&mut sync, 10);
        sync.set_input(Player::One, confirm);
        tick_to(&mut sync, 11);
        assert_eq!(sync.get_input(Player::One), InputSample::NONE);

        // Cancel blocked away from the character selector.
        tick_to(&mut sync, 200);
        sync.set_input(Player::One, InputSample::combine(0, buttons::CANCEL));
        sync.host_mut().selector = SelectorMode::Moon;
        tick_to(&mut sync, 201);
        assert_eq!(sync.get_input(Player::One), InputSample::NONE);
    }

    #[test]
    fn chara_select_blocks_repeat_confirm() {
        let mut sync = sync(NetplayConfig::default());
        enter(&mut sync, &[Phase::Initial, Phase::CharaSelect]);
        let confirm = InputSample::combine(0, buttons::CONFIRM);
        for frame in 100..=101 {
            tick_to(&mut sync, frame);
            sync.set_input(Player::One, confirm);
        }
        tick_to(&mut sync, 100);
        assert_eq!(sync.get_input(Player::One), confirm);
        tick_to(&mut sync, 101);
        assert_eq!(sync.get_input(Player::One), InputSample::NONE);
    }

    #[test]
    fn skippable_keeps_only_confirm_or_mashes_when_remote_ahead() {
        let mut sync = sync(NetplayConfig::lan());
        enter(&mut sync, &[Phase::Initial, Phase::CharaSelect, Phase::Loading]);
        tick_to(&mut sync, 20);
        sync.set_input(
            Player::One,
            InputSample::combine(buttons::DOWN, buttons::CONFIRM | buttons::CANCEL),
        );
        tick_to(&mut sync, 21);
        assert_eq!(
            sync.get_input(Player::One),
            InputSample::combine(0, buttons::CONFIRM)
        );

        sync.set_remote_index(sync.index() + 1);
        tick_to(&mut sync, 22);
        assert_eq!(
            sync.get_input(Player::One),
            InputSample::combine(0, buttons::CONFIRM)
        );
        tick_to(&mut sync, 23);
        assert_eq!(sync.get_input(Player::One), InputSample::NONE);
    }

    #[test]
    fn pause_menu_blocks_confirm_after_cursor_move() {
        let mut sync = in_game(NetplayConfig::training());
        sync.host_mut().paused = true;
        tick_to(&mut sync, 20);
        sync.set_input(Player::One, InputSample::combine(buttons::DOWN, 0));
        tick_to(&mut sync, 21);
        sync.set_input(Player::One, InputSample::combine(0, buttons::CONFIRM));

        assert_eq!(sync.get_input(Player::One), InputSample::NONE);
        assert_eq!(sync.host().confirm, MenuConfirmState::Enabled);
    }

    #[test]
    fn training_reset_reaches_host() {
        let mut sync = in_game(NetplayConfig::training());
        for frame in 20..23 {
            tick_to(&mut sync, frame);
            sync.set_input(Player::One, InputSample::combine(buttons::RIGHT, buttons::FN2));
            sync.get_input(Player::One);
        }
        assert_eq!(
            sync.host().resets.first(),
            Some(&(
                Player::One,
                TrainingResetAction::Reset {
                    kind: TrainingResetKind::Right
                }
            ))
        );
        assert_eq!(sync.host().resets.len(), 2);
    }

    fn retry_menu(config: NetplayConfig) -> SyncManager<Host> {
        let mut sync = in_game(config);
        enter(&mut sync, &[Phase::Skippable, Phase::RetryMenu]);
        sync
    }

    #[test]
    fn retry_menu_waits_for_both_choices() {
        let mut sync = retry_menu(NetplayConfig::lan());
        tick_to(&mut sync, 5);

        // The player confirms entry 2 while the hook is disabled.
        sync.host_mut().menu_index = 2;
        sync.host_mut().confirm = MenuConfirmState::Confirmed;
        assert_eq!(sync.get_input(Player::One), InputSample::NONE);
        assert_eq!(
            sync.local_retry_menu_index(),
            Some(MenuIndex {
                index: sync.index(),
                menu_index: 2
            })
        );
        assert_eq!(sync.host().confirm, MenuConfirmState::Disabled);
        assert_eq!(sync.menu_target(), None);

        sync.set_remote_retry_menu_index(0);
        sync.get_input(Player::One);
        assert_eq!(sync.menu_target(), Some(2));
        assert_eq!(sync.retry_menu_index(sync.index()), Some(2));
    }

    #[test]
    fn retry_menu_agreement_is_capped() {
        let mut sync = retry_menu(NetplayConfig::rollback());
        tick_to(&mut sync, 5);
        sync.host_mut().menu_index = 0;
        sync.host_mut().confirm = MenuConfirmState::Confirmed;
        sync.get_input(Player::One);
        sync.set_remote_retry_menu_index(2);
        sync.get_input(Player::One);
        // Saving replays is off the table with rollback.
        assert_eq!(sync.menu_target(), Some(1));
    }

    #[test]
    fn retry_menu_ignores_remote_player() {
        let mut sync = retry_menu(NetplayConfig::lan());
        tick_to(&mut sync, 4);
        sync.set_input(Player::Two, PUNCH);
        assert_eq!(sync.get_input(Player::Two), InputSample::NONE);
    }

    #[test]
    fn offline_retry_menu_passes_input_through() {
        let mut sync = retry_menu(NetplayConfig::default());
        tick_to(&mut sync, 10);
        let confirm = InputSample::combine(0, buttons::CONFIRM);
        sync.set_input(Player::Two, confirm);
        assert_eq!(sync.get_input(Player::Two), confirm);
        assert_eq!(sync.host().confirm, MenuConfirmState::Enabled);
    }

    #[test]
    fn spectator_follows_recorded_retry_choice() {
        let mut sync = retry_menu(NetplayConfig::default().with_role(Role::SpectateNetplay));
        sync.set_retry_menu_index(sync.index(), 1);
        tick_to(&mut sync, 3);
        assert_eq!(sync.get_input(Player::One), InputSample::NONE);
        assert_eq!(sync.menu_target(), Some(1));
    }

    // ========================================================================
    // Remote data
    // ========================================================================

    fn batch(index: u32, last_frame: u32, value: InputSample) -> PlayerInputs {
        let mut message = PlayerInputs::new(IndexedFrame::new(index, last_frame));
        let count = (message.end_frame() - message.start_frame()) as usize;
        message.inputs.extend(std::iter::repeat(value).take(count));
        message
    }

    #[test]
    fn remote_readiness() {
        let mut sync = in_game(NetplayConfig::lan());
        let index = sync.index();
        tick_to(&mut sync, 20);
        assert!(!sync.is_remote_input_ready());

        sync.set_inputs(Player::Two, &batch(index - 1, 100, PUNCH));
        assert!(!sync.is_remote_input_ready());

        sync.set_inputs(Player::Two, &batch(index, 18, PUNCH));
        // 18 + delay 1 < 20
        assert!(!sync.is_remote_input_ready());
        sync.set_inputs(Player::Two, &batch(index, 19, PUNCH));
        assert!(sync.is_remote_input_ready());

        sync.set_remote_index(index + 1);
        tick_to(&mut sync, 500);
        assert!(sync.is_remote_input_ready());
    }

    #[test]
    fn stale_batches_are_dropped() {
        let mut sync = in_game(NetplayConfig::lan());
        let index = sync.index();
        sync.set_inputs(Player::Two, &batch(index - 2, 5, PUNCH));
        assert!(sync.timeline(Player::Two).is_epoch_empty(index - 2));
    }

    #[test]
    fn batches_at_the_last_frame_are_rejected() {
        let mut sync = in_game(NetplayConfig::lan());
        let index = sync.index();
        tick_to(&mut sync, 20);

        sync.set_inputs(Player::Two, &PlayerInputs::new(IndexedFrame::new(index, u32::MAX)));
        let full = PlayerInputs::with_inputs(
            IndexedFrame::new(index, u32::MAX),
            &[PUNCH; NUM_INPUTS],
        );
        sync.set_inputs(Player::Two, &full);
        sync.set_both_inputs(&BothInputs::new(IndexedFrame::new(index, u32::MAX)));

        assert!(sync.timeline(Player::Two).is_epoch_empty(index));
        assert!(sync.check_invariants().is_ok());
    }

    #[test]
    fn batches_far_past_the_known_end_are_rejected() {
        let mut sync = in_game(NetplayConfig::rollback());
        let index = sync.index();
        tick_to(&mut sync, 20);

        let lead = sync.max_batch_lead();
        let far = 400_000_000;
        sync.set_inputs(Player::Two, &batch(index, far, PUNCH));
        assert_eq!(sync.timeline(Player::Two).end_frame_of(index), 0);

        // Just inside the lead of the local frame is still accepted.
        let near = 20 + lead + NUM_INPUTS as u32 - 1;
        sync.set_inputs(Player::Two, &batch(index, near, PUNCH));
        assert_eq!(sync.timeline(Player::Two).end_frame_of(index), near + 1);

        // The next epoch starts from nothing, so only the lead applies.
        sync.set_inputs(Player::Two, &batch(index + 1, lead + NUM_INPUTS as u32, PUNCH));
        assert!(sync.timeline(Player::Two).is_epoch_empty(index + 1));
    }

    #[test]
    fn spectator_batches_far_ahead_are_rejected() {
        let mut spectator = in_game(NetplayConfig::default().with_role(Role::SpectateBroadcast));
        let index = spectator.index();
        let mut far = BothInputs::new(IndexedFrame::new(index, 1_000_000));
        far.inputs = [
            std::iter::repeat(PUNCH).take(NUM_INPUTS).collect(),
            std::iter::repeat(PUNCH).take(NUM_INPUTS).collect(),
        ];
        spectator.set_both_inputs(&far);
        for player in Player::BOTH {
            assert_eq!(spectator.timeline(player).end_frame_of(index), 0);
        }
    }

    #[test]
    fn epoch_table_defaults_without_default_values() {
        let mut table: EpochTable<RngState> = EpochTable::default();
        assert!(table.get(0, 0).is_none());
        table.insert(
            2,
            3,
            RngState {
                index: 3,
                bytes: vec![1],
            },
        );
        assert_eq!(table.get(2, 3).map(|state| state.index), Some(3));
    }

    #[test]
    fn rollback_tracks_changed_remote_frames() {
        let mut sync = in_game(NetplayConfig::rollback());
        let index = sync.index();
        tick_to(&mut sync, 40);
        sync.set_inputs(Player::Two, &batch(index, 20, InputSample::NONE));
        sync.clear_last_changed_frame();

        let mut corrected = batch(index, 25, InputSample::NONE);
        corrected.inputs[3] = PUNCH;
        sync.set_inputs(Player::Two, &corrected);

        let start = corrected.start_frame();
        assert_eq!(sync.last_changed_frame(), IndexedFrame::new(index, start + 3));
        sync.clear_last_changed_frame();
        assert!(sync.last_changed_frame().is_max());
    }

    #[test]
    fn inputs_message_carries_newest_batch() {
        let mut sync = in_game(NetplayConfig::lan());
        assert!(sync.inputs_message(Player::One).is_none());
        for frame in 0..40 {
            tick_to(&mut sync, frame);
            sync.set_input(Player::One, InputSample::new(frame as u16));
        }
        let message = sync.inputs_message(Player::One).unwrap();
        assert_eq!(message.indexed_frame, IndexedFrame::new(sync.index(), 39));
        assert_eq!(message.inputs.len(), NUM_INPUTS);
        assert_eq!(message.inputs[0], InputSample::new(10));
    }

    #[test]
    fn both_inputs_walks_cursor_through_epochs() {
        let mut sync = in_game(NetplayConfig::default().with_role(Role::Broadcast));
        let first = sync.index();
        for frame in 0..45 {
            tick_to(&mut sync, frame);
            for player in Player::BOTH {
                sync.set_input(player, InputSample::new(frame as u16));
            }
        }

        let mut cursor = IndexedFrame::new(first, NUM_INPUTS as u32 - 1);
        let batch = sync.both_inputs(&mut cursor).unwrap();
        assert_eq!(batch.indexed_frame, IndexedFrame::new(first, 29));
        assert_eq!(batch.inputs[1][29], InputSample::new(29));
        assert_eq!(cursor, IndexedFrame::new(first, 59));

        // Nothing newer than frame 44 yet.
        assert!(sync.both_inputs(&mut cursor).is_none());

        enter(&mut sync, &[Phase::Skippable]);
        let tail = sync.both_inputs(&mut cursor).unwrap();
        assert_eq!(tail.indexed_frame, IndexedFrame::new(first, 44));
        assert_eq!(tail.len(), NUM_INPUTS);
        assert_eq!(cursor, IndexedFrame::new(first + 1, NUM_INPUTS as u32 - 1));
    }

    #[test]
    fn set_both_inputs_fills_both_timelines() {
        let source = {
            let mut sync = in_game(NetplayConfig::default().with_role(Role::Broadcast));
            for frame in 0..30 {
                tick_to(&mut sync, frame);
                sync.set_input(Player::One, PUNCH);
                sync.set_input(Player::Two, InputSample::new(1));
            }
            let mut cursor = IndexedFrame::new(sync.index(), 29);
            sync.both_inputs(&mut cursor).unwrap()
        };

        let mut spectator = in_game(NetplayConfig::default().with_role(Role::SpectateBroadcast));
        spectator.set_both_inputs(&source);
        assert_eq!(
            spectator.timeline(Player::One).get(IndexedFrame::new(spectator.index(), 29)),
            PUNCH
        );
        assert_eq!(
            spectator.timeline(Player::Two).get(IndexedFrame::new(spectator.index(), 0)),
            InputSample::new(1)
        );
    }

    #[test]
    fn rng_state_bookkeeping() {
        let mut client = in_game(NetplayConfig::lan().with_role(Role::Client));
        let index = client.index();
        assert!(!client.is_rng_state_ready(true));
        assert!(client.is_rng_state_ready(false));

        client.set_rng_state(RngState {
            index: 0,
            bytes: vec![1],
        });
        assert!(client.rng_state(0).is_none());

        client.set_rng_state(RngState {
            index,
            bytes: vec![1, 2],
        });
        assert!(client.is_rng_state_ready(true));
        assert_eq!(client.rng_state(index).map(|s| s.bytes.len()), Some(2));

        let mut offline = in_game(NetplayConfig::default());
        offline.set_rng_state(RngState {
            index: offline.index(),
            bytes: vec![1],
        });
        assert!(offline.rng_state(offline.index()).is_none());
        assert!(offline.is_rng_state_ready(true));
    }

    #[test]
    fn client_plays_opposite_of_host() {
        let client = sync(NetplayConfig::lan().with_role(Role::Client));
        assert_eq!(client.local_player(), Player::Two);
        assert_eq!(client.remote_player(), Player::One);

        let mut host = sync(NetplayConfig::lan());
        assert_eq!(host.local_player(), Player::One);
        host.set_remote_player(Player::One);
        assert_eq!(host.local_player(), Player::Two);
    }

    #[test]
    fn spectator_jumps_to_initial_state() {
        let mut spectator = sync(NetplayConfig::default().with_role(Role::SpectateNetplay));
        spectator.set_initial_game_state(InitialGameState {
            indexed_frame: IndexedFrame::new(7, NUM_INPUTS as u32 - 1),
            phase: Phase::InGame,
            training: false,
            delay: 3,
            rollback: 0,
            rollback_delay: 0,
        });
        spectator.host_mut().time = 1000;
        enter(&mut spectator, &[Phase::Initial, Phase::AutoCharaSelect, Phase::Loading]);

        assert_eq!(spectator.indexed_frame(), IndexedFrame::new(7, 29));
        assert_eq!(spectator.start_index(), 7);
        assert_eq!(spectator.delay(), 3);
        spectator.update_frame();
        assert_eq!(spectator.frame(), 29);

        spectator.set_phase(Phase::InGame).unwrap();
        assert_eq!(spectator.indexed_frame(), IndexedFrame::new(8, 0));
    }

    #[test]
    fn invariants_hold_through_a_session() {
        let mut sync = in_game(NetplayConfig::rollback());
        enter(&mut sync, &[Phase::Skippable, Phase::RetryMenu, Phase::Loading]);
        assert!(sync.check_invariants().is_ok());
    }

    #[test]
    fn game_mode_training_is_not_competitive() {
        let config = NetplayConfig {
            game_mode: GameMode::Training,
            ..NetplayConfig::lan()
        };
        assert!(!config.is_competitive());
    }
}
