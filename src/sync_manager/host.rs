use serde::{Deserialize, Serialize};

use crate::{InputSample, Player};

/// Whether the host's menu hook lets a confirm through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MenuConfirmState {
    /// Confirms are swallowed.
    #[default]
    Disabled,
    /// A confirm was swallowed while disabled. The host sets this; the sync
    /// manager reads it to learn the player's choice.
    Confirmed,
    /// Confirms pass through.
    Enabled,
}

/// Which selector a player is operating at character select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SelectorMode {
    /// Picking a character.
    #[default]
    Character,
    /// Picking a moon (style).
    Moon,
    /// Picking a color.
    Color,
    /// Selection finished, waiting for the other side.
    Ready,
}

/// Where a training reset puts the players.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrainingResetKind {
    /// Centre of the stage.
    Center,
    /// Near the left wall.
    Left,
    /// Near the right wall.
    Right,
    /// Close together in the middle.
    Down,
}

impl TrainingResetKind {
    pub(crate) const fn from_direction(direction: u16) -> Self {
        match direction {
            crate::buttons::LEFT => TrainingResetKind::Left,
            crate::buttons::RIGHT => TrainingResetKind::Right,
            crate::buttons::DOWN => TrainingResetKind::Down,
            _ => TrainingResetKind::Center,
        }
    }
}

/// Something the host must do to its memory for a training reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrainingResetAction {
    /// Keep the players at the reset position this tick.
    Reset {
        /// Position requested.
        kind: TrainingResetKind,
    },
    /// The reset button has been held long enough to swap sides.
    HeldReset {
        /// Position requested when the hold began.
        kind: TrainingResetKind,
    },
}

/// What the sync manager needs from the host game.
///
/// Implemented by the process that owns the game; tests use a plain struct.
pub trait HostBindings {
    /// Monotonic frame clock of the game.
    fn world_time(&self) -> u32;

    /// Cursor position of whichever menu is open.
    fn current_menu_index(&self) -> u8;

    /// Current state of the confirm hook.
    fn menu_confirm_state(&self) -> MenuConfirmState;

    /// Updates the confirm hook.
    fn set_menu_confirm_state(&mut self, state: MenuConfirmState);

    /// Controller state of a locally attached player.
    fn raw_input(&self, player: Player) -> InputSample;

    /// Returns `true` while the in-match pause menu is open.
    fn is_paused(&self) -> bool {
        false
    }

    /// Selector mode of `player` at character select.
    fn selector_mode(&self, _player: Player) -> SelectorMode {
        SelectorMode::Character
    }

    /// Applies a training reset on behalf of `player`.
    fn apply_training_reset(&mut self, _player: Player, _action: TrainingResetAction) {}
}
