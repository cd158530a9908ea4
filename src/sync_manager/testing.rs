//! A scriptable [`HostBindings`] for unit tests.

use super::{HostBindings, MenuConfirmState, SelectorMode, TrainingResetAction};
use crate::{InputSample, Player};

#[derive(Debug, Default)]
pub(crate) struct TestHost {
    pub(crate) time: u32,
    pub(crate) menu_index: u8,
    pub(crate) confirm: MenuConfirmState,
    pub(crate) paused: bool,
    pub(crate) selector: SelectorMode,
    pub(crate) raw: [InputSample; 2],
    pub(crate) resets: Vec<(Player, TrainingResetAction)>,
}

impl HostBindings for TestHost {
    fn world_time(&self) -> u32 {
        self.time
    }

    fn current_menu_index(&self) -> u8 {
        self.menu_index
    }

    fn menu_confirm_state(&self) -> MenuConfirmState {
        self.confirm
    }

    fn set_menu_confirm_state(&mut self, state: MenuConfirmState) {
        self.confirm = state;
    }

    fn raw_input(&self, player: Player) -> InputSample {
        self.raw[player.slot()]
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn selector_mode(&self, _player: Player) -> SelectorMode {
        self.selector
    }

    fn apply_training_reset(&mut self, player: Player, action: TrainingResetAction) {
        self.resets.push((player, action));
    }
}
