//! Automatic menu navigation.
//!
//! Once both sides agree on a menu entry the cursor is walked there one step
//! at a time, waiting after each step for the host UI to register the move,
//! and the entry is then confirmed by mashing.

use tracing::debug;

use crate::buttons;
use crate::config::MenuNavTiming;
use crate::InputSample;

/// Alternates the given buttons with nothing, starting pressed on even frames.
pub(crate) fn mash(frame: u32, buttons: u16) -> InputSample {
    if frame % 2 == 1 {
        InputSample::NONE
    } else {
        InputSample::combine(0, buttons)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum NavState {
    #[default]
    Idle,
    Determined,
    Step,
    Settle(u32),
    Mash,
}

/// What the navigator wants this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NavOutput {
    /// Send this input, confirm hook unchanged.
    Input(InputSample),
    /// Mash confirm with the confirm hook enabled.
    Confirm,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MenuNav {
    state: NavState,
    target: Option<u8>,
}

impl MenuNav {
    pub(crate) fn set_target(&mut self, target: u8) {
        debug!(target, "menu navigation target set");
        self.target = Some(target);
        self.state = NavState::Determined;
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn target(&self) -> Option<u8> {
        self.target
    }

    pub(crate) fn is_active(&self) -> bool {
        self.target.is_some() && self.state != NavState::Idle
    }

    pub(crate) fn next(&mut self, current: u8, timing: &MenuNavTiming) -> NavOutput {
        let Some(target) = self.target else {
            return NavOutput::Input(InputSample::NONE);
        };

        match self.state {
            NavState::Idle => {},
            NavState::Determined => self.state = NavState::Step,
            NavState::Step => {
                self.state = NavState::Settle(0);
                if target != current {
                    let direction = if target < current { buttons::UP } else { buttons::DOWN };
                    return NavOutput::Input(InputSample::combine(direction, 0));
                }
            },
            NavState::Settle(waited) if waited < timing.settle_ticks => {
                self.state = NavState::Settle(waited + 1);
            },
            NavState::Settle(_) => {
                if target != current {
                    self.state = NavState::Step;
                } else {
                    debug!(target, "menu target reached");
                    self.state = NavState::Mash;
                }
            },
            NavState::Mash => return NavOutput::Confirm,
        }
        NavOutput::Input(InputSample::NONE)
    }
}
