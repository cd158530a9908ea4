//! Training mode position reset, triggered by FN2 plus a direction.

use super::host::{TrainingResetAction, TrainingResetKind};
use crate::buttons;
use crate::InputSample;

/// Ticks FN2 must stay held before a reset turns into a side swap.
const HELD_RESET_TICKS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ResetState {
    #[default]
    Idle,
    InProgress(u32),
    Held,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TrainingReset {
    state: ResetState,
    kind: TrainingResetKind,
}

impl Default for TrainingReset {
    fn default() -> Self {
        Self {
            state: ResetState::Idle,
            kind: TrainingResetKind::Center,
        }
    }
}

impl TrainingReset {
    /// Advances one tick. Returns the input to use and the host action, if any.
    pub(crate) fn step(&mut self, input: InputSample) -> (InputSample, Option<TrainingResetAction>) {
        let pressed = input.has_buttons(buttons::FN2);
        let held = input.with_buttons(buttons::FN2);

        match self.state {
            ResetState::Idle if pressed => {
                self.state = ResetState::InProgress(0);
                self.kind = TrainingResetKind::from_direction(input.direction());
                (held, None)
            },
            ResetState::InProgress(_) | ResetState::Held if !pressed => {
                self.state = ResetState::Idle;
                (input, None)
            },
            ResetState::InProgress(ticks) if ticks > HELD_RESET_TICKS => {
                self.state = ResetState::Held;
                (held, Some(TrainingResetAction::HeldReset { kind: self.kind }))
            },
            ResetState::InProgress(ticks) => {
                self.state = ResetState::InProgress(ticks + 1);
                (held, Some(TrainingResetAction::Reset { kind: self.kind }))
            },
            ResetState::Idle | ResetState::Held => (input, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fn2(direction: u16) -> InputSample {
        InputSample::combine(direction, buttons::FN2)
    }

    #[test]
    fn tap_resets_while_held_then_releases() {
        let mut reset = TrainingReset::default();

        assert_eq!(reset.step(fn2(buttons::LEFT)).1, None);
        assert_eq!(
            reset.step(fn2(0)).1,
            Some(TrainingResetAction::Reset {
                kind: TrainingResetKind::Left
            })
        );
        assert_eq!(reset.step(InputSample::NONE), (InputSample::NONE, None));
        assert_eq!(reset.state, ResetState::Idle);
    }

    #[test]
    fn long_hold_swaps_once() {
        let mut reset = TrainingReset::default();
        let actions: Vec<_> = (0..20).filter_map(|_| reset.step(fn2(0)).1).collect();

        let held = actions
            .iter()
            .filter(|action| matches!(action, TrainingResetAction::HeldReset { .. }))
            .count();
        assert_eq!(held, 1);
        assert_eq!(actions.len(), 12);
        assert_eq!(
            actions.last(),
            Some(&TrainingResetAction::HeldReset {
                kind: TrainingResetKind::Center
            })
        );
    }

    #[test]
    fn without_fn2_nothing_happens() {
        let mut reset = TrainingReset::default();
        let input = InputSample::combine(buttons::DOWN, buttons::A);
        assert_eq!(reset.step(input), (input, None));
    }
}
