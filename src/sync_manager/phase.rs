use serde::{Deserialize, Serialize};

/// Where the host game is, as far as netplay is concerned.
///
/// Declaration order is meaningful: everything from [`Phase::CharaSelect`]
/// onward starts a new epoch when entered, and comparisons such as
/// `phase < Phase::CharaSelect` are used throughout.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Phase {
    /// Boot screens before the main menu.
    #[default]
    PreInitial,
    /// Main menu.
    Initial,
    /// Character select driven from a spectator's initial state.
    AutoCharaSelect,
    /// Character select.
    CharaSelect,
    /// Loading screen.
    Loading,
    /// Intros, round transitions and other skippable screens.
    Skippable,
    /// A match is running.
    InGame,
    /// Post-match retry menu.
    RetryMenu,
    /// The pause menu is open during a match.
    PauseMenu,
}

impl Phase {
    /// Every phase in declaration order.
    pub const ALL: [Phase; 9] = [
        Phase::PreInitial,
        Phase::Initial,
        Phase::AutoCharaSelect,
        Phase::CharaSelect,
        Phase::Loading,
        Phase::Skippable,
        Phase::InGame,
        Phase::RetryMenu,
        Phase::PauseMenu,
    ];

    /// Returns `true` if entering this phase starts a new epoch.
    #[must_use]
    pub const fn starts_epoch(self) -> bool {
        matches!(
            self,
            Phase::CharaSelect
                | Phase::Loading
                | Phase::Skippable
                | Phase::InGame
                | Phase::RetryMenu
                | Phase::PauseMenu
        )
    }

    /// Returns `true` if `next` may follow this phase.
    #[must_use]
    pub const fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (PreInitial, Initial)
                | (Initial, AutoCharaSelect | CharaSelect)
                | (AutoCharaSelect, Loading)
                | (CharaSelect, Loading)
                | (Loading, Skippable | InGame)
                | (Skippable, InGame | RetryMenu)
                | (InGame, Skippable | CharaSelect | PauseMenu)
                | (RetryMenu, Loading | CharaSelect)
                | (PauseMenu, InGame | CharaSelect)
        )
    }

    /// Lower-case label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Phase::PreInitial => "pre_initial",
            Phase::Initial => "initial",
            Phase::AutoCharaSelect => "auto_chara_select",
            Phase::CharaSelect => "chara_select",
            Phase::Loading => "loading",
            Phase::Skippable => "skippable",
            Phase::InGame => "in_game",
            Phase::RetryMenu => "retry_menu",
            Phase::PauseMenu => "pause_menu",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_follows_declaration() {
        for pair in Phase::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert!(Phase::AutoCharaSelect < Phase::CharaSelect);
    }

    #[test]
    fn only_chara_select_onward_starts_epochs() {
        let starting: Vec<Phase> = Phase::ALL
            .into_iter()
            .filter(|phase| phase.starts_epoch())
            .collect();
        assert_eq!(starting.first(), Some(&Phase::CharaSelect));
        assert_eq!(starting.len(), 6);
    }

    #[test]
    fn transition_table() {
        assert!(Phase::PreInitial.can_transition_to(Phase::Initial));
        assert!(Phase::InGame.can_transition_to(Phase::PauseMenu));
        assert!(Phase::PauseMenu.can_transition_to(Phase::CharaSelect));
        assert!(Phase::RetryMenu.can_transition_to(Phase::Loading));

        assert!(!Phase::PreInitial.can_transition_to(Phase::InGame));
        assert!(!Phase::Loading.can_transition_to(Phase::RetryMenu));
        assert!(!Phase::InGame.can_transition_to(Phase::InGame));
        assert!(!Phase::AutoCharaSelect.can_transition_to(Phase::CharaSelect));
    }

    #[test]
    fn every_phase_but_pre_initial_is_reachable() {
        for next in Phase::ALL.into_iter().skip(1) {
            assert!(
                Phase::ALL.into_iter().any(|from| from.can_transition_to(next)),
                "{next} unreachable"
            );
        }
    }
}
