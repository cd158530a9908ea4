//! Configuration types for netplay sessions.
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `NetplayConfig` | Role, delay, rollback window, menu automation | `lan()`, `rollback()`, `training()` |
//! | `ChannelConfig` | Go-Back-N retransmit and keepalive timing | `lan()`, `high_latency()` |
//! | `SnapshotConfig` | Rollback snapshot pool sizing | `minimal()`, `extended()` |
//! | `MenuNavTiming` | Tick counts tuned to the host UI | `default()` |
//!
//! Every config type has a `validate()` that returns
//! [`NetplayError::ConfigValueOutOfRange`] for the first bad field.
//!
//! ```
//! use rollback_netplay::{NetplayConfig, Role};
//!
//! let config = NetplayConfig {
//!     role: Role::Client,
//!     ..NetplayConfig::rollback()
//! };
//! assert!(config.validate().is_ok());
//! assert!(config.is_competitive());
//! ```

use web_time::Duration;

use crate::{NetplayError, Player, NUM_INPUTS};

/// Snapshot pool capacity used when nothing else is configured.
pub const DEFAULT_SNAPSHOT_CAPACITY: usize = 256;

/// Encoded size above which a reliable message is split into fragments.
pub const DEFAULT_MTU: usize = 256;

/// Largest accepted input delay or rollback window, in ticks.
pub const MAX_DELAY: u8 = NUM_INPUTS as u8;

fn out_of_range(field: &'static str, min: u64, max: u64, actual: u64) -> NetplayError {
    NetplayError::ConfigValueOutOfRange {
        field,
        min,
        max,
        actual,
    }
}

/// What this process is in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum Role {
    /// Netplay participant that accepted the connection.
    Host,
    /// Netplay participant that initiated the connection.
    Client,
    /// Read-only observer of a netplay match.
    SpectateNetplay,
    /// Read-only observer of a broadcast.
    SpectateBroadcast,
    /// Local match streamed to spectators.
    Broadcast,
    /// Local match, no network.
    #[default]
    Offline,
}

impl Role {
    /// Returns `true` for [`Role::Host`] and [`Role::Client`].
    #[must_use]
    pub const fn is_netplay(self) -> bool {
        matches!(self, Role::Host | Role::Client)
    }

    /// Returns `true` for either spectating role.
    #[must_use]
    pub const fn is_spectate(self) -> bool {
        matches!(self, Role::SpectateNetplay | Role::SpectateBroadcast)
    }

    /// Returns `true` if inputs are produced locally and only sent outward.
    #[must_use]
    pub const fn is_local(self) -> bool {
        matches!(self, Role::Broadcast | Role::Offline)
    }

    /// Returns `true` for anything but [`Role::Offline`].
    #[must_use]
    pub const fn is_online(self) -> bool {
        !matches!(self, Role::Offline)
    }
}

/// Match type selected at the main menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum GameMode {
    /// Regular versus match.
    #[default]
    Versus,
    /// Training mode, which enables the position reset helper.
    Training,
}

/// Tick counts tuned to the host UI's latency.
///
/// The defaults match a 60 Hz menu that needs a few frames to register a
/// cursor move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MenuNavTiming {
    /// Ticks to wait after each navigation step before re-reading the cursor.
    ///
    /// Default: 3
    pub settle_ticks: u32,

    /// Ticks after a cursor move (or a confirm/cancel at character select)
    /// during which confirm is suppressed.
    ///
    /// Default: 3
    pub confirm_cooldown: u32,

    /// Ticks at the start of an online character select during which confirm
    /// is suppressed.
    ///
    /// Default: 150
    pub chara_select_lockout: u32,
}

impl Default for MenuNavTiming {
    fn default() -> Self {
        Self {
            settle_ticks: 3,
            confirm_cooldown: 3,
            chara_select_lockout: 150,
        }
    }
}

impl MenuNavTiming {
    /// Validates the timing values.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::ConfigValueOutOfRange`] if a tick count is above 600.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.settle_ticks > 600 {
            return Err(out_of_range("settle_ticks", 0, 600, u64::from(self.settle_ticks)));
        }
        if self.confirm_cooldown > 600 {
            return Err(out_of_range(
                "confirm_cooldown",
                0,
                600,
                u64::from(self.confirm_cooldown),
            ));
        }
        if self.chara_select_lockout > 600 {
            return Err(out_of_range(
                "chara_select_lockout",
                0,
                600,
                u64::from(self.chara_select_lockout),
            ));
        }
        Ok(())
    }
}

/// Session-wide netplay configuration.
///
/// New fields may be added; construct with `..NetplayConfig::default()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "NetplayConfig has no effect unless passed to SyncManager::new()"]
pub struct NetplayConfig {
    /// What this process is in the session.
    ///
    /// Default: [`Role::Offline`]
    pub role: Role,

    /// Versus or training.
    ///
    /// Default: [`GameMode::Versus`]
    pub game_mode: GameMode,

    /// Input delay in ticks when rollback is off.
    ///
    /// Default: 0
    pub delay: u8,

    /// Rollback window in ticks; 0 disables rollback.
    ///
    /// Default: 0
    pub rollback: u8,

    /// Input delay in ticks used in place of `delay` while rollback is active.
    ///
    /// Default: 0
    pub rollback_delay: u8,

    /// Player controlled by the host. This side drives the main menu.
    ///
    /// Default: [`Player::One`]
    pub host_player: Player,

    /// Highest retry menu entry either side may select. `None` picks 1 with
    /// rollback (saving replays is unsafe while rewinding) and 2 otherwise.
    ///
    /// Default: `None`
    pub max_retry_menu_index: Option<u8>,

    /// Menu automation timing.
    pub menu_nav: MenuNavTiming,
}

impl Default for NetplayConfig {
    fn default() -> Self {
        Self {
            role: Role::Offline,
            game_mode: GameMode::Versus,
            delay: 0,
            rollback: 0,
            rollback_delay: 0,
            host_player: Player::One,
            max_retry_menu_index: None,
            menu_nav: MenuNavTiming::default(),
        }
    }
}

impl NetplayConfig {
    /// Creates a new `NetplayConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// LAN preset: netplay host with one tick of delay and no rollback.
    pub fn lan() -> Self {
        Self {
            role: Role::Host,
            delay: 1,
            ..Self::default()
        }
    }

    /// Internet preset with rollback: four ticks of delay, four ticks of
    /// rollback and one tick of delay while rolling back.
    pub fn rollback() -> Self {
        Self {
            role: Role::Host,
            delay: 4,
            rollback: 4,
            rollback_delay: 1,
            ..Self::default()
        }
    }

    /// Preset for distant peers (100-200ms RTT) without rollback.
    pub fn high_latency() -> Self {
        Self {
            role: Role::Host,
            delay: 8,
            ..Self::default()
        }
    }

    /// Offline training preset.
    pub fn training() -> Self {
        Self {
            role: Role::Offline,
            game_mode: GameMode::Training,
            ..Self::default()
        }
    }

    /// Returns a copy with `role` replaced.
    pub fn with_role(self, role: Role) -> Self {
        Self { role, ..self }
    }

    /// Netplay versus: pausing is disabled and training helpers are off.
    #[must_use]
    pub fn is_competitive(&self) -> bool {
        self.role.is_netplay() && self.game_mode == GameMode::Versus
    }

    /// Returns `true` if the rollback window is non-zero.
    #[must_use]
    pub fn has_rollback(&self) -> bool {
        self.rollback > 0
    }

    /// Highest retry menu entry either side may select.
    #[must_use]
    pub fn max_retry_menu_index(&self) -> u8 {
        self.max_retry_menu_index
            .unwrap_or(if self.has_rollback() { 1 } else { 2 })
    }

    /// Validates the netplay configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::ConfigValueOutOfRange`] if a delay or the
    /// rollback window exceeds [`MAX_DELAY`], or if the menu timing is invalid.
    pub fn validate(&self) -> Result<(), NetplayError> {
        let max = u64::from(MAX_DELAY);
        if self.delay > MAX_DELAY {
            return Err(out_of_range("delay", 0, max, u64::from(self.delay)));
        }
        if self.rollback > MAX_DELAY {
            return Err(out_of_range("rollback", 0, max, u64::from(self.rollback)));
        }
        if self.rollback_delay > MAX_DELAY {
            return Err(out_of_range(
                "rollback_delay",
                0,
                max,
                u64::from(self.rollback_delay),
            ));
        }
        self.menu_nav.validate()
    }
}

/// Timing of the Go-Back-N channel.
///
/// ```
/// use rollback_netplay::ChannelConfig;
/// use web_time::Duration;
///
/// let config = ChannelConfig {
///     keep_alive: Some(Duration::from_secs(2)),
///     ..ChannelConfig::default()
/// };
/// assert_eq!(config.keep_alive_ticks(), Some(40));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "ChannelConfig has no effect unless passed to ReliableChannel::new()"]
pub struct ChannelConfig {
    /// Period of [`ReliableChannel::on_tick`](crate::ReliableChannel::on_tick).
    ///
    /// Default: 50ms
    pub send_interval: Duration,

    /// Silence after which the peer is declared gone. `None` disables both
    /// keepalives and the timeout.
    ///
    /// Default: `None`
    pub keep_alive: Option<Duration>,

    /// Encoded size above which reliable messages are fragmented.
    ///
    /// Default: [`DEFAULT_MTU`]
    pub mtu: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            send_interval: Duration::from_millis(50),
            keep_alive: None,
            mtu: DEFAULT_MTU,
        }
    }
}

impl ChannelConfig {
    /// Creates a new `ChannelConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// LAN preset: fast retransmits and a short keepalive.
    pub fn lan() -> Self {
        Self {
            send_interval: Duration::from_millis(20),
            keep_alive: Some(Duration::from_secs(5)),
            mtu: DEFAULT_MTU,
        }
    }

    /// Preset for distant peers: slower retransmits and a generous keepalive.
    pub fn high_latency() -> Self {
        Self {
            send_interval: Duration::from_millis(100),
            keep_alive: Some(Duration::from_secs(20)),
            mtu: DEFAULT_MTU,
        }
    }

    /// Keepalive expressed in whole ticks of `send_interval`.
    #[must_use]
    pub fn keep_alive_ticks(&self) -> Option<u32> {
        let interval = self.send_interval.as_millis().max(1);
        self.keep_alive
            .map(|keep_alive| u32::try_from(keep_alive.as_millis() / interval).unwrap_or(u32::MAX))
    }

    /// Validates the channel configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::ConfigValueOutOfRange`] if `send_interval` is
    /// outside 1ms..=10s, `keep_alive` is shorter than one interval or longer
    /// than ten minutes, or `mtu` is outside 32..=65507.
    pub fn validate(&self) -> Result<(), NetplayError> {
        let interval_ms = self.send_interval.as_millis() as u64;
        if !(1..=10_000).contains(&interval_ms) {
            return Err(out_of_range("send_interval", 1, 10_000, interval_ms));
        }
        if let Some(keep_alive) = self.keep_alive {
            let keep_alive_ms = keep_alive.as_millis() as u64;
            if keep_alive_ms < interval_ms || keep_alive_ms > 600_000 {
                return Err(out_of_range("keep_alive", interval_ms, 600_000, keep_alive_ms));
            }
        }
        if !(32..=65_507).contains(&self.mtu) {
            return Err(out_of_range("mtu", 32, 65_507, self.mtu as u64));
        }
        Ok(())
    }
}

/// Sizing of the rollback snapshot pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "SnapshotConfig has no effect unless passed to SnapshotStore::allocate_with_config()"]
pub struct SnapshotConfig {
    /// Number of snapshots kept before the oldest is evicted.
    ///
    /// Default: [`DEFAULT_SNAPSHOT_CAPACITY`]
    pub capacity: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_SNAPSHOT_CAPACITY,
        }
    }
}

impl SnapshotConfig {
    /// Enough for a small rollback window with a little slack.
    pub fn minimal() -> Self {
        Self { capacity: 16 }
    }

    /// Long history for replay seeking.
    pub fn extended() -> Self {
        Self { capacity: 1024 }
    }

    /// Validates the snapshot configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::ConfigValueOutOfRange`] if `capacity` is outside 1..=4096.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if !(1..=4096).contains(&self.capacity) {
            return Err(out_of_range("capacity", 1, 4096, self.capacity as u64));
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
    use super::*;

    #[test]
    fn presets_validate() {
        for config in [
            NetplayConfig::default(),
            NetplayConfig::lan(),
            NetplayConfig::rollback(),
            NetplayConfig::high_latency(),
            NetplayConfig::training(),
        ] {
            assert!(config.validate().is_ok(), "{config:?}");
        }
        for config in [
            ChannelConfig::default(),
            ChannelConfig::lan(),
            ChannelConfig::high_latency(),
        ] {
            assert!(config.validate().is_ok(), "{config:?}");
        }
        for config in [
            SnapshotConfig::default(),
            SnapshotConfig::minimal(),
            SnapshotConfig::extended(),
        ] {
            assert!(config.validate().is_ok(), "{config:?}");
        }
    }

    #[test]
    fn delay_above_limit_is_rejected() {
        let config = NetplayConfig {
            delay: MAX_DELAY + 1,
            ..NetplayConfig::default()
        };
        match config.validate() {
            Err(NetplayError::ConfigValueOutOfRange { field, actual, .. }) => {
                assert_eq!(field, "delay");
                assert_eq!(actual, u64::from(MAX_DELAY) + 1);
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn max_retry_menu_index_depends_on_rollback() {
        assert_eq!(NetplayConfig::lan().max_retry_menu_index(), 2);
        assert_eq!(NetplayConfig::rollback().max_retry_menu_index(), 1);
        let pinned = NetplayConfig {
            max_retry_menu_index: Some(0),
            ..NetplayConfig::rollback()
        };
        assert_eq!(pinned.max_retry_menu_index(), 0);
    }

    #[test]
    fn competitive_needs_netplay_versus() {
        assert!(NetplayConfig::lan().is_competitive());
        assert!(!NetplayConfig::training().is_competitive());
        assert!(!NetplayConfig::lan().with_role(Role::Broadcast).is_competitive());
        let netplay_training = NetplayConfig {
            game_mode: GameMode::Training,
            ..NetplayConfig::lan()
        };
        assert!(!netplay_training.is_competitive());
    }

    #[test]
    fn keep_alive_ticks_rounds_down() {
        let config = ChannelConfig {
            send_interval: Duration::from_millis(30),
            keep_alive: Some(Duration::from_millis(100)),
            ..ChannelConfig::default()
        };
        assert_eq!(config.keep_alive_ticks(), Some(3));
        assert_eq!(ChannelConfig::default().keep_alive_ticks(), None);
    }

    #[test]
    fn keep_alive_shorter_than_interval_is_rejected() {
        let config = ChannelConfig {
            send_interval: Duration::from_millis(100),
            keep_alive: Some(Duration::from_millis(50)),
            ..ChannelConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(NetplayError::ConfigValueOutOfRange {
                field: "keep_alive",
                ..
            })
        ));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(SnapshotConfig { capacity: 0 }.validate().is_err());
    }

    #[test]
    fn role_predicates() {
        assert!(Role::Host.is_netplay() && Role::Client.is_netplay());
        assert!(Role::SpectateNetplay.is_spectate());
        assert!(Role::Broadcast.is_local() && Role::Offline.is_local());
        assert!(!Role::Offline.is_online());
        assert!(Role::SpectateBroadcast.is_online());
    }
}
