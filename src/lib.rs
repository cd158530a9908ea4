//! # rollback-netplay
//!
//! The netcode core of a two-player rollback netplay tool. It keeps two
//! fighting-game simulations in lockstep over an unreliable network, hiding
//! latency with configurable input delay and speculative rollback.
//!
//! The crate is tick-driven and never blocks. Each simulation tick the owner:
//!
//! 1. calls [`SyncManager::update_frame`],
//! 2. reads both players' inputs through [`SyncManager::get_input`],
//! 3. records the local sample with [`SyncManager::set_input`],
//! 4. moves remote samples in through a [`ReliableChannel`] (or the
//!    unreliable side channel),
//! 5. optionally saves or loads a [`SnapshotStore`] entry,
//! 6. lets the [`SpectatorBroadcaster`] drain new data to observers.
//!
//! [`NetplaySession`] bundles these steps for the common case.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use config::{ChannelConfig, GameMode, MenuNavTiming, NetplayConfig, Role, SnapshotConfig};
pub use error::NetplayError;
pub use input_timeline::InputTimeline;
pub use network::chaos_link::{ChaosConfig, ChaosLink};
pub use network::messages::{
    BothInputs, InitialGameState, MenuIndex, NetplayMessage, PlayerInputs, RngState,
    SpectatorMessage, TransitionIndex,
};
pub use network::reliable_channel::{ChannelEvent, ChannelPacket, ReliableChannel};
pub use sessions::netplay_session::{NetplayEvent, NetplaySession};
pub use sessions::spectator_broadcaster::SpectatorBroadcaster;
pub use snapshot_store::region::{MemoryAccessor, PointerRegion, RegionCatalog, RegionDescriptor};
pub use snapshot_store::SnapshotStore;
pub use sync_manager::{
    HostBindings, MenuConfirmState, Phase, SelectorMode, SyncManager, SyncState,
    TrainingResetAction, TrainingResetKind,
};

pub mod buttons;
pub mod config;
#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod input_timeline;
pub mod prelude;
/// Seeded PCG32 generator backing the chaos link.
pub mod rng;
#[doc(hidden)]
pub mod snapshot_store;
#[doc(hidden)]
pub mod sync_manager;
pub mod telemetry;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod netplay_session;
    #[doc(hidden)]
    pub mod spectator_broadcaster;
}
#[doc(hidden)]
pub mod network {
    pub mod chaos_link;
    /// Binary codec for netplay message serialization.
    ///
    /// Provides one bincode configuration shared by both peers.
    pub mod codec;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod reliable_channel;
}

// #############
// # CONSTANTS #
// #############

/// Number of consecutive samples carried by one input batch message.
pub const NUM_INPUTS: usize = 30;

/// Safety margin subtracted from the spectator watermark before old epochs
/// are pruned, so chained spectators can still catch up.
pub const PRESERVE_START_INDEX_BUFFER: u32 = 5;

/// Ticks at the start of every match during which input is forced to zero.
pub const WARMUP_FRAMES: u32 = 10;

/// A position in netplay time: the epoch `index` and the `frame` within it.
///
/// `index` increments on every epoch-changing phase transition and `frame`
/// restarts at zero. Ordering is lexicographic on `(index, frame)`, which the
/// derive gives us because `index` is declared first.
///
/// ```
/// use rollback_netplay::IndexedFrame;
///
/// let a = IndexedFrame::new(1, 900);
/// let b = IndexedFrame::new(2, 0);
/// assert!(a < b);
/// assert!(IndexedFrame::new(2, 5) > b);
/// assert_eq!(b.to_string(), "2:0");
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct IndexedFrame {
    /// Epoch counter.
    pub index: u32,
    /// Ticks since the epoch began.
    pub frame: u32,
}

impl IndexedFrame {
    /// Largest representable position. Used as the "no change" sentinel.
    pub const MAX: IndexedFrame = IndexedFrame {
        index: u32::MAX,
        frame: u32::MAX,
    };

    /// Creates a new indexed frame.
    #[inline]
    #[must_use]
    pub const fn new(index: u32, frame: u32) -> Self {
        Self { index, frame }
    }

    /// Returns `true` for the [`IndexedFrame::MAX`] sentinel.
    #[inline]
    #[must_use]
    pub const fn is_max(self) -> bool {
        self.index == u32::MAX && self.frame == u32::MAX
    }

    /// The same epoch, `n` frames later (saturating).
    #[inline]
    #[must_use]
    pub const fn plus_frames(self, n: u32) -> Self {
        Self {
            index: self.index,
            frame: self.frame.saturating_add(n),
        }
    }

    /// The same epoch, `n` frames earlier, or `None` before the epoch began.
    #[inline]
    #[must_use]
    pub fn minus_frames(self, n: u32) -> Option<Self> {
        self.frame.checked_sub(n).map(|frame| Self {
            index: self.index,
            frame,
        })
    }
}

impl std::fmt::Display for IndexedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_max() {
            write!(f, "MAX")
        } else {
            write!(f, "{}:{}", self.index, self.frame)
        }
    }
}

/// One player's controller state for one tick.
///
/// The low nibble is a numpad direction (5 is written as 0, meaning neutral),
/// the remaining bits are buttons shifted left by four. See [`buttons`].
///
/// ```
/// use rollback_netplay::{buttons, InputSample};
///
/// let input = InputSample::combine(buttons::DOWN, buttons::A | buttons::CONFIRM);
/// assert_eq!(input.direction(), buttons::DOWN);
/// assert!(input.has_buttons(buttons::CONFIRM));
/// assert!(!input.without_buttons(buttons::CONFIRM).has_buttons(buttons::CONFIRM));
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct InputSample(u16);

impl InputSample {
    /// No direction and no buttons.
    pub const NONE: InputSample = InputSample(0);

    /// Wraps a raw 16-bit sample.
    #[inline]
    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Builds a sample from a direction and button bits.
    #[inline]
    #[must_use]
    pub const fn combine(direction: u16, buttons: u16) -> Self {
        Self((direction & 0xF) | (buttons << 4))
    }

    /// Returns the raw 16-bit value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// The numpad direction nibble.
    #[inline]
    #[must_use]
    pub const fn direction(self) -> u16 {
        self.0 & 0xF
    }

    /// The button bits, unshifted.
    #[inline]
    #[must_use]
    pub const fn buttons(self) -> u16 {
        self.0 >> 4
    }

    /// Returns `true` if any of `buttons` is pressed.
    #[inline]
    #[must_use]
    pub const fn has_buttons(self, buttons: u16) -> bool {
        self.buttons() & buttons != 0
    }

    /// Returns `true` if the direction is straight up or straight down.
    #[inline]
    #[must_use]
    pub const fn is_vertical(self) -> bool {
        matches!(self.direction(), buttons::UP | buttons::DOWN)
    }

    /// Clears `buttons`, keeping everything else.
    #[inline]
    #[must_use]
    pub const fn without_buttons(self, buttons: u16) -> Self {
        Self(self.0 & !(buttons << 4))
    }

    /// Keeps only `buttons`, dropping the direction and other buttons.
    #[inline]
    #[must_use]
    pub const fn only_buttons(self, buttons: u16) -> Self {
        Self(self.0 & (buttons << 4))
    }

    /// Sets `buttons` in addition to whatever is held.
    #[inline]
    #[must_use]
    pub const fn with_buttons(self, buttons: u16) -> Self {
        Self(self.0 | (buttons << 4))
    }
}

impl From<u16> for InputSample {
    #[inline]
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl From<InputSample> for u16 {
    #[inline]
    fn from(sample: InputSample) -> Self {
        sample.0
    }
}

/// One of the two active participants.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum Player {
    /// Left side at match start.
    One,
    /// Right side at match start.
    Two,
}

impl Player {
    /// Both players in order.
    pub const BOTH: [Player; 2] = [Player::One, Player::Two];

    /// Zero-based slot used for per-player arrays.
    #[inline]
    #[must_use]
    pub const fn slot(self) -> usize {
        match self {
            Player::One => 0,
            Player::Two => 1,
        }
    }

    /// The other participant.
    #[inline]
    #[must_use]
    pub const fn opposite(self) -> Player {
        match self {
            Player::One => Player::Two,
            Player::Two => Player::One,
        }
    }
}

impl std::fmt::Display for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Player::One => write!(f, "P1"),
            Player::Two => write!(f, "P2"),
        }
    }
}

// #############
// #  TRAITS   #
// #############

/// The raw, unordered and lossy datagram path under a [`ReliableChannel`].
///
/// Packets may be dropped, duplicated or reordered; the channel tolerates all
/// three. Encoding is up to the implementor (see [`network::codec`]).
pub trait Transport<M> {
    /// Hands one packet to the network. Failures are the transport's concern.
    fn send_raw(&mut self, packet: &ChannelPacket<M>);
}

/// Delivery path from the [`SpectatorBroadcaster`] to individual observers.
pub trait SpectatorTransport<O> {
    /// Sends `message` to `observer`, best effort.
    fn send(&mut self, observer: &O, message: &SpectatorMessage);
}

// ###################
// # UNIT TESTS      #
// ###################

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_frame_orders_by_index_then_frame() {
        assert!(IndexedFrame::new(0, 100) < IndexedFrame::new(1, 0));
        assert!(IndexedFrame::new(1, 1) > IndexedFrame::new(1, 0));
        assert_eq!(IndexedFrame::new(3, 3), IndexedFrame::new(3, 3));
        assert!(IndexedFrame::new(u32::MAX - 1, u32::MAX) < IndexedFrame::MAX);
    }

    #[test]
    fn indexed_frame_arithmetic() {
        let f = IndexedFrame::new(2, 5);
        assert_eq!(f.plus_frames(3), IndexedFrame::new(2, 8));
        assert_eq!(f.minus_frames(5), Some(IndexedFrame::new(2, 0)));
        assert_eq!(f.minus_frames(6), None);
        assert_eq!(IndexedFrame::MAX.plus_frames(1), IndexedFrame::MAX);
    }

    #[test]
    fn indexed_frame_display() {
        assert_eq!(IndexedFrame::new(4, 12).to_string(), "4:12");
        assert_eq!(IndexedFrame::MAX.to_string(), "MAX");
    }

    #[test]
    fn input_sample_bit_layout() {
        let sample = InputSample::combine(buttons::RIGHT, buttons::A);
        assert_eq!(sample.raw(), 0x0106);
        assert_eq!(sample.direction(), buttons::RIGHT);
        assert_eq!(sample.buttons(), buttons::A);
        assert_eq!(
            InputSample::combine(0, buttons::CONFIRM).raw(),
            buttons::CONFIRM << 4
        );
    }

    #[test]
    fn input_sample_masking() {
        let sample = InputSample::combine(buttons::UP, buttons::CONFIRM | buttons::START);
        assert!(sample.is_vertical());
        assert_eq!(
            sample.only_buttons(buttons::CONFIRM),
            InputSample::combine(0, buttons::CONFIRM)
        );
        assert!(!sample
            .without_buttons(buttons::START)
            .has_buttons(buttons::START));
        assert!(InputSample::NONE
            .with_buttons(buttons::FN2)
            .has_buttons(buttons::FN2));
    }

    #[test]
    fn player_opposite_and_slot() {
        assert_eq!(Player::One.opposite(), Player::Two);
        assert_eq!(Player::Two.opposite(), Player::One);
        assert_eq!(Player::One.slot(), 0);
        assert_eq!(Player::Two.slot(), 1);
        assert_eq!(Player::Two.to_string(), "P2");
    }
}
