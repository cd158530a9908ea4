use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::sync_manager::Phase;
use crate::{IndexedFrame, InputSample, NUM_INPUTS};

/// Inline storage for one batch of samples.
pub type InputBatch = SmallVec<[InputSample; NUM_INPUTS]>;

/// First frame covered by a batch that ends at `frame`.
#[inline]
fn batch_start(frame: u32) -> u32 {
    frame.saturating_sub(NUM_INPUTS as u32 - 1)
}

/// The newest (up to) [`NUM_INPUTS`] samples of one player's current epoch.
///
/// `indexed_frame` is the LAST frame carried, so the batch covers
/// `start_frame()..=indexed_frame.frame`. Sent unreliably every tick; loss is
/// covered by the overlap between consecutive batches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInputs {
    /// Position of the last sample in `inputs`.
    pub indexed_frame: IndexedFrame,
    /// Samples for `start_frame()..=indexed_frame.frame`, oldest first.
    pub inputs: InputBatch,
}

impl PlayerInputs {
    /// Creates an empty batch ending at `indexed_frame`.
    #[must_use]
    pub fn new(indexed_frame: IndexedFrame) -> Self {
        Self {
            indexed_frame,
            inputs: SmallVec::new(),
        }
    }

    /// Creates a batch ending at `indexed_frame` holding `inputs`.
    #[must_use]
    pub fn with_inputs(indexed_frame: IndexedFrame, inputs: &[InputSample]) -> Self {
        Self {
            indexed_frame,
            inputs: SmallVec::from_slice(inputs),
        }
    }

    /// Epoch of the batch.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.indexed_frame.index
    }

    /// First frame covered.
    #[must_use]
    pub fn start_frame(&self) -> u32 {
        batch_start(self.indexed_frame.frame)
    }

    /// One past the last frame covered, saturating at `u32::MAX`.
    #[must_use]
    pub fn end_frame(&self) -> u32 {
        self.indexed_frame.frame.saturating_add(1)
    }

    /// Position of the first sample.
    #[must_use]
    pub fn start(&self) -> IndexedFrame {
        IndexedFrame::new(self.index(), self.start_frame())
    }

    /// Returns `true` if `inputs` has exactly the length the frame range implies.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.indexed_frame.frame != u32::MAX
            && self.inputs.len() == (self.end_frame() - self.start_frame()) as usize
    }
}

/// Both players' samples for the same frame range, sent to spectators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BothInputs {
    /// Position of the last sample in each batch.
    pub indexed_frame: IndexedFrame,
    /// Player one, then player two.
    pub inputs: [InputBatch; 2],
}

impl BothInputs {
    /// Creates an empty pair of batches ending at `indexed_frame`.
    #[must_use]
    pub fn new(indexed_frame: IndexedFrame) -> Self {
        Self {
            indexed_frame,
            inputs: [SmallVec::new(), SmallVec::new()],
        }
    }

    /// Epoch of the batch.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.indexed_frame.index
    }

    /// First frame covered.
    #[must_use]
    pub fn start_frame(&self) -> u32 {
        batch_start(self.indexed_frame.frame)
    }

    /// Number of frames covered.
    #[must_use]
    pub fn len(&self) -> usize {
        (self.indexed_frame.frame - self.start_frame()) as usize + 1
    }

    /// Always `false`: a batch covers at least its last frame.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Position of the first sample.
    #[must_use]
    pub fn start(&self) -> IndexedFrame {
        IndexedFrame::new(self.index(), self.start_frame())
    }
}

/// Host RNG state captured at the start of epoch `index`.
///
/// The bytes are opaque to this crate.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    /// Epoch the state belongs to.
    pub index: u32,
    /// Host-defined RNG snapshot.
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for RngState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self { index, bytes } = self;

        f.debug_struct("RngState")
            .field("index", index)
            .field("bytes", &BytesDebug(bytes))
            .finish()
    }
}

struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Retry menu entry chosen during epoch `index`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuIndex {
    /// Epoch of the retry menu.
    pub index: u32,
    /// Selected entry, counted from the top.
    pub menu_index: u8,
}

/// Announces that the sender entered epoch `index`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionIndex {
    /// The sender's new epoch.
    pub index: u32,
}

/// Where a late-joining spectator should start.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialGameState {
    /// Spectator cursor at join time.
    pub indexed_frame: IndexedFrame,
    /// Phase the broadcaster was in.
    pub phase: Phase,
    /// Whether the match is in training mode.
    pub training: bool,
    /// Broadcaster's input delay; spectators must read with the same offset.
    pub delay: u8,
    /// Broadcaster's rollback window.
    pub rollback: u8,
    /// Broadcaster's delay while rolling back.
    pub rollback_delay: u8,
}

/// Everything two netplay peers exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetplayMessage {
    /// Unreliable input batch.
    PlayerInputs(PlayerInputs),
    /// Host RNG state for an epoch.
    RngState(RngState),
    /// Retry menu choice.
    MenuIndex(MenuIndex),
    /// Epoch change announcement.
    TransitionIndex(TransitionIndex),
}

/// Everything a broadcaster sends to an observer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpectatorMessage {
    /// Join-time starting point.
    InitialGameState(InitialGameState),
    /// Next batch of both players' inputs.
    BothInputs(BothInputs),
    /// Host RNG state for an epoch.
    RngState(RngState),
    /// Agreed retry menu choice for an epoch.
    MenuIndex(MenuIndex),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_range_saturates_at_epoch_start() {
        let early = PlayerInputs::new(IndexedFrame::new(1, 4));
        assert_eq!(early.start_frame(), 0);
        assert_eq!(early.end_frame(), 5);

        let late = PlayerInputs::new(IndexedFrame::new(1, 100));
        assert_eq!(late.start_frame(), 100 + 1 - NUM_INPUTS as u32);
        assert_eq!(late.start(), IndexedFrame::new(1, 71));
    }

    #[test]
    fn well_formed_checks_length() {
        let samples = [InputSample::new(1); 5];
        assert!(PlayerInputs::with_inputs(IndexedFrame::new(0, 4), &samples).is_well_formed());
        assert!(!PlayerInputs::with_inputs(IndexedFrame::new(0, 5), &samples).is_well_formed());
    }

    #[test]
    fn last_representable_frame_does_not_overflow() {
        let edge = IndexedFrame::new(3, u32::MAX);
        let batch = PlayerInputs::with_inputs(edge, &[InputSample::new(1); NUM_INPUTS]);
        assert_eq!(batch.end_frame(), u32::MAX);
        assert_eq!(batch.start_frame(), u32::MAX - (NUM_INPUTS as u32 - 1));
        assert!(!batch.is_well_formed());

        assert_eq!(BothInputs::new(edge).len(), NUM_INPUTS);
    }

    #[test]
    fn both_inputs_len_caps_at_batch_size() {
        assert_eq!(BothInputs::new(IndexedFrame::new(0, 2)).len(), 3);
        assert_eq!(BothInputs::new(IndexedFrame::new(0, 500)).len(), NUM_INPUTS);
    }

    #[test]
    fn rng_state_debug_is_hex() {
        let state = RngState {
            index: 2,
            bytes: vec![0xde, 0xad],
        };
        assert!(format!("{state:?}").contains("0xdead"));
    }
}
