use crate::report_violation;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{IndexedFrame, InputSample};

/// Per-player input history, one gapless run of samples per epoch.
///
/// Epochs are stored relative to `start_index`; everything older has been
/// pruned and reads as [`InputSample::NONE`]. Within an epoch the written range
/// never has holes: growing the storage pads the new slots with the epoch's
/// previous last sample, so a read between two writes sees the nearer prior
/// write.
///
/// Two write policies coexist:
///
/// - [`set`](Self::set) is first-write-wins, so a late duplicate from the
///   network cannot perturb locally authored history.
/// - [`assign`](Self::assign) and the range writers always overwrite, for
///   corrections.
///
/// ```
/// use rollback_netplay::{IndexedFrame, InputSample, InputTimeline};
///
/// let mut timeline = InputTimeline::new();
/// timeline.set(IndexedFrame::new(0, 5), InputSample::new(1));
/// timeline.set(IndexedFrame::new(0, 9), InputSample::new(2));
/// assert_eq!(timeline.get(IndexedFrame::new(0, 7)), InputSample::new(1));
/// assert_eq!(timeline.get(IndexedFrame::new(0, 100)), InputSample::new(2));
/// ```
#[derive(Debug, Clone)]
pub struct InputTimeline {
    start_index: u32,
    epochs: Vec<Vec<InputSample>>,
    last_changed: IndexedFrame,
}

impl Default for InputTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl InputTimeline {
    /// Creates an empty timeline starting at epoch 0.
    #[must_use]
    pub fn new() -> Self {
        Self::with_start_index(0)
    }

    /// Creates an empty timeline whose oldest retained epoch is `start_index`.
    #[must_use]
    pub fn with_start_index(start_index: u32) -> Self {
        Self {
            start_index,
            epochs: Vec::new(),
            last_changed: IndexedFrame::MAX,
        }
    }

    /// Oldest epoch still retained.
    #[must_use]
    pub fn start_index(&self) -> u32 {
        self.start_index
    }

    fn slot(&self, index: u32) -> Option<usize> {
        index
            .checked_sub(self.start_index)
            .map(|offset| offset as usize)
    }

    /// Reads one sample.
    ///
    /// Returns [`InputSample::NONE`] if the epoch holds nothing, the epoch's
    /// last sample if `at.frame` is past its end, and the stored sample
    /// otherwise.
    #[must_use]
    pub fn get(&self, at: IndexedFrame) -> InputSample {
        let Some(epoch) = self.slot(at.index).and_then(|slot| self.epochs.get(slot)) else {
            return InputSample::NONE;
        };
        match epoch.get(at.frame as usize) {
            Some(sample) => *sample,
            None => epoch.last().copied().unwrap_or(InputSample::NONE),
        }
    }

    /// Reads `n` consecutive samples starting at `at`.
    ///
    /// # Panics
    ///
    /// Panics unless every requested sample has been written. Callers gate
    /// this with readiness checks; reaching the panic is a bug in the caller.
    #[must_use]
    pub fn get_range(&self, at: IndexedFrame, n: usize) -> &[InputSample] {
        let epoch = self
            .slot(at.index)
            .and_then(|slot| self.epochs.get(slot));
        assert!(
            epoch.is_some(),
            "get_range on missing epoch {} (start_index={})",
            at.index,
            self.start_index
        );
        let epoch = epoch.map_or(&[][..], Vec::as_slice);
        let begin = at.frame as usize;
        assert!(
            begin + n <= epoch.len(),
            "get_range past end: {} + {} > {}",
            at,
            n,
            epoch.len()
        );
        &epoch[begin..begin + n]
    }

    /// Writes one sample unless `at` already has one.
    pub fn set(&mut self, at: IndexedFrame, value: InputSample) {
        if self.contains(at) {
            return;
        }
        if let Some(epoch) = self.grow(at, 1) {
            epoch[at.frame as usize] = value;
        }
    }

    /// Writes one sample, replacing anything stored there.
    pub fn assign(&mut self, at: IndexedFrame, value: InputSample) {
        if let Some(epoch) = self.grow(at, 1) {
            epoch[at.frame as usize] = value;
        }
    }

    /// Writes `n` copies of `value` starting at `at`, replacing existing samples.
    pub fn fill(&mut self, at: IndexedFrame, value: InputSample, n: usize) {
        if let Some(epoch) = self.grow(at, n) {
            let begin = at.frame as usize;
            epoch[begin..begin + n].fill(value);
        }
    }

    /// Writes `values` starting at `at`, replacing existing samples.
    pub fn set_range(&mut self, at: IndexedFrame, values: &[InputSample]) {
        if let Some(epoch) = self.grow(at, values.len()) {
            let begin = at.frame as usize;
            epoch[begin..begin + values.len()].copy_from_slice(values);
        }
    }

    /// Like [`set_range`](Self::set_range), but first compares the incoming
    /// samples against what [`get`](Self::get) currently answers (including
    /// repeat-last predictions past the end) and lowers the
    /// [`last_changed_frame`](Self::last_changed_frame) mark to the first
    /// differing position. Only epochs at or after `track_from` are compared.
    pub fn set_range_tracked(&mut self, at: IndexedFrame, values: &[InputSample], track_from: u32) {
        if at.index >= track_from {
            let changed = values
                .iter()
                .enumerate()
                .find(|(i, value)| self.get(at.plus_frames(*i as u32)) != **value)
                .map(|(i, _)| at.plus_frames(i as u32));
            if let Some(frame) = changed {
                self.last_changed = self.last_changed.min(frame);
            }
        }
        self.set_range(at, values);
    }

    /// Makes sure epochs up to and including `index` exist, without writing samples.
    ///
    /// Used when the peer announces a new epoch before sending input for it.
    pub fn resize_to_index(&mut self, index: u32) {
        if let Some(slot) = self.slot(index) {
            if slot >= self.epochs.len() {
                self.epochs.resize_with(slot + 1, Vec::new);
            }
        }
    }

    /// Drops every epoch older than `index` and makes `index` the new start.
    ///
    /// Does nothing if `index` is not newer than the current start.
    pub fn erase_older_than(&mut self, index: u32) {
        let Some(offset) = self.slot(index) else {
            return;
        };
        if offset == 0 {
            return;
        }
        if offset >= self.epochs.len() {
            self.epochs.clear();
        } else {
            self.epochs.drain(..offset);
        }
        self.start_index = index;
        if !self.last_changed.is_max() && self.last_changed.index < index {
            self.last_changed = IndexedFrame::MAX;
        }
    }

    /// Removes every sample. The start index is kept.
    pub fn clear(&mut self) {
        self.epochs.clear();
        self.last_changed = IndexedFrame::MAX;
    }

    /// Returns `true` if no epoch has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// Returns `true` if `index` holds no samples.
    #[must_use]
    pub fn is_epoch_empty(&self, index: u32) -> bool {
        self.end_frame_of(index) == 0
    }

    /// Newest epoch that exists, if any.
    #[must_use]
    pub fn end_index(&self) -> Option<u32> {
        self.epochs
            .len()
            .checked_sub(1)
            .map(|last| self.start_index + last as u32)
    }

    /// One past the last written frame of the newest epoch.
    #[must_use]
    pub fn end_frame(&self) -> u32 {
        self.epochs.last().map_or(0, |epoch| epoch.len() as u32)
    }

    /// One past the last written frame of `index`.
    #[must_use]
    pub fn end_frame_of(&self, index: u32) -> u32 {
        self.slot(index)
            .and_then(|slot| self.epochs.get(slot))
            .map_or(0, |epoch| epoch.len() as u32)
    }

    /// Newest written position, saturating at `start_index:0` when empty.
    #[must_use]
    pub fn last_indexed_frame(&self) -> IndexedFrame {
        IndexedFrame::new(
            self.end_index().unwrap_or(self.start_index),
            self.end_frame().saturating_sub(1),
        )
    }

    /// Earliest position whose value changed through
    /// [`set_range_tracked`](Self::set_range_tracked), or
    /// [`IndexedFrame::MAX`] if nothing changed.
    #[must_use]
    pub fn last_changed_frame(&self) -> IndexedFrame {
        self.last_changed
    }

    /// Resets the change mark to [`IndexedFrame::MAX`].
    pub fn clear_last_changed_frame(&mut self) {
        self.last_changed = IndexedFrame::MAX;
    }

    fn contains(&self, at: IndexedFrame) -> bool {
        (at.frame as usize) < self.end_frame_of(at.index) as usize
    }

    /// Extends storage so `at.frame + n` fits, padding with the epoch's last
    /// sample. Returns `None` (and reports) for epochs older than `start_index`.
    fn grow(&mut self, at: IndexedFrame, n: usize) -> Option<&mut Vec<InputSample>> {
        let Some(slot) = self.slot(at.index) else {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::InputTimeline,
                "write to pruned epoch {} ignored (start_index={})",
                at.index,
                self.start_index
            );
            return None;
        };
        if slot >= self.epochs.len() {
            self.epochs.resize_with(slot + 1, Vec::new);
        }
        let epoch = &mut self.epochs[slot];
        let needed = at.frame as usize + n;
        if needed > epoch.len() {
            let pad = epoch.last().copied().unwrap_or(InputSample::NONE);
            epoch.resize(needed, pad);
        }
        Some(epoch)
    }
}

impl InvariantChecker for InputTimeline {
    /// 1. `start_index + epochs` does not overflow `u32`.
    /// 2. The change mark is the sentinel or lies inside a retained epoch.
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if u32::try_from(self.epochs.len())
            .ok()
            .and_then(|len| self.start_index.checked_add(len))
            .is_none()
        {
            return Err(
                InvariantViolation::new("InputTimeline", "epoch count overflows index space")
                    .with_details(format!(
                        "start_index={}, epochs={}",
                        self.start_index,
                        self.epochs.len()
                    )),
            );
        }

        if !self.last_changed.is_max() && self.last_changed.index < self.start_index {
            return Err(
                InvariantViolation::new("InputTimeline", "change mark precedes start_index")
                    .with_details(format!(
                        "last_changed={}, start_index={}",
                        self.last_changed, self.start_index
                    )),
            );
        }

        Ok(())
    }
}
