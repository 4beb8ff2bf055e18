//! Per-frame bit vectors
//!
//! [`FrameBitmap`] backs both the loaded-frame tracking of a volume and the
//! dirty-frame tracking of each GPU texture mirror ([`DirtyFrameSet`]).

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Fixed-length bit vector with one bit per frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameBitmap {
    bits: Vec<bool>,
    set_count: usize,
}

impl FrameBitmap {
    /// All bits cleared.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![false; len],
            set_count: 0,
        }
    }

    /// All bits set.
    pub fn filled(len: usize) -> Self {
        Self {
            bits: vec![true; len],
            set_count: len,
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Out-of-range indices read as unset.
    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    /// Set a bit. Returns `true` if it was previously unset.
    pub fn set(&mut self, index: usize) -> bool {
        match self.bits.get_mut(index) {
            Some(bit) if !*bit => {
                *bit = true;
                self.set_count += 1;
                true
            }
            _ => false,
        }
    }

    /// Clear a bit. Returns `true` if it was previously set.
    pub fn clear(&mut self, index: usize) -> bool {
        match self.bits.get_mut(index) {
            Some(bit) if *bit => {
                *bit = false;
                self.set_count -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn set_all(&mut self) {
        self.bits.iter_mut().for_each(|bit| *bit = true);
        self.set_count = self.bits.len();
    }

    pub fn clear_all(&mut self) {
        self.bits.iter_mut().for_each(|bit| *bit = false);
        self.set_count = 0;
    }

    pub fn count_set(&self) -> usize {
        self.set_count
    }

    /// `true` iff every bit is set (vacuously true for an empty bitmap).
    pub fn all_set(&self) -> bool {
        self.set_count == self.bits.len()
    }

    pub fn none_set(&self) -> bool {
        self.set_count == 0
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(index, bit)| bit.then_some(index))
    }

    pub fn iter_unset(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(index, bit)| (!bit).then_some(index))
    }
}

/// Frames whose CPU-side data changed since the last GPU upload.
///
/// Handles are cheap clones sharing one bitmap. The owning volume keeps only
/// a weak reference, so dropping every handle detaches the tracker.
#[derive(Debug, Clone)]
pub struct DirtyFrameSet {
    bits: Arc<Mutex<FrameBitmap>>,
}

impl DirtyFrameSet {
    /// A tracker with every frame dirty, so the first upload streams everything.
    pub fn all_dirty(frame_count: usize) -> Self {
        Self {
            bits: Arc::new(Mutex::new(FrameBitmap::filled(frame_count))),
        }
    }

    pub fn len(&self) -> usize {
        self.bits.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.lock().is_empty()
    }

    pub fn mark(&self, frame_index: usize) {
        self.bits.lock().set(frame_index);
    }

    pub fn mark_all(&self) {
        self.bits.lock().set_all();
    }

    pub fn mark_range(&self, frames: impl IntoIterator<Item = usize>) {
        let mut bits = self.bits.lock();
        for frame in frames {
            bits.set(frame);
        }
    }

    /// Clear one frame after its upload completed.
    pub fn clear(&self, frame_index: usize) -> bool {
        self.bits.lock().clear(frame_index)
    }

    pub fn is_dirty(&self, frame_index: usize) -> bool {
        self.bits.lock().get(frame_index)
    }

    pub fn is_clean(&self) -> bool {
        self.bits.lock().none_set()
    }

    pub fn dirty_count(&self) -> usize {
        self.bits.lock().count_set()
    }

    pub fn dirty_frames(&self) -> Vec<usize> {
        self.bits.lock().iter_set().collect()
    }

    pub(crate) fn downgrade(&self) -> Weak<Mutex<FrameBitmap>> {
        Arc::downgrade(&self.bits)
    }
}
