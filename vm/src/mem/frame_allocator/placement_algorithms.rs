//! Implementation of some common frame placement policies.

use super::CoreMapEntry;

/// A placement algorithm for allocating frames.
pub trait PlacementAlgorithm: Send {
    /// Returns the index of a free frame, or `None` if the core map is full.
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize>;
}

#[derive(Default)]
pub struct NextFit {
    /// The next frame number to start searching for free frames.
    position: usize,
}

// There is no internal data for this algorithm. Declare it as a zero-sized type.
#[derive(Default)]
pub struct FirstFit;

impl PlacementAlgorithm for NextFit {
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize> {
        let total_frames = core_map.len();
        if total_frames == 0 {
            return None;
        }

        // Scan every frame once, starting from where the last search stopped.
        let index = (0..total_frames)
            .map(|i| (self.position + i) % total_frames)
            .find(|i| !core_map[*i].allocated())?;

        self.position = (index + 1) % total_frames;
        Some(index)
    }
}

impl PlacementAlgorithm for FirstFit {
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize> {
        core_map.iter().position(|entry| !entry.allocated())
    }
}
