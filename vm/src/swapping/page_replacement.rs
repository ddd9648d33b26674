//! Victim selection for the frame table.
//!
//! Policies walk the resident frames in insertion order with a [`ClockHand`]
//! and ask the frame table about each candidate through a probe callback. The
//! probe knows about pinning and the hardware accessed bits; the policy only
//! decides when to stop.

/// What a policy asks the probe to do with the accessed bit of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    /// Leave it alone.
    Ignore,
    /// Report it and clear it.
    TestAndClear,
}

/// The probe's answer for one candidate frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameProbe {
    /// Neither pinned nor otherwise protected.
    pub evictable: bool,
    /// The accessed bit before it was cleared. Always false for `Reference::Ignore`.
    pub accessed: bool,
}

/// Cursor over an insertion-ordered list of frames.
///
/// The hand points at the next frame to examine. It is kept in step with the
/// list by calling [`ClockHand::removed`] whenever an entry is removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClockHand {
    cursor: usize,
}

impl ClockHand {
    pub fn position(&self, len: usize) -> usize {
        if self.cursor >= len {
            0
        } else {
            self.cursor
        }
    }

    pub fn advance(&mut self, len: usize) {
        self.cursor = (self.position(len) + 1) % len.max(1);
    }

    /// Entry `index` was removed from the list; everything after it shifted down.
    pub fn removed(&mut self, index: usize) {
        if index < self.cursor {
            self.cursor -= 1;
        }
    }
}

pub trait PageReplacementPolicy: Send {
    /// Picks a victim among `len` frames, starting at the hand. The hand is
    /// left on the victim. Returns `None` if no frame may be evicted.
    fn choose(
        &mut self,
        hand: &mut ClockHand,
        len: usize,
        probe: &mut dyn FnMut(usize, Reference) -> FrameProbe,
    ) -> Option<usize>;
}

/// Round robin: the first evictable frame under the hand.
pub struct ClockSweep;

impl PageReplacementPolicy for ClockSweep {
    fn choose(
        &mut self,
        hand: &mut ClockHand,
        len: usize,
        probe: &mut dyn FnMut(usize, Reference) -> FrameProbe,
    ) -> Option<usize> {
        for _ in 0..len {
            let index = hand.position(len);
            if probe(index, Reference::Ignore).evictable {
                return Some(index);
            }
            hand.advance(len);
        }
        None
    }
}

/// Clock with a second chance: an evictable frame that was accessed since the
/// hand last passed has its bit cleared and is skipped once.
pub struct SecondChance;

impl PageReplacementPolicy for SecondChance {
    fn choose(
        &mut self,
        hand: &mut ClockHand,
        len: usize,
        probe: &mut dyn FnMut(usize, Reference) -> FrameProbe,
    ) -> Option<usize> {
        // The first pass clears every accessed bit, so two passes always suffice.
        for _ in 0..2 * len {
            let index = hand.position(len);
            let frame = probe(index, Reference::TestAndClear);
            if frame.evictable && !frame.accessed {
                return Some(index);
            }
            hand.advance(len);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct Frame {
        pinned: bool,
        accessed: bool,
    }

    fn frames(spec: &[(bool, bool)]) -> Vec<Frame> {
        spec.iter()
            .map(|&(pinned, accessed)| Frame { pinned, accessed })
            .collect()
    }

    fn run(
        policy: &mut dyn PageReplacementPolicy,
        hand: &mut ClockHand,
        frames: &mut [Frame],
    ) -> Option<usize> {
        let len = frames.len();
        policy.choose(hand, len, &mut |i, reference| {
            let frame = &mut frames[i];
            if frame.pinned {
                return FrameProbe::default();
            }
            let accessed = reference == Reference::TestAndClear && frame.accessed;
            if reference == Reference::TestAndClear {
                frame.accessed = false;
            }
            FrameProbe {
                evictable: true,
                accessed,
            }
        })
    }

    #[test]
    fn test_clock_sweep_skips_pinned() {
        let mut frames = frames(&[(true, false), (false, true), (false, false)]);
        let mut hand = ClockHand::default();
        assert_eq!(run(&mut ClockSweep, &mut hand, &mut frames), Some(1));
        assert_eq!(hand.position(3), 1);
        // Accessed bits are not consulted or cleared.
        assert!(frames[1].accessed);
    }

    #[test]
    fn test_clock_sweep_is_round_robin() {
        let mut frames = frames(&[(false, false), (false, false), (false, false)]);
        let mut hand = ClockHand::default();

        assert_eq!(run(&mut ClockSweep, &mut hand, &mut frames), Some(0));
        // The victim is removed and its frame re-registered at the back.
        frames.remove(0);
        hand.removed(0);
        frames.push(Frame {
            pinned: false,
            accessed: false,
        });
        assert_eq!(hand.position(3), 0);
        frames[0].pinned = true;
        assert_eq!(run(&mut ClockSweep, &mut hand, &mut frames), Some(1));
    }

    #[test]
    fn test_all_pinned() {
        let mut frames = frames(&[(true, false), (true, true)]);
        let mut hand = ClockHand::default();
        assert_eq!(run(&mut ClockSweep, &mut hand, &mut frames), None);
        assert_eq!(run(&mut SecondChance, &mut hand, &mut frames), None);
        assert_eq!(run(&mut ClockSweep, &mut hand, &mut []), None);
    }

    #[test]
    fn test_second_chance_skips_referenced() {
        let mut frames = frames(&[(false, true), (false, false), (false, true)]);
        let mut hand = ClockHand::default();
        assert_eq!(run(&mut SecondChance, &mut hand, &mut frames), Some(1));
        assert!(!frames[0].accessed);
        assert!(frames[2].accessed);
    }

    #[test]
    fn test_second_chance_wraps_once_all_referenced() {
        let mut frames = frames(&[(false, true), (true, true), (false, true)]);
        let mut hand = ClockHand::default();
        hand.advance(3);
        // Starting at 1: pinned, then 2 and 0 lose their bits, then 2 goes.
        assert_eq!(run(&mut SecondChance, &mut hand, &mut frames), Some(2));
        assert!(frames[1].accessed);
    }

    #[test]
    fn test_hand_follows_removals() {
        let mut hand = ClockHand::default();
        hand.advance(5);
        hand.advance(5);
        assert_eq!(hand.position(5), 2);
        hand.removed(4);
        assert_eq!(hand.position(4), 2);
        hand.removed(0);
        assert_eq!(hand.position(3), 1);
        hand.removed(1);
        assert_eq!(hand.position(2), 1);
        // Removing the last entry under the hand wraps it to the front.
        hand.removed(1);
        assert_eq!(hand.position(1), 0);
    }
}
