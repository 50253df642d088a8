//! The `[1,255]`-skipping-zero sequence counters shared by `txSequence`,
//! `outSequence` and `inSequence`: all three counters live in `[1,255]`,
//! value `0` is illegal and skipped on increment, and the count wraps from
//! 255 back to 1.

/// `0` is the internal "nothing allocated/observed yet" sentinel; it is
/// never returned by `peek_next`/`advance`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SequenceCounter(u8);

impl SequenceCounter {
    pub fn new() -> SequenceCounter {
        SequenceCounter(0)
    }

    /// The last allocated/observed value, or `0` if none yet.
    pub fn current(&self) -> u8 {
        self.0
    }

    /// What `advance` would return, without mutating state.
    pub fn peek_next(&self) -> u8 {
        if self.0 >= 255 {
            1
        } else {
            self.0 + 1
        }
    }

    /// Allocate (or, for `inSequence`, accept) the next value in sequence.
    pub fn advance(&mut self) -> u8 {
        self.0 = self.peek_next();
        self.0
    }
}
