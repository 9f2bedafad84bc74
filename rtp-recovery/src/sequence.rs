//! Sequence Number Extension
//!
//! RTP carries a 16-bit sequence number that wraps every 65536 packets. This
//! module turns that bounded counter into a 64-bit extended sequence number
//! (`cycles << width | raw`) that can be compared and subtracted directly,
//! using the RFC 3550 half-range heuristic to tell wraparound apart from
//! reordering.

use std::fmt;

/// A bounded, wrapping sequence counter that can be extended to 64 bits
pub trait WrappingSeq: Copy + Eq + Ord + fmt::Debug {
    /// Width of the counter in bits
    const BITS: u32;

    /// Widen the raw value
    fn widen(self) -> u64;

    /// Keep only the low `BITS` bits of an extended value
    fn truncate(value: u64) -> Self;

    /// Half of the counter's range
    #[inline]
    fn half_range() -> u64 {
        1u64 << (Self::BITS - 1)
    }

    /// Wraparound-safe difference `self - other`, reduced to the counter width
    #[inline]
    fn wrapping_distance(self, other: Self) -> u64 {
        let mask = (1u64 << Self::BITS) - 1;
        self.widen().wrapping_sub(other.widen()) & mask
    }
}

macro_rules! impl_wrapping_seq {
    ($ty:ty) => {
        impl WrappingSeq for $ty {
            const BITS: u32 = <$ty>::BITS;

            #[inline]
            fn widen(self) -> u64 {
                u64::from(self)
            }

            #[inline]
            fn truncate(value: u64) -> Self {
                value as $ty
            }
        }
    };
}

impl_wrapping_seq!(u8);
impl_wrapping_seq!(u16);
impl_wrapping_seq!(u32);

/// Which cycle a raw value belongs to, relative to a previously seen raw value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleShift {
    /// Same cycle as the reference
    Same,
    /// The counter wrapped forward since the reference
    Next,
    /// A late arrival from the cycle before the reference
    Previous,
}

/// Classify `raw` against `last` using the half-range rule
///
/// A value numerically smaller than `last` by more than half the range is a
/// forward wrap; a value numerically larger by more than half the range is a
/// straggler from the previous cycle.
pub fn classify<N: WrappingSeq>(last: N, raw: N) -> CycleShift {
    let half = N::half_range();
    if raw < last && last.wrapping_distance(raw) > half {
        CycleShift::Next
    } else if raw > last && raw.wrapping_distance(last) > half {
        CycleShift::Previous
    } else {
        CycleShift::Same
    }
}

/// Combine a cycle count and a raw value into an extended sequence number
#[inline]
pub fn compose<N: WrappingSeq>(cycles: u64, raw: N) -> u64 {
    (cycles << N::BITS) | raw.widen()
}

/// Resolve `raw` to the extended value closest to `reference`
///
/// Never resolves below cycle 0: a value that looks like it belongs to the
/// previous cycle while `reference` is still in cycle 0 stays in cycle 0.
pub fn unwrap_near<N: WrappingSeq>(reference: u64, raw: N) -> u64 {
    let cycles = reference >> N::BITS;
    match classify(N::truncate(reference), raw) {
        CycleShift::Same => compose(cycles, raw),
        CycleShift::Next => compose(cycles + 1, raw),
        CycleShift::Previous if cycles > 0 => compose(cycles - 1, raw),
        CycleShift::Previous => compose(cycles, raw),
    }
}

/// Extended sequence number tracker
///
/// Keeps the highest extended value seen so far. Out-of-order packets from
/// the current cycle never move the state backward, and late packets from the
/// previous cycle are resolved without touching it.
#[derive(Clone, Default)]
pub struct SeqExtender<N: WrappingSeq = u16> {
    /// Highest extended sequence number seen, `None` until the first packet
    last_extended: Option<u64>,
    /// Number of completed wraps of the raw counter
    cycles: u64,
    _width: std::marker::PhantomData<N>,
}

impl<N: WrappingSeq> SeqExtender<N> {
    /// Create an extender that has not seen any value yet
    pub fn new() -> Self {
        SeqExtender {
            last_extended: None,
            cycles: 0,
            _width: std::marker::PhantomData,
        }
    }

    /// Extend a newly arrived raw value, updating the tracking state
    pub fn extend(&mut self, raw: N) -> u64 {
        let last = match self.last_extended {
            None => {
                let extended = compose(0, raw);
                self.last_extended = Some(extended);
                return extended;
            }
            Some(last) => last,
        };

        match classify(N::truncate(last), raw) {
            CycleShift::Next => self.cycles += 1,
            CycleShift::Previous if self.cycles > 0 => return compose(self.cycles - 1, raw),
            _ => {}
        }

        let extended = compose(self.cycles, raw);
        if extended > last {
            self.last_extended = Some(extended);
        }
        extended
    }

    /// Resolve a raw value against the current state without modifying it
    ///
    /// Used for sequence numbers carried inside auxiliary metadata, such as
    /// the base sequence of a parity packet.
    pub fn recover(&self, raw: N) -> u64 {
        match self.last_extended {
            None => compose(0, raw),
            Some(last) => unwrap_near(last, raw),
        }
    }

    /// Number of completed wraps
    #[inline]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Highest extended value seen so far
    #[inline]
    pub fn last_extended(&self) -> Option<u64> {
        self.last_extended
    }

    /// Forget all state
    pub fn reset(&mut self) {
        self.last_extended = None;
        self.cycles = 0;
    }
}

impl<N: WrappingSeq> fmt::Debug for SeqExtender<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeqExtender")
            .field("bits", &N::BITS)
            .field("last_extended", &self.last_extended)
            .field("cycles", &self.cycles)
            .finish()
    }
}
