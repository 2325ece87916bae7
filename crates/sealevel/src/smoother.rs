//! # Gaussian minute smoother
//!
//! The filter cascade delivers one value per second. The
//! [`GaussianSmoother`] collects those values in a 120-slot circular
//! buffer and reduces them to one smoothed observation per minute by
//! convolving a fixed 91-tap symmetric Gaussian window, stored as a
//! 46-element half-kernel. The kernel is a domain constant: the same
//! coefficients must be used to reproduce the standard output
//! bit-for-bit.
//!
//! Each output is centered [`DELAY`] seconds in the past, so an
//! emission at buffer slot `s` describes the second written 45 slots
//! earlier, with 45 seconds of lookahead already in the buffer.

use strum_macros::{Display, EnumString};

/// Length of the once-per-second observation buffer
pub const BUFLEN: usize = 120;

/// Center lag of the smoothing window, in seconds
pub const DELAY: usize = 45;

/// Emission stride: one smoothed observation per this many slots
const STRIDE: usize = 60;

// Half-kernel of the symmetric Gaussian smoothing window. KERNEL[0] is
// the center weight; folded, the weights sum to 1.
static KERNEL: [f64; DELAY + 1] = [
    0.02519580, 0.02514602, 0.02499727, 0.02475132, 0.02441104, 0.02398040,
    0.02346437, 0.02286881, 0.02220039, 0.02146643, 0.02067480, 0.01983377,
    0.01895183, 0.01803763, 0.01709976, 0.01614667, 0.01518651, 0.01422707,
    0.01327563, 0.01233892, 0.01142303, 0.01053338, 0.00967467, 0.00885090,
    0.00806530, 0.00732042, 0.00661811, 0.00595955, 0.00534535, 0.00477552,
    0.00424959, 0.00376666, 0.00332543, 0.00292430, 0.00256140, 0.00223468,
    0.00194194, 0.00168089, 0.00144918, 0.00124449, 0.00106449, 0.00090693,
    0.00076964, 0.00065055, 0.00054772, 0.00045933,
];

/// What happens to the smoothing buffer when a stream gap is detected
///
/// The filter chain always resets on a gap; whether the smoothing
/// buffer should also discard its history is site policy. `Preserve`
/// keeps the buffer filled, so the first post-gap outputs convolve a
/// window that spans the gap. `Reset` clears the fill count, delaying
/// output until two fresh minutes of data have accumulated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum GapPolicy {
    /// Keep buffered history across the gap
    #[default]
    Preserve,
    /// Discard buffered history and re-base the slot mapping
    Reset,
}

/// 120-slot circular buffer with once-per-minute Gaussian output
///
/// The fill count saturates at [`BUFLEN`] and, under the default
/// [`GapPolicy`], never decreases for the life of the stream.
#[derive(Clone, Debug)]
pub struct GaussianSmoother {
    obs: [f64; BUFLEN],
    count: usize,
    offset: usize,
}

impl Default for GaussianSmoother {
    fn default() -> Self {
        Self::new()
    }
}

impl GaussianSmoother {
    /// New, empty smoother
    pub fn new() -> Self {
        GaussianSmoother {
            obs: [0.0; BUFLEN],
            count: 0,
            offset: 0,
        }
    }

    /// Current fill count, saturating at [`BUFLEN`]
    pub fn fill(&self) -> usize {
        self.count
    }

    /// Discard history and re-base the slot mapping
    ///
    /// The next [`push`](Self::push) derives its slot from the epoch
    /// second again, as at process start. Used by
    /// [`GapPolicy::Reset`].
    pub fn rebase(&mut self) {
        self.count = 0;
    }

    /// Store one second's value; emit the smoothed minute when due
    ///
    /// `epoch` is the integer epoch second the value describes. While
    /// the mapping is established, each value lands one slot after its
    /// predecessor; when the mapping is (re)established the slot is
    /// derived from the epoch second directly, anchoring slots to
    /// wall-clock seconds.
    ///
    /// Returns the convolved observation once the buffer is full and
    /// the slot lands on the once-per-minute emission point; the
    /// observation describes the second `epoch - DELAY`.
    pub fn push(&mut self, epoch: i64, value: f64) -> Option<f64> {
        let slot = if self.count > 0 {
            self.offset
        } else {
            epoch.rem_euclid(BUFLEN as i64) as usize
        };
        self.offset = (slot + 1) % BUFLEN;

        self.obs[slot] = value;
        if self.count < BUFLEN {
            self.count += 1;
        }
        if self.count < BUFLEN {
            return None;
        }
        if slot % STRIDE != DELAY {
            return None;
        }

        Some(self.convolve(slot))
    }

    // Weighted sum around the center slot, DELAY slots behind `slot`
    fn convolve(&self, slot: usize) -> f64 {
        let mut sum = self.obs[(slot + BUFLEN - DELAY) % BUFLEN] * KERNEL[0];
        for m in 1..=DELAY {
            sum += self.obs[(slot + BUFLEN - DELAY - m) % BUFLEN] * KERNEL[m];
            sum += self.obs[(slot + BUFLEN - DELAY + m) % BUFLEN] * KERNEL[m];
        }
        sum
    }
}
