//! # Decimating FIR filters
//!
//! A [`FirFilter`] combines the multiply-accumulate operation of a
//! Finite Impulse Response filter with decimation bookkeeping. Each
//! input sample is written onto a circular window of the previous
//! `len` samples. Once the window holds a full set, the filter emits
//! the convolution of the window with its coefficients and then backs
//! its fill count off by the decimation factor, so the next output
//! requires `decimate` further inputs. The windows of successive
//! outputs overlap whenever `decimate < len`.
//!
//! Two coefficient layouts are supported:
//!
//! * **Minimum phase**: the impulse response is not time-symmetric and
//!   the full coefficient set is stored.
//! * **Linear phase**: the impulse response is symmetric, so only the
//!   first half is stored and the second half of the window is folded
//!   back onto it. A linear-phase stage delays the signal by
//!   `len / 2 - 0.5` samples; minimum-phase stages introduce no
//!   accounted delay.
//!
//! A [`FilterChain`] cascades stages in order. A stage only offers
//! input to the next stage on steps where it produced output, which is
//! how decimation propagates: a chain with per-stage factors `d1..dk`
//! reaches one output per `d1 * d2 * ... * dk` inputs at steady state.
//!
//! Filter definitions are loaded from a [`FilterCatalog`] file. The
//! catalog is an owned value; streams clone the stages they need out
//! of it at construction time.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use arrayvec::ArrayVec;
use nalgebra::DVector;
use thiserror::Error;

/// Maximum number of filters per catalog, and stages per chain
pub const MAX_FILTERS: usize = 32;

/// Maximum number of stored coefficient points per filter
pub const MAX_POINTS: usize = 2048;

/// Impulse-response symmetry of a filter
///
/// Determined by the last character of the filter's label: `M` (or
/// `m`) marks a minimum-phase filter, anything else is linear phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum Phase {
    /// Asymmetric impulse response; full coefficient set stored
    #[strum(serialize = "minimum")]
    Minimum,
    /// Symmetric impulse response; only the first half stored
    #[strum(serialize = "linear")]
    Linear,
}

/// Error loading a filter catalog
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Unable to read the catalog file
    #[error("unable to read filter file: {0}")]
    Io(#[from] std::io::Error),

    /// The file ended before a required field
    #[error("filter file truncated: expected {0}")]
    Truncated(&'static str),

    /// A field failed to parse
    #[error("malformed {what} in filter file: \"{text}\"")]
    Malformed {
        /// Which field was being read
        what: &'static str,
        /// The offending text
        text: String,
    },

    /// More coefficient points than the supported maximum
    #[error("filter \"{0}\": {1} points exceeds the supported maximum of {MAX_POINTS}")]
    TooManyPoints(String, usize),

    /// Decimation factor incompatible with the window length
    #[error("filter \"{0}\": decimation factor {1} not in 1..={2}")]
    BadDecimation(String, usize, usize),

    /// Coefficients sum to zero, so the output gain is undefined
    #[error("filter \"{0}\": coefficients sum to zero")]
    ZeroGain(String),

    /// A requested label is not present in the catalog
    #[error("no filter named \"{0}\" in the catalog")]
    UnknownFilter(String),

    /// More chain stages than the supported maximum
    #[error("chain of {0} stages exceeds the supported maximum of {MAX_FILTERS}")]
    ChainTooLong(usize),

    /// More filters in the file than the supported maximum
    #[error("filter file declares {0} filters; at most {MAX_FILTERS} are supported")]
    TooManyFilters(usize),
}

/// One decimating FIR filter stage
///
/// Coefficients and gain are fixed at load time; the sample window,
/// write offset, and fill count mutate on every [`apply`](Self::apply).
#[derive(Clone, Debug)]
pub struct FirFilter {
    label: String,
    phase: Phase,
    len: usize,
    decimate: usize,
    gain: f64,
    coeff: DVector<f64>,
    ring: Vec<f64>,
    offset: usize,
    count: usize,
}

impl FirFilter {
    /// Build a filter stage from its catalog fields
    ///
    /// `points` holds `len` coefficients for a minimum-phase filter or
    /// `len / 2` for a linear-phase filter. The nominal gain recorded
    /// in catalog files is ignored; the working gain is recomputed as
    /// the coefficient sum, doubled per point for linear phase to
    /// account for the folded half.
    pub fn new(
        label: &str,
        len: usize,
        decimate: usize,
        points: &[f64],
    ) -> Result<Self, CatalogError> {
        let phase = match label.chars().last() {
            Some('M') | Some('m') => Phase::Minimum,
            _ => Phase::Linear,
        };
        let stored = match phase {
            Phase::Minimum => len,
            Phase::Linear => len / 2,
        };
        if stored > MAX_POINTS {
            return Err(CatalogError::TooManyPoints(label.to_owned(), stored));
        }
        if points.len() != stored {
            return Err(CatalogError::Malformed {
                what: "coefficient count",
                text: format!("{} of {}", points.len(), stored),
            });
        }
        if decimate < 1 || decimate > len {
            return Err(CatalogError::BadDecimation(label.to_owned(), decimate, len));
        }

        let fold = match phase {
            Phase::Minimum => 1.0,
            Phase::Linear => 2.0,
        };
        let gain: f64 = points.iter().map(|c| fold * c).sum();
        if gain == 0.0 {
            return Err(CatalogError::ZeroGain(label.to_owned()));
        }

        Ok(FirFilter {
            label: label.to_owned(),
            phase,
            len,
            decimate,
            gain,
            coeff: DVector::from_iterator(points.len(), points.iter().copied()),
            ring: vec![0.0; len],
            offset: 0,
            count: 0,
        })
    }

    /// Filter label, as given in the catalog
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Impulse-response symmetry
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Window length, in samples
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for the degenerate zero-length window
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Decimation factor
    pub fn decimation(&self) -> usize {
        self.decimate
    }

    /// Group delay of this stage, in input samples
    ///
    /// Linear-phase filters delay the signal by half their window;
    /// minimum-phase filters contribute no accounted delay.
    pub fn delay(&self) -> f64 {
        match self.phase {
            Phase::Minimum => 0.0,
            Phase::Linear => self.len as f64 / 2.0 - 0.5,
        }
    }

    /// Reset to empty initial conditions
    ///
    /// Clears the fill count and write offset. Coefficients and gain
    /// are untouched.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.count = 0;
    }

    /// Push one sample, producing output if a full window is held
    ///
    /// Writes `sample` onto the circular window. Returns `None` until
    /// the window has accumulated `len` samples of history; thereafter
    /// returns the filtered value and retires `decimate` samples of
    /// history, so outputs recur every `decimate` inputs.
    pub fn apply(&mut self, sample: f64) -> Option<f64> {
        self.ring[self.offset] = sample;
        self.offset = (self.offset + 1) % self.len;
        self.count += 1;

        if self.count < self.len {
            return None;
        }

        let out = self.value();
        self.count -= self.decimate;
        Some(out)
    }

    // Convolve the window with the coefficients
    //
    // The ring is read oldest-to-newest starting at the write offset.
    // Linear-phase filters run the stored half forward over the first
    // half of the window and folded over the second.
    fn value(&self) -> f64 {
        let mut v = 0.0;
        match self.phase {
            Phase::Minimum => {
                for i in 0..self.len {
                    v += self.ring[(self.offset + i) % self.len] * self.coeff[i];
                }
            }
            Phase::Linear => {
                let half = self.len / 2;
                for i in 0..half {
                    v += self.ring[(self.offset + i) % self.len] * self.coeff[i];
                }
                for i in 0..half {
                    v += self.ring[(self.offset + half + i) % self.len] * self.coeff[half - i - 1];
                }
            }
        }
        v / self.gain
    }
}

/// An ordered cascade of filter stages
///
/// Stateless beyond its stages. An empty chain passes samples through
/// unchanged.
#[derive(Clone, Debug, Default)]
pub struct FilterChain {
    stages: ArrayVec<FirFilter, MAX_FILTERS>,
}

impl FilterChain {
    /// New, empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage to the end of the chain
    pub fn push(&mut self, stage: FirFilter) {
        self.stages.push(stage);
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True if the chain has no stages
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Iterator over the stages, in order
    pub fn iter(&self) -> std::slice::Iter<'_, FirFilter> {
        self.stages.iter()
    }

    /// Cumulative decimation factor of the cascade
    pub fn decimation(&self) -> usize {
        self.stages.iter().map(FirFilter::decimation).product()
    }

    /// Thread one sample through every stage in order
    ///
    /// The first stage that produces no output consumes the value and
    /// ends the step; only when every stage produces does the chain
    /// return the final value.
    pub fn apply(&mut self, sample: f64) -> Option<f64> {
        let mut value = sample;
        for stage in &mut self.stages {
            value = stage.apply(value)?;
        }
        Some(value)
    }

    /// Reset every stage to empty initial conditions
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
    }
}

/// An owned set of named filter definitions
///
/// Loaded once at startup and shared (by reference) with every stream
/// constructed afterwards. Lookup clones a fresh, reset stage.
#[derive(Clone, Debug, Default)]
pub struct FilterCatalog {
    filters: Vec<FirFilter>,
}

impl FilterCatalog {
    /// Load a catalog from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    /// Load a catalog from any buffered reader
    ///
    /// The format is line-oriented: the first line is the filter
    /// count, then each filter contributes a label line, a
    /// window-length line, a nominal-gain line (ignored; the gain is
    /// recomputed from the coefficients), a decimation-factor line,
    /// and finally its coefficient values, whitespace-separated with
    /// free line wrapping. Any missing or malformed field fails the
    /// whole load.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, CatalogError> {
        let mut lines = reader.lines();

        let count: usize = parse_field(&mut lines, "filter count")?;
        if count > MAX_FILTERS {
            return Err(CatalogError::TooManyFilters(count));
        }
        let mut filters = Vec::with_capacity(count);

        for _ in 0..count {
            let label: String = parse_field(&mut lines, "filter label")?;
            let len: usize = parse_field(&mut lines, "window length")?;
            let _nominal: f64 = parse_field(&mut lines, "nominal gain")?;
            let decimate: usize = parse_field(&mut lines, "decimation factor")?;

            let stored = if matches!(label.chars().last(), Some('M') | Some('m')) {
                len
            } else {
                len / 2
            };
            if stored > MAX_POINTS {
                return Err(CatalogError::TooManyPoints(label, stored));
            }

            let mut points = Vec::with_capacity(stored);
            while points.len() < stored {
                let line = next_line(&mut lines, "coefficient values")?;
                for tok in line.split_whitespace() {
                    if points.len() >= stored {
                        break;
                    }
                    let c: f64 = tok.parse().map_err(|_| CatalogError::Malformed {
                        what: "coefficient value",
                        text: tok.to_owned(),
                    })?;
                    points.push(c);
                }
            }

            filters.push(FirFilter::new(&label, len, decimate, &points)?);
        }

        Ok(FilterCatalog { filters })
    }

    /// Number of filters in the catalog
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// True if the catalog holds no filters
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Look up a filter by label, ignoring ASCII case
    ///
    /// Returns a fresh clone with empty initial conditions.
    pub fn find(&self, label: &str) -> Option<FirFilter> {
        self.filters
            .iter()
            .find(|f| f.label.eq_ignore_ascii_case(label))
            .map(|f| {
                let mut f = f.clone();
                f.reset();
                f
            })
    }
}

// Pull the next line from the catalog, or fail with what was expected
fn next_line<R: BufRead>(
    lines: &mut std::io::Lines<R>,
    what: &'static str,
) -> Result<String, CatalogError> {
    match lines.next() {
        Some(line) => Ok(line?),
        None => Err(CatalogError::Truncated(what)),
    }
}

// Parse the first whitespace-separated token of the next line
fn parse_field<R: BufRead, T: std::str::FromStr>(
    lines: &mut std::io::Lines<R>,
    what: &'static str,
) -> Result<T, CatalogError> {
    let line = next_line(lines, what)?;
    let tok = line
        .split_whitespace()
        .next()
        .ok_or(CatalogError::Truncated(what))?;
    tok.parse().map_err(|_| CatalogError::Malformed {
        what,
        text: tok.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_approx_eq::assert_approx_eq;

    // boxcar average of 4, decimating by 2
    fn boxcar4() -> FirFilter {
        FirFilter::new("BOX4M", 4, 2, &[1.0, 1.0, 1.0, 1.0]).expect("boxcar")
    }

    #[test]
    fn test_minimum_phase_fill_and_output() {
        let mut f = boxcar4();

        // no output until the window fills
        assert_eq!(None, f.apply(1.0));
        assert_eq!(None, f.apply(2.0));
        assert_eq!(None, f.apply(3.0));

        // fourth sample completes the window
        let out = f.apply(4.0).expect("output after fill");
        assert_approx_eq!(out, 2.5);

        // decimation of 2: one more gap, then output again
        assert_eq!(None, f.apply(5.0));
        let out = f.apply(6.0).expect("output at decimated cadence");
        assert_approx_eq!(out, 4.5);
    }

    #[test]
    fn test_minimum_phase_ordering() {
        // an asymmetric impulse response weights the newest sample
        let mut f = FirFilter::new("RAMPM", 3, 1, &[0.0, 0.0, 1.0]).expect("ramp");
        assert_eq!(None, f.apply(10.0));
        assert_eq!(None, f.apply(20.0));
        // coefficients run oldest-to-newest: output is the newest sample
        let out = f.apply(30.0).expect("output");
        assert_approx_eq!(out, 30.0);
    }

    #[test]
    fn test_linear_phase_folding() {
        // stored half [1, 2] folds to the full response [1, 2, 2, 1]
        let mut f = FirFilter::new("SYM4", 4, 1, &[1.0, 2.0]).expect("symmetric");
        assert_eq!(None, f.apply(1.0));
        assert_eq!(None, f.apply(2.0));
        assert_eq!(None, f.apply(3.0));
        let out = f.apply(4.0).expect("output");
        // (1*1 + 2*2 + 3*2 + 4*1) / 6
        assert_approx_eq!(out, 15.0 / 6.0);

        // equivalent direct form as a minimum-phase filter
        let mut g = FirFilter::new("SYM4M", 4, 1, &[1.0, 2.0, 2.0, 1.0]).expect("direct");
        for sa in [1.0, 2.0, 3.0] {
            assert_eq!(None, g.apply(sa));
        }
        assert_approx_eq!(g.apply(4.0).expect("output"), out);
    }

    #[test]
    fn test_determinism() {
        // identical input runs produce bit-identical output sequences
        let input: Vec<f64> = (0..64).map(|n| ((n * 7919) % 1000) as f64 / 10.0).collect();
        let run = |mut f: FirFilter| -> Vec<f64> {
            input.iter().filter_map(|&sa| f.apply(sa)).collect()
        };
        let a = run(boxcar4());
        let b = run(boxcar4());
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_reset() {
        let mut f = boxcar4();
        for sa in [1.0, 2.0, 3.0, 4.0] {
            f.apply(sa);
        }
        f.reset();
        // after a reset, a full window is required again
        assert_eq!(None, f.apply(1.0));
        assert_eq!(None, f.apply(1.0));
        assert_eq!(None, f.apply(1.0));
        assert!(f.apply(1.0).is_some());
    }

    #[test]
    fn test_decimation_rejected_at_load() {
        assert!(matches!(
            FirFilter::new("BADM", 4, 5, &[1.0; 4]),
            Err(CatalogError::BadDecimation(_, 5, 4))
        ));
        assert!(matches!(
            FirFilter::new("BADM", 4, 0, &[1.0; 4]),
            Err(CatalogError::BadDecimation(_, 0, 4))
        ));
    }

    #[test]
    fn test_zero_gain_rejected() {
        assert!(matches!(
            FirFilter::new("DIFFM", 2, 1, &[1.0, -1.0]),
            Err(CatalogError::ZeroGain(_))
        ));
    }

    #[test]
    fn test_chain_decimation_pacing() {
        // stages of 2 and 3: one chain output per 6 inputs at steady state
        let mut chain = FilterChain::new();
        chain.push(FirFilter::new("A_M", 4, 2, &[1.0; 4]).expect("stage"));
        chain.push(FirFilter::new("B_M", 3, 3, &[1.0; 3]).expect("stage"));
        assert_eq!(chain.decimation(), 6);

        let mut outputs = Vec::new();
        for n in 0..120 {
            if let Some(out) = chain.apply(n as f64) {
                outputs.push((n, out));
            }
        }
        assert!(outputs.len() >= 2);
        for pair in outputs.windows(2) {
            assert_eq!(pair[1].0 - pair[0].0, 6);
        }
    }

    #[test]
    fn test_empty_chain_passthrough() {
        let mut chain = FilterChain::new();
        assert_eq!(chain.apply(123.0), Some(123.0));
    }

    #[test]
    fn test_catalog_roundtrip() {
        let text = "2\n\
                    BOX4M\n\
                    4\n\
                    4.0\n\
                    2\n\
                    1.0 1.0\n\
                    1.0 1.0\n\
                    SYM6\n\
                    6\n\
                    1.0\n\
                    3\n\
                    0.1 0.2 0.7\n";
        let catalog = FilterCatalog::from_reader(text.as_bytes()).expect("catalog");
        assert_eq!(catalog.len(), 2);

        let f = catalog.find("box4m").expect("case-insensitive lookup");
        assert_eq!(f.phase(), Phase::Minimum);
        assert_eq!(f.len(), 4);
        assert_eq!(f.decimation(), 2);

        let f = catalog.find("SYM6").expect("linear filter");
        assert_eq!(f.phase(), Phase::Linear);
        // linear-phase stages carry a group delay of len/2 - 0.5
        assert_approx_eq!(f.delay(), 2.5);

        assert!(catalog.find("NOPE").is_none());
    }

    #[test]
    fn test_catalog_truncated() {
        let text = "1\nBOX4M\n4\n4.0\n2\n1.0 1.0\n";
        assert!(matches!(
            FilterCatalog::from_reader(text.as_bytes()),
            Err(CatalogError::Truncated(_))
        ));
    }

    #[test]
    fn test_catalog_malformed() {
        let text = "1\nBOX4M\nfour\n4.0\n2\n1.0 1.0 1.0 1.0\n";
        assert!(matches!(
            FilterCatalog::from_reader(text.as_bytes()),
            Err(CatalogError::Malformed { .. })
        ));
    }
}
