//! # Per-source processing pipeline
//!
//! A [`StreamState`] owns everything one telemetry source needs: its
//! decimating filter chain, its Gaussian minute smoother, its rolling
//! CREX history, its calibration constants, and the continuity fields
//! that decide when the stream has gapped.
//!
//! Records are processed one at a time, synchronously. Each record is
//! first checked for continuity against the end of the previous one:
//! a start time outside the tolerance window means samples were lost,
//! so the filter chain resets and enough subsequent samples are
//! skipped to re-align the decimated output with the wall-clock second
//! boundary (accounting for the delay the linear-phase stages impose).
//! Aligned samples flow chain → smoother → calibration → tide history,
//! and every emitted minute hands one encoded report to the caller's
//! sink.
//!
//! The [`StreamRegistry`] maps source identifiers to their states,
//! creating each lazily from the configuration snapshot active at
//! first sight.

#[cfg(not(test))]
use log::{debug, info};

#[cfg(test)]
use std::println as debug;
#[cfg(test)]
use std::println as info;

use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use thiserror::Error;

use crate::crex::{CrexMessage, CrexTideData, EncodeError};
use crate::filter::{CatalogError, FilterCatalog, FilterChain, MAX_FILTERS};
use crate::record::{DataRecord, Hptime, HPT_MODULUS};
use crate::smoother::{GapPolicy, GaussianSmoother, DELAY};
use crate::tidal::TidePredictor;

// Relative slack allowed between the effective decimated rate and the
// one-per-second rate the smoother requires
const RATE_TOLERANCE: f64 = 1.0e-4;

/// Error processing one record
///
/// None of these unwind the stream's state; the caller decides whether
/// to drop the record (rate mismatch) or abort (encode/sink failure).
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The chain's effective output rate is not one per second
    #[error("invalid sample rate: {0}")]
    Rate(f64),

    /// An emission could not be rendered
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The output sink refused a report
    #[error("output sink failure: {0}")]
    Sink(#[from] std::io::Error),
}

/// Configuration snapshot used to build new streams
///
/// Captures the command-line calibration and chain selection. The
/// registry applies the snapshot that is current when a source is
/// first seen; later changes do not retroactively rebuild streams.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Display tag placed in the report header
    pub tag: String,
    /// Additive calibration, field units
    pub alpha: f64,
    /// Multiplicative calibration
    pub beta: f64,
    /// Catalog labels of the chain stages, in order
    pub filters: Vec<String>,
    /// Smoothing-buffer behavior across gaps
    pub gap_policy: GapPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            tag: String::new(),
            alpha: 0.0,
            beta: 1.0,
            filters: Vec::new(),
            gap_policy: GapPolicy::default(),
        }
    }
}

/// Complete processing state for one telemetry source
#[derive(Clone, Debug)]
pub struct StreamState {
    srcname: String,
    alpha: f64,
    beta: f64,
    chain: FilterChain,
    smoother: GaussianSmoother,
    ctd: CrexTideData,
    samprate: f64,
    delay: Hptime,
    under: i64,
    endtime: Hptime,
    gap_policy: GapPolicy,
}

impl StreamState {
    /// Build the state for a newly-seen source
    ///
    /// Resolves the configured chain out of the catalog and derives
    /// the effective output rate (the input rate divided by the
    /// cascade's cumulative decimation) and the cascade delay (the sum
    /// of each linear-phase stage's group delay at the rate that stage
    /// sees). Fails if a configured label is missing from the catalog.
    pub fn new(
        srcname: &str,
        config: &StreamConfig,
        catalog: &FilterCatalog,
        input_rate: f64,
    ) -> Result<Self, CatalogError> {
        if config.filters.len() > MAX_FILTERS {
            return Err(CatalogError::ChainTooLong(config.filters.len()));
        }

        let mut chain = FilterChain::new();
        let mut samprate = input_rate;
        let mut delay_secs = 0.0;
        for label in &config.filters {
            let stage = catalog
                .find(label)
                .ok_or_else(|| CatalogError::UnknownFilter(label.clone()))?;
            delay_secs += stage.delay() / samprate;
            samprate /= stage.decimation() as f64;
            chain.push(stage);
        }

        Ok(StreamState {
            srcname: srcname.to_owned(),
            alpha: config.alpha,
            beta: config.beta,
            chain,
            smoother: GaussianSmoother::new(),
            ctd: CrexTideData::new(&config.tag),
            samprate,
            delay: (delay_secs * HPT_MODULUS as f64).round() as Hptime,
            under: 0,
            endtime: 0,
            gap_policy: config.gap_policy,
        })
    }

    /// Source identifier
    pub fn srcname(&self) -> &str {
        &self.srcname
    }

    /// Effective output rate after the cascade's decimation, Hz
    pub fn effective_rate(&self) -> f64 {
        self.samprate
    }

    /// Cascade delay imposed by the linear-phase stages
    pub fn cascade_delay(&self) -> Hptime {
        self.delay
    }

    /// Samples still to discard before the stream is re-aligned
    pub fn skip_count(&self) -> i64 {
        self.under
    }

    /// Fill count of the smoothing buffer
    pub fn smoother_fill(&self) -> usize {
        self.smoother.fill()
    }

    /// Run one record through the pipeline
    ///
    /// Records with no samples, non-integer samples, or a non-positive
    /// rate are skipped silently (nothing to do). `timetol` is the
    /// continuity tolerance in seconds; `None` selects half the
    /// nominal sample interval. Each report emitted during the record
    /// is handed to `sink` exactly once; sink and encoding failures
    /// abort the record but leave the stream consistent.
    ///
    /// Returns the number of reports emitted.
    pub fn process<F>(
        &mut self,
        rec: &DataRecord,
        tides: &TidePredictor,
        timetol: Option<f64>,
        sink: &mut F,
    ) -> Result<u32, ProcessError>
    where
        F: FnMut(&CrexMessage) -> std::io::Result<()>,
    {
        let samples = match rec.samples.as_ints() {
            Some(samples) if !samples.is_empty() => samples,
            _ => return Ok(0),
        };
        if rec.samprate <= 0.0 {
            return Ok(0);
        }
        if (1.0 - 1.0 / self.samprate).abs() >= RATE_TOLERANCE {
            return Err(ProcessError::Rate(self.samprate));
        }

        let hpdelta = HPT_MODULUS as f64 / rec.samprate;
        let hptimetol = match timetol {
            Some(tol) if tol >= 0.0 => tol * HPT_MODULUS as f64,
            _ => 0.5 * hpdelta,
        };

        // continuity: a start time off the end of the previous record
        // by more than the tolerance is a gap
        if ((rec.starttime - self.endtime) as f64 - hpdelta).abs() > hptimetol {
            self.under = ((HPT_MODULUS - (rec.starttime + self.delay).rem_euclid(HPT_MODULUS))
                as f64
                / hpdelta)
                .ceil() as i64;
            info!(
                "reset {} {} gap={}us skip={}",
                self.srcname,
                isotime(rec.starttime),
                rec.starttime - self.endtime,
                self.under
            );
            self.chain.reset();
            if self.gap_policy == GapPolicy::Reset {
                self.smoother.rebase();
            }
        }

        let mut emitted = 0u32;
        let hpdelta = hpdelta as Hptime;

        for (n, &raw) in samples.iter().enumerate() {
            if self.under > 0 {
                self.under -= 1;
                continue;
            }

            let value = match self.chain.apply(raw as f64) {
                Some(value) => value,
                None => continue,
            };

            // wall-clock second this decimated value describes, with
            // the cascade delay folded in
            let hpt = rec.starttime + n as Hptime * hpdelta + self.delay;
            let second = (hpt as f64 / HPT_MODULUS as f64).round() as i64;

            let obs = match self.smoother.push(second, value) {
                Some(obs) => obs,
                None => continue,
            };
            let minute = second - DELAY as i64;
            debug!("add sample {} {} {}", self.srcname, isotime_secs(minute), obs);

            let height = obs * self.beta + self.alpha;
            let residual = if tides.is_configured() {
                Some(height - tides.predict_height(minute))
            } else {
                None
            };

            if !self.ctd.update(minute, height, residual) {
                continue;
            }

            let msg = CrexMessage {
                srcname: self.srcname.clone(),
                time: minute,
                text: self.ctd.encode()?,
            };
            sink(&msg)?;
            emitted += 1;
        }

        self.endtime = rec.end_time();
        Ok(emitted)
    }
}

/// Owned mapping from source identifier to stream state
///
/// States are created lazily on first sight of a source and live until
/// the registry drops.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: HashMap<String, StreamState>,
}

impl StreamRegistry {
    /// New, empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known sources
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// True if no source has been seen yet
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Look up a source, creating its state on first sight
    ///
    /// `config` and `catalog` are only consulted when the source is
    /// new; `input_rate` must then be the rate of the record that
    /// introduced it.
    pub fn get_or_create(
        &mut self,
        srcname: &str,
        config: &StreamConfig,
        catalog: &FilterCatalog,
        input_rate: f64,
    ) -> Result<&mut StreamState, CatalogError> {
        match self.streams.entry(srcname.to_owned()) {
            std::collections::hash_map::Entry::Occupied(entry) => Ok(entry.into_mut()),
            std::collections::hash_map::Entry::Vacant(entry) => {
                info!("new stream {} at {} Hz", srcname, input_rate);
                Ok(entry.insert(StreamState::new(srcname, config, catalog, input_rate)?))
            }
        }
    }

    /// Iterator over the known states
    pub fn iter(&self) -> impl Iterator<Item = &StreamState> {
        self.streams.values()
    }
}

// ISO timestamp for log lines, from microseconds
fn isotime(hpt: Hptime) -> String {
    let secs = hpt.div_euclid(HPT_MODULUS);
    let nanos = hpt.rem_euclid(HPT_MODULUS) as u32 * 1_000;
    match Utc.timestamp_opt(secs, nanos) {
        chrono::LocalResult::Single(t) => t.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
        _ => format!("{}us", hpt),
    }
}

// ISO timestamp for log lines, from whole seconds
fn isotime_secs(secs: i64) -> String {
    isotime(secs.saturating_mul(HPT_MODULUS))
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_approx_eq::assert_approx_eq;

    use crate::record::Samples;

    // 1971-01-02 00:00:00 UTC, aligned to the 120-second buffer
    const T0: i64 = 31_622_400;

    fn record(start_sec: i64, values: Vec<i32>) -> DataRecord {
        DataRecord {
            srcname: "NZ_WLGT_40_TH".to_owned(),
            starttime: start_sec * HPT_MODULUS,
            samprate: 1.0,
            samples: Samples::Int(values),
        }
    }

    fn chainless_state() -> StreamState {
        let config = StreamConfig {
            tag: "TEST".to_owned(),
            ..StreamConfig::default()
        };
        StreamState::new("NZ_WLGT_40_TH", &config, &FilterCatalog::default(), 1.0)
            .expect("stream state")
    }

    fn run(
        state: &mut StreamState,
        rec: &DataRecord,
        out: &mut Vec<CrexMessage>,
    ) -> Result<u32, ProcessError> {
        state.process(rec, &TidePredictor::default(), None, &mut |msg| {
            out.push(msg.clone());
            Ok(())
        })
    }

    #[test]
    fn test_end_to_end_constant_input() {
        let mut state = chainless_state();
        let mut out = Vec::new();

        // ten minutes of a constant 5000-count signal
        let rec = record(T0, vec![5000; 600]);
        let n = run(&mut state, &rec, &mut out).expect("process");
        assert_eq!(n as usize, out.len());
        assert!(!out.is_empty());

        // every report carries the calibrated constant in slot 0 and
        // no residual (no predictor configured)
        for msg in &out {
            assert_eq!(msg.srcname, "NZ_WLGT_40_TH");
            assert_eq!(msg.time % 60, 0);
            assert!(msg.text.starts_with("TEST"));
            assert!(msg.text.ends_with("05000 ////+"));
        }

        // reports land once per minute
        for pair in out.windows(2) {
            assert_eq!(pair[1].time - pair[0].time, 60);
        }
    }

    #[test]
    fn test_continuity_within_tolerance() {
        // the reset gap policy makes any spurious reset observable as
        // a dropped smoother fill
        let config = StreamConfig {
            tag: "TEST".to_owned(),
            gap_policy: GapPolicy::Reset,
            ..StreamConfig::default()
        };
        let mut state =
            StreamState::new("X", &config, &FilterCatalog::default(), 1.0).expect("state");
        let mut out = Vec::new();

        run(&mut state, &record(T0, vec![100; 300]), &mut out).expect("process");
        assert_eq!(state.smoother_fill(), 120);

        // the next record follows exactly one sample later: no reset
        run(&mut state, &record(T0 + 300, vec![100; 60]), &mut out).expect("process");
        assert_eq!(state.smoother_fill(), 120);
        assert_eq!(state.skip_count(), 0);
    }

    #[test]
    fn test_initial_record_aligns_via_reset() {
        // endtime starts at zero, so the first record always trips the
        // gap detector and skips one sample to the next second boundary
        let mut state = chainless_state();
        let mut out = Vec::new();
        run(&mut state, &record(T0, vec![100; 3]), &mut out).expect("process");
        assert_eq!(state.smoother_fill(), 2);
        assert_eq!(state.skip_count(), 0);
    }

    #[test]
    fn test_continuity_gap_resets() {
        let text = "1\nDEC40\n80\n1.0\n40\n".to_owned() + &"0.025 ".repeat(40) + "\n";
        let catalog = FilterCatalog::from_reader(text.as_bytes()).expect("catalog");
        let config = StreamConfig {
            filters: vec!["DEC40".to_owned()],
            ..StreamConfig::default()
        };
        let mut state = StreamState::new("X", &config, &catalog, 40.0).expect("state");
        let mut out = Vec::new();

        let mut rec = record(T0, vec![100; 400]);
        rec.samprate = 40.0;
        run(&mut state, &rec, &mut out).expect("process");

        // five seconds of missing samples, restarting off the second
        // boundary: the skip has to cover the remainder of the second
        // less the cascade delay, at the 40 Hz input rate
        let mut rec = record(T0 + 15, vec![100; 10]);
        rec.starttime += 300_000;
        rec.samprate = 40.0;
        run(&mut state, &rec, &mut out).expect("process");
        // ceil((1e6 - (300000 + 987500) % 1e6) / 25000) = 29 samples,
        // ten of which this record consumed
        assert_eq!(state.skip_count(), 19);

        // the smoother keeps its fill under the default preserve policy
        let fill = state.smoother_fill();
        let mut rec = record(T0 + 30, vec![100; 40]);
        rec.samprate = 40.0;
        run(&mut state, &rec, &mut out).expect("process");
        assert!(state.smoother_fill() >= fill);
    }

    #[test]
    fn test_gap_policy_reset_drops_smoother_fill() {
        let config = StreamConfig {
            tag: "TEST".to_owned(),
            gap_policy: GapPolicy::Reset,
            ..StreamConfig::default()
        };
        let mut state =
            StreamState::new("X", &config, &FilterCatalog::default(), 1.0).expect("state");
        let mut out = Vec::new();

        run(&mut state, &record(T0, vec![100; 300]), &mut out).expect("process");
        assert_eq!(state.smoother_fill(), 120);

        run(&mut state, &record(T0 + 400, vec![100; 10]), &mut out).expect("process");
        assert!(state.smoother_fill() < 120);
    }

    #[test]
    fn test_record_rejection_is_silent() {
        let mut state = chainless_state();
        let mut out = Vec::new();

        // no samples
        let n = run(&mut state, &record(T0, vec![]), &mut out).expect("no samples");
        assert_eq!(n, 0);

        // wrong sample type
        let rec = DataRecord {
            srcname: "X".to_owned(),
            starttime: T0 * HPT_MODULUS,
            samprate: 1.0,
            samples: Samples::Float(vec![1.0; 10]),
        };
        let n = run(&mut state, &rec, &mut out).expect("non-integer");
        assert_eq!(n, 0);

        // non-positive rate
        let mut rec = record(T0, vec![1; 10]);
        rec.samprate = 0.0;
        let n = run(&mut state, &rec, &mut out).expect("zero rate");
        assert_eq!(n, 0);

        assert!(out.is_empty());
    }

    #[test]
    fn test_bad_effective_rate_is_an_error() {
        // a chainless stream fed at 40 Hz decimates nothing: its
        // effective rate cannot feed the once-per-second smoother
        let config = StreamConfig::default();
        let mut state =
            StreamState::new("X", &config, &FilterCatalog::default(), 40.0).expect("state");
        let mut rec = record(T0, vec![1; 10]);
        rec.samprate = 40.0;
        let mut out = Vec::new();
        assert!(matches!(
            run(&mut state, &rec, &mut out),
            Err(ProcessError::Rate(_))
        ));
    }

    #[test]
    fn test_unknown_filter_label() {
        let config = StreamConfig {
            filters: vec!["NOPE".to_owned()],
            ..StreamConfig::default()
        };
        assert!(matches!(
            StreamState::new("X", &config, &FilterCatalog::default(), 1.0),
            Err(CatalogError::UnknownFilter(_))
        ));
    }

    #[test]
    fn test_calibration_applied() {
        let config = StreamConfig {
            tag: "CAL".to_owned(),
            alpha: 100.0,
            beta: 2.0,
            ..StreamConfig::default()
        };
        let mut state =
            StreamState::new("X", &config, &FilterCatalog::default(), 1.0).expect("state");
        let mut out = Vec::new();
        state
            .process(
                &record(T0, vec![500; 400]),
                &TidePredictor::default(),
                None,
                &mut |msg| {
                    out.push(msg.clone());
                    Ok(())
                },
            )
            .expect("process");
        // 500 * 2 + 100
        assert!(!out.is_empty());
        assert!(out[0].text.ends_with("01100 ////+"));
    }

    #[test]
    fn test_residual_with_predictor() {
        let tides = TidePredictor::new(
            &["S2/0.5/0".parse().expect("constituent")],
            -41.3,
            0.0,
        );
        let mut state = chainless_state();
        let mut out = Vec::new();
        state
            .process(&record(T0, vec![1000; 400]), &tides, None, &mut |msg| {
                out.push(msg.clone());
                Ok(())
            })
            .expect("process");

        assert!(!out.is_empty());
        let msg = &out[0];
        // residual = height - predicted, rounded into the 4-wide field
        let expect = (1000.0 - tides.predict_height(msg.time)).round() as i32;
        let tail: Vec<&str> = msg.text.split_whitespace().collect();
        let rendered: i32 = tail.last().unwrap().trim_end_matches('+').parse().unwrap();
        assert_eq!(rendered, expect);
    }

    #[test]
    fn test_effective_rate_and_delay() {
        // one linear stage: 40 Hz in, decimate by 40, delay of
        // (80/2 - 0.5) / 40 s = 0.9875 s
        let text = "1\nDEC40\n80\n1.0\n40\n".to_owned()
            + &"0.025 ".repeat(40)
            + "\n";
        let catalog = FilterCatalog::from_reader(text.as_bytes()).expect("catalog");
        let config = StreamConfig {
            filters: vec!["DEC40".to_owned()],
            ..StreamConfig::default()
        };
        let state = StreamState::new("X", &config, &catalog, 40.0).expect("state");
        assert_approx_eq!(state.effective_rate(), 1.0);
        assert_eq!(state.cascade_delay(), 987_500);
    }

    #[test]
    fn test_registry_creates_lazily() {
        let mut registry = StreamRegistry::new();
        assert!(registry.is_empty());

        let config = StreamConfig::default();
        let catalog = FilterCatalog::default();
        registry
            .get_or_create("A", &config, &catalog, 1.0)
            .expect("create");
        registry
            .get_or_create("B", &config, &catalog, 1.0)
            .expect("create");
        registry
            .get_or_create("A", &config, &catalog, 1.0)
            .expect("lookup");
        assert_eq!(registry.len(), 2);
    }
}
