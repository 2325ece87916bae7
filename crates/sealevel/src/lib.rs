//! # sealevel: tide-gauge telemetry to CREX sea-level reports
//!
//! This crate turns a continuous stream of timestamped integer
//! waveform samples from a tide gauge into calibrated sea-level
//! measurements, encoded as fixed-width CREX text reports with a
//! rolling six-minute history.
//!
//! The processing chain, per source:
//!
//! 1. A cascade of decimating FIR filters reduces the raw sample rate
//!    to one value per second ([`FilterChain`]).
//! 2. A 120-slot buffer smooths the once-per-second values to one
//!    observation per minute with a fixed symmetric Gaussian window
//!    ([`GaussianSmoother`]).
//! 3. The smoothed value is calibrated (`value * beta + alpha`) and,
//!    when tidal constituents are configured, reduced against the
//!    predicted astronomical tide ([`TidePredictor`]).
//! 4. The measurement and residual are folded into the six-minute
//!    history and rendered as a CREX report ([`CrexTideData`]).
//!
//! Gaps in the input are detected by comparing each record's start
//! time against the end of the previous record; a gap resets the
//! filter cascade and schedules enough skipped samples to re-align the
//! decimated output with the wall-clock second boundary.
//!
//! Everything is synchronous and record-at-a-time: feeding a record
//! runs it all the way through filtering, smoothing, and encoding
//! before returning, and stopping between records never leaves a
//! stream in a partial state. Receiving records and forwarding the
//! encoded reports are the caller's problem; see the `slcrex` binary
//! for a front-end that reads decoded records from standard input and
//! writes reports to standard output.
//!
//! ## Example
//!
//! ```
//! use sealevel::{
//!     CrexMessage, DataRecord, FilterCatalog, Samples, StreamConfig, StreamRegistry,
//!     TidePredictor, HPT_MODULUS,
//! };
//!
//! // configuration snapshot for newly-seen sources; an empty filter
//! // list means the input already arrives at one sample per second
//! let catalog = FilterCatalog::default();
//! let config = StreamConfig {
//!     tag: "WLGT 41.28S 174.78E".to_owned(),
//!     ..StreamConfig::default()
//! };
//! let tides = TidePredictor::default();
//!
//! // ten minutes of a constant signal
//! let rec = DataRecord {
//!     srcname: "NZ_WLGT_40_TH".to_owned(),
//!     starttime: 1_393_632_000 * HPT_MODULUS,
//!     samprate: 1.0,
//!     samples: Samples::Int(vec![5000; 600]),
//! };
//!
//! let mut registry = StreamRegistry::new();
//! let mut reports: Vec<CrexMessage> = Vec::new();
//!
//! let stream = registry
//!     .get_or_create(&rec.srcname, &config, &catalog, rec.samprate)
//!     .expect("create stream");
//! stream
//!     .process(&rec, &tides, None, &mut |msg| {
//!         reports.push(msg.clone());
//!         Ok(())
//!     })
//!     .expect("process record");
//!
//! // one report per minute once the smoother has warmed up
//! assert!(!reports.is_empty());
//! println!("{}", reports[0].text);
//! ```
//!
//! ## Fidelity
//!
//! The filter arithmetic, the Gaussian kernel, and the CREX text
//! grammar reproduce the legacy sea-level encoder used for tsunami
//! monitoring networks; they are domain standards, not tunable
//! parameters. Output is bit-exact given IEEE double arithmetic and
//! the identical filter coefficient files.

mod crex;
mod filter;
mod record;
mod smoother;
mod stream;
mod tidal;

pub use crex::{CrexMessage, CrexTideData, EncodeError, HISTORY};
pub use filter::{
    CatalogError, FilterCatalog, FilterChain, FirFilter, Phase, MAX_FILTERS, MAX_POINTS,
};
pub use record::{DataRecord, Hptime, Samples, HPT_MODULUS};
pub use smoother::{GapPolicy, GaussianSmoother, BUFLEN, DELAY};
pub use stream::{ProcessError, StreamConfig, StreamRegistry, StreamState};
pub use tidal::{Constituent, ConstituentError, TidePredictor};
