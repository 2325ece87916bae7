//! # Harmonic tide prediction
//!
//! The processing core subtracts a predicted astronomical tide from
//! each calibrated measurement to form the meteorological residual.
//! The prediction is a plain harmonic synthesis over a site-specific
//! set of named constituents: each contributes
//! `amplitude * cos(speed * t - lag)`, where the angular speed comes
//! from the published constituent tables and the amplitude and lag are
//! supplied per site.
//!
//! Constituent specifications arrive from the command line in
//! `label/amplitude/lag` form, with the lag in degrees; see
//! [`Constituent`]. A predictor built with no constituents is simply
//! "not configured": heights predict as zero and residuals are left
//! missing by the caller.

use std::str::FromStr;

use lazy_static::lazy_static;
use log::warn;
use phf::phf_map;
use regex::Regex;
use thiserror::Error;

// Angular speeds of the recognized constituents, degrees per hour.
// Standard published values; keys are upper-case labels.
static SPEEDS: phf::Map<&'static str, f64> = phf_map! {
    // long period
    "SA" => 0.0410686,
    "SSA" => 0.0821373,
    "MM" => 0.5443747,
    "MSF" => 1.0158958,
    "MF" => 1.0980331,
    // diurnal
    "2Q1" => 12.8542862,
    "Q1" => 13.3986609,
    "RHO1" => 13.4715145,
    "O1" => 13.9430356,
    "M1" => 14.4966939,
    "P1" => 14.9589314,
    "S1" => 15.0000000,
    "K1" => 15.0410686,
    "J1" => 15.5854433,
    "OO1" => 16.1391017,
    // semidiurnal
    "2N2" => 27.8953548,
    "MU2" => 27.9682084,
    "N2" => 28.4397295,
    "NU2" => 28.5125831,
    "M2" => 28.9841042,
    "LAM2" => 29.4556253,
    "L2" => 29.5284789,
    "T2" => 29.9589333,
    "S2" => 30.0000000,
    "R2" => 30.0410667,
    "K2" => 30.0821373,
    "2SM2" => 31.0158958,
    // shallow water
    "MO3" => 42.9271398,
    "M3" => 43.4761563,
    "MK3" => 44.0251729,
    "SK3" => 45.0410686,
    "MN4" => 57.4238337,
    "M4" => 57.9682084,
    "SN4" => 58.4397295,
    "MS4" => 58.9841042,
    "S4" => 60.0000000,
    "M6" => 86.9523127,
    "S6" => 90.0000000,
    "M8" => 115.9364169,
};

/// Error parsing a constituent specification
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ConstituentError {
    /// The specification is not `label/amplitude/lag`
    #[error("constituent must be <label>/<amplitude>/<lag>: \"{0}\"")]
    Format(String),
}

/// One named tidal constituent
///
/// Parsed from the `label/amplitude/lag` grammar, with the amplitude
/// in meters and the lag in degrees. The lag is stored in cycles.
#[derive(Clone, Debug, PartialEq)]
pub struct Constituent {
    /// Constituent label, e.g. `M2`
    pub name: String,
    /// Amplitude, meters
    pub amplitude: f64,
    /// Phase lag, cycles
    pub lag: f64,
}

impl FromStr for Constituent {
    type Err = ConstituentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref RE: Regex = Regex::new(
                r"^\s*([0-9A-Za-z]+)/([-+]?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?)/([-+]?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?)\s*$"
            )
            .unwrap();
        }

        let caps = RE
            .captures(s)
            .ok_or_else(|| ConstituentError::Format(s.to_owned()))?;

        let amplitude: f64 = caps[2]
            .parse()
            .map_err(|_| ConstituentError::Format(s.to_owned()))?;
        let lag_degrees: f64 = caps[3]
            .parse()
            .map_err(|_| ConstituentError::Format(s.to_owned()))?;

        Ok(Constituent {
            name: caps[1].to_ascii_uppercase(),
            amplitude,
            lag: lag_degrees / 360.0,
        })
    }
}

/// Harmonic tide-height predictor for one site
///
/// Pure: [`predict_height`](Self::predict_height) has no side effects
/// and depends only on the epoch second. Constituents whose labels are
/// not in the speed table are dropped with a warning at build time.
#[derive(Clone, Debug, Default)]
pub struct TidePredictor {
    // (speed deg/hr, amplitude m, lag cycles)
    terms: Vec<(f64, f64, f64)>,
    zone: f64,
    latitude: f64,
}

impl TidePredictor {
    /// Build a predictor from a constituent set
    ///
    /// `latitude` is the site's reference latitude in degrees and
    /// `zone` the time-zone offset, in hours, that the constituent
    /// lags are referenced to.
    pub fn new(constituents: &[Constituent], latitude: f64, zone: f64) -> Self {
        let mut terms = Vec::with_capacity(constituents.len());
        for c in constituents {
            match SPEEDS.get(c.name.as_str()) {
                Some(&speed) => terms.push((speed, c.amplitude, c.lag)),
                None => warn!("unknown tidal constituent \"{}\" dropped", c.name),
            }
        }
        TidePredictor {
            terms,
            zone,
            latitude,
        }
    }

    /// True when at least one constituent survived construction
    ///
    /// An unconfigured predictor means "no tidal correction", not an
    /// error: the caller leaves residuals missing.
    pub fn is_configured(&self) -> bool {
        !self.terms.is_empty()
    }

    /// Site reference latitude, degrees
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    /// Predicted tide height at the given epoch second, meters
    pub fn predict_height(&self, epoch: i64) -> f64 {
        let hours = epoch as f64 / 3600.0 - self.zone;
        self.terms
            .iter()
            .map(|&(speed, amplitude, lag)| {
                amplitude * ((speed * hours).to_radians() - lag * std::f64::consts::TAU).cos()
            })
            .sum()
    }
}
