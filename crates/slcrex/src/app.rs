//! Record-processing loop
//!
//! Reads one decoded record per input line, routes it to its stream,
//! and writes every CREX report the pipeline emits to standard
//! output. Streams come into existence the first time their source
//! name appears, using the configuration snapshot from the command
//! line.
//!
//! Per-record failures (unparseable lines, rate mismatches) are
//! logged and skipped; encoding or output failures end the run, since
//! continuing would silently drop reports.

use std::io::{self, BufRead, Write};

use anyhow::{anyhow, Context};
use log::{debug, info, warn};

use sealevel::{
    DataRecord, FilterCatalog, ProcessError, Samples, StreamConfig, StreamRegistry, TidePredictor,
};

use crate::cli::{Args, CliError};

/// Run the record loop until the input is exhausted
pub fn run<R: BufRead>(
    args: &Args,
    config: &StreamConfig,
    catalog: &FilterCatalog,
    tides: &TidePredictor,
    input: R,
) -> Result<(), CliError> {
    let mut registry = StreamRegistry::new();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut packed = 0u64;

    for (lineno, line) in input.lines().enumerate() {
        let line = line.context("error reading input")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let rec = match parse_record(line) {
            Ok(rec) => rec,
            Err(err) => {
                warn!("line {}: {}", lineno + 1, err);
                continue;
            }
        };

        // unusable records are a no-op for the core too; rejecting
        // them here avoids creating stream state for them
        if rec.samprate <= 0.0 || rec.samples.is_empty() {
            continue;
        }

        let stream = registry
            .get_or_create(&rec.srcname, config, catalog, rec.samprate)
            .map_err(|err| anyhow!(err))?;

        match stream.process(&rec, tides, args.timetol, &mut |msg| {
            out.write_all(msg.text.as_bytes())?;
            out.write_all(b"\n")?;
            out.flush()
        }) {
            Ok(0) => {}
            Ok(n) => {
                packed += u64::from(n);
                debug!("packed {} reports for {}", n, rec.srcname);
            }
            Err(ProcessError::Rate(rate)) => {
                warn!(
                    "{}: invalid sample rate {}, record dropped",
                    rec.srcname, rate
                );
            }
            Err(err) => return Err(anyhow!(err).into()),
        }
    }

    info!("stopping; {} reports total", packed);
    Ok(())
}

// Parse one record line: srcname, start (us), rate (Hz), count, samples
fn parse_record(line: &str) -> Result<DataRecord, anyhow::Error> {
    let mut fields = line.split_whitespace();

    let srcname = fields
        .next()
        .ok_or_else(|| anyhow!("missing source name"))?;
    let starttime: i64 = fields
        .next()
        .ok_or_else(|| anyhow!("missing start time"))?
        .parse()
        .context("bad start time")?;
    let samprate: f64 = fields
        .next()
        .ok_or_else(|| anyhow!("missing sample rate"))?
        .parse()
        .context("bad sample rate")?;
    let count: usize = fields
        .next()
        .ok_or_else(|| anyhow!("missing sample count"))?
        .parse()
        .context("bad sample count")?;

    let samples = fields
        .map(|tok| tok.parse::<i32>().context("bad sample value"))
        .collect::<Result<Vec<i32>, _>>()?;
    if samples.len() != count {
        return Err(anyhow!(
            "expected {} samples, found {}",
            count,
            samples.len()
        ));
    }

    Ok(DataRecord {
        srcname: srcname.to_owned(),
        starttime,
        samprate,
        samples: Samples::Int(samples),
    })
}
