use std::fmt::Display;

use clap::Parser;

use sealevel::GapPolicy;

/// Standard input filename
const STDIN_FILE: &str = "-";

const USAGE_SHORT: &str = r#"
This program converts raw tide-gauge counts into sea-level heights, with and without a tidal correction, and emits them as fixed-width CREX reports on standard output.

See --help for more details.
"#;

const USAGE_LONG: &str = r#"
This program converts raw tide-gauge counts into sea-level heights, with and without a tidal correction, and emits them as fixed-width CREX reports on standard output.

Input is one decoded record per line, whitespace-separated:

    <srcname> <starttime> <samprate> <count> <sample> ...

where <starttime> is in microseconds since the UNIX epoch, <samprate> is in Hz, and exactly <count> integer samples follow. Blank lines and lines starting with '#' are ignored.

Each stream's filter chain must decimate its input down to one sample per second. Filters are drawn, in the order given, from the --firfile catalog:

    slcrex -N filters.fir -F DEC5 -F DEC8M \
        -I "WLGT 41.28S 174.78E" -A 0 -B 0.001 < records.txt

Tidal constituents enable the residual (surge) field:

    slcrex -T M2/0.49/98.6 -T S2/0.07/135.1 -L -41.28 -Z 0
"#;

/// Top-level program arguments
#[derive(Parser, Clone, Debug)]
#[command(version)]
#[command(about, long_about = None)]
#[command(after_help = USAGE_SHORT, after_long_help = USAGE_LONG)]
#[command(max_term_width = 100)]
pub struct Args {
    /// Verbosity level (-vvv for more)
    #[arg(short, long, default_value_t = 0, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print nothing but the CREX reports
    #[arg(short, long)]
    pub quiet: bool,

    /// Input file (or "-" for stdin)
    #[arg(long, default_value_t = STDIN_FILE.to_string())]
    pub file: String,

    /// FIR filter catalog file
    #[arg(short = 'N', long, default_value_t = String::from("filters.fir"))]
    pub firfile: String,

    /// Add a decimation filter to the chain, by catalog label
    ///
    /// May be given multiple times; the chain applies the filters in
    /// the order given.
    #[arg(short = 'F', long = "filter")]
    pub filter: Vec<String>,

    /// CREX ID tag placed in the report header
    #[arg(short = 'I', long, default_value_t = String::new())]
    pub tag: String,

    /// Offset added to calculated sea-level heights
    #[arg(short = 'A', long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub alpha: f64,

    /// Scale applied to calculated sea-level heights
    #[arg(short = 'B', long, default_value_t = 1.0)]
    pub beta: f64,

    /// Reference latitude, degrees
    #[arg(short = 'L', long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub latitude: f64,

    /// Reference time-zone offset, hours
    #[arg(short = 'Z', long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub zone: f64,

    /// Add a tidal constituent, as <label>/<amplitude>/<lag-degrees>
    #[arg(short = 'T', long = "tide")]
    pub tide: Vec<String>,

    /// Continuity tolerance, seconds (default: half a sample)
    #[arg(long)]
    pub timetol: Option<f64>,

    /// Smoothing-buffer behavior across stream gaps
    #[arg(long, default_value_t = GapPolicy::Preserve)]
    #[arg(value_parser = parse_gap_policy)]
    pub gap_policy: GapPolicy,
}

impl Args {
    /// Return true if the user requests input from stdin
    pub fn input_is_stdin(&self) -> bool {
        self.file == STDIN_FILE
    }
}

fn parse_gap_policy(s: &str) -> Result<GapPolicy, String> {
    s.parse()
        .map_err(|_| String::from("must be one of: preserve, reset"))
}

/// A program-level error with exit code
///
/// Errors from clap keep their own formatting (and a zero exit code
/// for `--help`/`--version`); everything else prints through the
/// standard error prefix.
#[derive(Debug)]
pub struct CliError {
    error: anyhow::Error,
    exit_code: i32,
}

impl CliError {
    /// Print this error to the terminal and exit
    pub fn exit(&self) -> ! {
        match self.error.downcast_ref::<clap::Error>() {
            Some(err) => drop(err.print()),
            None => eprintln!("error: {:#}", self.error),
        }
        std::process::exit(self.exit_code);
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.error)
    }
}

impl std::error::Error for CliError {}

impl From<anyhow::Error> for CliError {
    fn from(error: anyhow::Error) -> CliError {
        CliError {
            error,
            exit_code: 1,
        }
    }
}

impl From<clap::Error> for CliError {
    fn from(error: clap::Error) -> CliError {
        let exit_code = if error.use_stderr() { 1 } else { 0 };
        CliError {
            error: error.into(),
            exit_code,
        }
    }
}
