use std::io;

use anyhow::{anyhow, Context};
use clap::Parser;
use log::{info, LevelFilter};

use sealevel::{Constituent, FilterCatalog, StreamConfig, TidePredictor};

mod app;
mod cli;

use cli::{Args, CliError};

fn main() {
    match slcrex() {
        Ok(()) => {}
        Err(cli_error) => cli_error.exit(),
    }
}

fn slcrex() -> Result<(), CliError> {
    // Parse options and start logging
    let args = Args::try_parse()?;
    log_setup(&args);

    // the filter catalog is only consulted when a chain is configured
    let catalog = if args.filter.is_empty() {
        FilterCatalog::default()
    } else {
        let catalog = FilterCatalog::load(&args.firfile)
            .with_context(|| format!("could not load fir filter file [{}]", args.firfile))?;
        for label in &args.filter {
            if catalog.find(label).is_none() {
                return Err(anyhow!("could not find fir filter [{}]", label).into());
            }
        }
        catalog
    };

    let constituents = args
        .tide
        .iter()
        .map(|spec| spec.parse::<Constituent>())
        .collect::<Result<Vec<Constituent>, _>>()
        .map_err(|err| anyhow!(err))?;
    let tides = TidePredictor::new(&constituents, args.latitude, args.zone);

    let config = StreamConfig {
        tag: args.tag.clone(),
        alpha: args.alpha,
        beta: args.beta,
        filters: args.filter.clone(),
        gap_policy: args.gap_policy,
    };

    // file setup: locks stdin in case we need it
    let stdin = io::stdin();
    let stdin_handle = stdin.lock();
    let input = file_setup(&args, stdin_handle)?;

    app::run(&args, &config, &catalog, &tides, input)
}

fn log_setup(args: &Args) {
    if args.quiet {
        // no logging
        return;
    } else if std::env::var_os("RUST_LOG").is_none() {
        // parameter controls
        let log_filter = match args.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        pretty_env_logger::formatted_builder()
            .filter_module("sealevel", log_filter)
            .filter_module("slcrex", log_filter)
            .init();
    } else {
        // environment controls
        pretty_env_logger::init();
    }
}

fn file_setup<'stdin>(
    args: &Args,
    stdin: std::io::StdinLock<'stdin>,
) -> Result<Box<dyn io::BufRead + 'stdin>, anyhow::Error> {
    if args.input_is_stdin() {
        info!("reading records from standard input");
        if !is_terminal(&std::io::stdin()) {
            Ok(Box::new(io::BufReader::new(stdin)))
        } else {
            Err(anyhow!(
                "cowardly refusing to read records from a terminal.

Pipe a source of decoded sample records into this program, one record
per line; see --help for the format."
            ))
        }
    } else {
        info!("reading records from file: \"{}\"", &args.file);
        Ok(Box::new(io::BufReader::new(
            std::fs::File::open(&args.file)
                .with_context(|| format!("Unable to open --file \"{}\"", args.file))?,
        )))
    }
}

#[cfg(not(target_os = "windows"))]
fn is_terminal<S>(stream: &S) -> bool
where
    S: std::os::fd::AsRawFd,
{
    terminal_size::terminal_size_using_fd(stream.as_raw_fd()).is_some()
}

#[cfg(target_os = "windows")]
fn is_terminal<S>(stream: &S) -> bool
where
    S: std::os::windows::io::AsRawHandle,
{
    terminal_size::terminal_size_using_handle(stream.as_raw_handle()).is_some()
}
