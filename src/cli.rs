use std::{env, path::PathBuf};

use clap::{ArgAction, Parser};

use crate::output::OutputFormat;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "kestrel-exec",
    version,
    about = "Kestrel process event correlation daemon"
)]
pub struct Options {
    /// Custom configuration file
    #[arg(long)]
    pub config_file: Option<String>,

    /// Replay raw kernel messages from a JSONL file instead of stdin
    #[arg(long)]
    pub replay: Option<PathBuf>,

    /// Container/pod metadata snapshot (JSON) loaded into the lookup caches
    #[arg(long)]
    pub metadata: Option<PathBuf>,

    /// Skip seeding the process table from procfs
    #[arg(long)]
    pub no_seed: bool,

    /// Output format for delivered events
    #[arg(long, default_value = "plaintext")]
    pub output: OutputFormat,

    /// Pass many times for a more verbose output. Passing `-v` adds
    /// debug logs, `-vv` enables trace logging
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

pub fn parse_from_args() -> Options {
    Options::parse()
}

pub fn log_level_from_verbosity_flag_count(num: u8) -> log::Level {
    match num {
        0 => log::Level::Info,
        1 => log::Level::Debug,
        2..=u8::MAX => log::Level::Trace,
    }
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

pub fn report_error(e: &anyhow::Error) {
    // NB: This shows one error: even for multiple causes and backtraces etc,
    // rather than one per cause, and one for the backtrace. This seems like a
    // reasonable tradeoff, but if we want to do differently, this is the code
    // hunk to revisit.
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let options = Options::parse_from(["kestrel-exec"]);
        assert!(options.replay.is_none());
        assert!(!options.no_seed);
        assert_eq!(options.verbose, 0);
    }

    #[test]
    fn output_format_parses() {
        let options = Options::parse_from(["kestrel-exec", "--output", "json", "-vv"]);
        assert!(matches!(options.output, OutputFormat::Json));
        assert_eq!(log_level_from_verbosity_flag_count(options.verbose), log::Level::Trace);
    }
}
