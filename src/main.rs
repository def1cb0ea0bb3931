use anyhow::Result;
use kestrel::cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse cli and handle clap errors
    let options = cli::parse_from_args();

    kestrel::init_logger(cli::log_level_from_verbosity_flag_count(options.verbose));

    match kestrel::daemon::run(&options).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            cli::report_error(&e);
            std::process::exit(1);
        }
    }
}
