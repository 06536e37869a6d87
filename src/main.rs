use std::process::ExitCode;

use clap::Parser;
use sbackup_lib::cli::{self, Cli};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    env_logger.try_init().expect("env_logger should not fail");

    cli::run(cli).into()
}
