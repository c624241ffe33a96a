//! decompfs CLI Binary
//!
//! Command-line administration of a decomposed filesystem storage root.

use clap::Parser;
use decompfs::tooling::cli::{Cli, CliContext};
use std::process;

fn main() {
    let cli = Cli::parse();

    let context = match CliContext::new(&cli) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error opening storage: {}", e);
            process::exit(1);
        }
    };

    match context.execute(&cli.command) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            tracing::error!(error = %e, status = e.status_code(), "command failed");
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
