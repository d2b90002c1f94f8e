//! Kodegen Bundler Matrix - build one package per platform and collect the artifacts.
//!
//! Exit codes: 0 when every leg succeeded, 1 when any leg failed, 2 when the run could
//! not start (bad arguments or configuration).

use kodegen_bundler_matrix::cli;
use std::process;

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::init();

    let exit_code = match cli::run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            for suggestion in e.recovery_suggestions() {
                eprintln!("  hint: {}", suggestion);
            }
            2
        }
    };

    process::exit(exit_code);
}
