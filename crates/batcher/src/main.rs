//! Batcher.
//!
//! A command line front end for the batcher call scheduler. It can inspect the snapshots a
//! scheduler left behind, and stress test the scheduler with synthetic workloads.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod inspect;
mod logging;
mod stress;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
