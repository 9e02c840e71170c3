//! persist-cache.
//!
//! Inspects and maintains the on-disk caches written by the `persist-cache` library: flushing
//! expired entries, clearing or deleting whole caches and listing what a cache holds.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
