//! Exposes the command line application.
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use persist_cache::{CacheHandle, Config, EntryInfo, FlushStats};
use serde::Serialize;

use crate::logging;

/// Inspects and maintains persistent function caches.
#[derive(Debug, Parser)]
#[command(name = "persist-cache", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// persist-cache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Remove entries that outlived their expiry.
    Flush {
        #[command(flatten)]
        target: Target,

        /// Overrides the configured expiry, e.g. `12h` or `30m`.
        #[arg(long, value_parser = humantime::parse_duration)]
        expiry: Option<Duration>,
    },

    /// Remove all entries, keeping the cache directory.
    Clear {
        #[command(flatten)]
        target: Target,
    },

    /// Remove the cache directory with all its entries and lock files.
    Delete {
        #[command(flatten)]
        target: Target,
    },

    /// Print all entries as JSON.
    List {
        #[command(flatten)]
        target: Target,
    },
}

/// Selects the cache a command operates on.
#[derive(Debug, Args)]
struct Target {
    /// The name of the cache within the configured cache directory.
    #[arg(required_unless_present = "dir")]
    name: Option<String>,

    /// Operate on the cache stored in this directory instead.
    #[arg(long, value_name = "DIR")]
    dir: Option<PathBuf>,
}

impl Target {
    fn resolve(&self, config: &Config) -> CacheHandle {
        match (&self.name, &self.dir) {
            (Some(name), Some(dir)) => CacheHandle::resolve_dir(config, name, dir.clone()),
            (None, Some(dir)) => {
                CacheHandle::resolve_dir(config, &dir.display().to_string(), dir.clone())
            }
            (name, None) => CacheHandle::resolve(config, name.as_deref().unwrap_or_default()),
        }
    }
}

/// A single line of `list` output.
#[derive(Debug, Serialize)]
struct ListedEntry {
    key: String,
    size: u64,
    age: String,
}

impl ListedEntry {
    fn new(info: &EntryInfo, now: SystemTime) -> Self {
        let age = now.duration_since(info.created_at).unwrap_or_default();
        Self {
            key: info.key.to_string(),
            size: info.size,
            age: humantime::format_duration(Duration::from_secs(age.as_secs())).to_string(),
        }
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    logging::init_logging(&config);

    run(cli.command, &config, &mut io::stdout().lock())
}

fn run(command: Command, config: &Config, out: &mut impl Write) -> Result<()> {
    match command {
        Command::Flush { target, expiry } => {
            let handle = target.resolve(config);
            let stats = persist_cache::flush(&handle, expiry).context("failed to flush cache")?;
            report(out, &handle, &stats)?;
        }
        Command::Clear { target } => {
            let handle = target.resolve(config);
            let stats = persist_cache::clear(&handle).context("failed to clear cache")?;
            report(out, &handle, &stats)?;
        }
        Command::Delete { target } => {
            let handle = target.resolve(config);
            persist_cache::delete(&handle).context("failed to delete cache")?;
            writeln!(out, "deleted {}", handle.dir().display())?;
        }
        Command::List { target } => {
            let handle = target.resolve(config);
            let now = SystemTime::now();
            let entries: Vec<_> = handle
                .store()
                .entries()
                .context("failed to list cache entries")?
                .iter()
                .map(|info| ListedEntry::new(info, now))
                .collect();
            serde_json::to_writer_pretty(&mut *out, &entries)?;
            writeln!(out)?;
        }
    }

    Ok(())
}

fn report(out: &mut impl Write, handle: &CacheHandle, stats: &FlushStats) -> io::Result<()> {
    writeln!(
        out,
        "{}: removed {} entries ({} bytes), retained {} entries ({} bytes)",
        handle.dir().display(),
        stats.removed_files,
        stats.removed_bytes,
        stats.retained_files,
        stats.retained_bytes,
    )
}
