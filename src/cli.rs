//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{ArgGroup, Parser, ValueEnum};
use reqcache::{Bypass, StatusCheckMode};

/// Fetch a URL through the cache.
///
/// The body is served from the on-disk cache when present, otherwise fetched with
/// per-host rate limiting and stored for the next run.
#[derive(Parser, Debug)]
#[command(name = "reqcache")]
#[command(author, version, about)]
#[command(group(ArgGroup::new("bypass").args(["no_cache", "refresh", "no_store"])))]
pub struct Args {
    /// URL to fetch (http or https)
    pub url: String,

    /// Write the body to FILE instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Cache root directory
    #[arg(long, value_name = "DIR", default_value = reqcache::DEFAULT_CACHE_DIR)]
    pub cache_dir: PathBuf,

    /// Neither read nor write the cache for this fetch
    #[arg(long)]
    pub no_cache: bool,

    /// Ignore any cached copy but store the fresh response
    #[arg(long)]
    pub refresh: bool,

    /// Use a cached copy if present but do not store the response
    #[arg(long)]
    pub no_store: bool,

    /// Requests per second per host (overrides the config file)
    #[arg(long, value_name = "N")]
    pub rps: Option<f64>,

    /// Retry attempts for transient failures, 0-10 (overrides the config file)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(0..=10))]
    pub retries: Option<u32>,

    /// Status check strictness (overrides the config file)
    #[arg(long, value_enum, value_name = "MODE")]
    pub status_check: Option<StatusCheckArg>,

    /// JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Accept invalid TLS certificates
    #[arg(long)]
    pub insecure: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    /// Per-call cache bypass selected by the flags.
    pub fn bypass(&self) -> Bypass {
        if self.no_cache {
            Bypass::Full
        } else if self.refresh {
            Bypass::ReadOnly
        } else if self.no_store {
            Bypass::WriteOnly
        } else {
            Bypass::None
        }
    }
}

/// Command-line spelling of [`StatusCheckMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusCheckArg {
    /// Accept every status
    None,
    /// Reject 4xx and 5xx
    CheckError,
    /// Reject anything but 200
    #[value(name = "require_200", alias = "require-200")]
    Require200,
}

impl From<StatusCheckArg> for StatusCheckMode {
    fn from(arg: StatusCheckArg) -> Self {
        match arg {
            StatusCheckArg::None => Self::None,
            StatusCheckArg::CheckError => Self::CheckError,
            StatusCheckArg::Require200 => Self::Require200,
        }
    }
}
