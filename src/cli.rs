//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use netupdate_core::{DEFAULT_CONCURRENCY, DEFAULT_MAX_ATTEMPTS, SplitApproach};

/// Fetch files and apply updates over HTTP(S).
///
/// netupdate downloads single files (optionally in parallel byte-range
/// segments), verifies checksums, and runs the full update pipeline against
/// an update API.
#[derive(Parser, Debug)]
#[command(name = "netupdate")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download one URL to a file
    Fetch(FetchArgs),
    /// Print or verify a file digest
    Hash(HashArgs),
    /// Run the update pipeline from a configuration file
    Update(UpdateArgs),
}

/// Arguments for `fetch`.
#[derive(clap::Args, Debug)]
pub struct FetchArgs {
    /// URL to download
    pub url: String,

    /// Destination file
    #[arg(short, long)]
    pub output: PathBuf,

    /// Download as concurrent byte-range segments
    #[arg(short, long)]
    pub segmented: bool,

    /// How segments are split
    #[arg(long, value_enum, default_value_t = SplitArg::Auto)]
    pub split: SplitArg,

    /// Segment count or chunk size in bytes, depending on --split (0 for default)
    #[arg(long, default_value_t = 0)]
    pub split_param: u64,

    /// Maximum attempts for a single-stream download (1-10)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_ATTEMPTS as u8, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub max_attempts: u8,

    /// Delay between attempts in milliseconds (max 60000)
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub retry_delay: u64,

    /// Resume from an existing partial output file
    #[arg(long, conflicts_with = "segmented")]
    pub resume: bool,

    /// Extra request header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Proxy URL, or "true" for the system proxy
    #[arg(long, default_value = "")]
    pub proxy: String,

    /// PEM bundle of trusted CA certificates
    #[arg(long)]
    pub ca_bundle: Option<PathBuf>,

    /// Maximum concurrent segment requests (1-100)
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONCURRENCY as u8, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: u8,
}

/// Arguments for `hash`.
#[derive(clap::Args, Debug)]
pub struct HashArgs {
    /// File to hash
    pub file: PathBuf,

    /// Digest algorithm (md5, sha1, sha256, sha512)
    #[arg(short, long, default_value = "sha256")]
    pub algorithm: String,

    /// Expected digest; exit with an error when it does not match
    #[arg(short, long)]
    pub expect: Option<String>,
}

/// Arguments for `update`.
#[derive(clap::Args, Debug)]
pub struct UpdateArgs {
    /// Engine configuration JSON
    #[arg(long)]
    pub config: PathBuf,

    /// Override the work folder from the configuration
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Only query maintenance and update endpoints; download nothing
    #[arg(long)]
    pub check_only: bool,
}

/// Split approach as a CLI value.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitArg {
    /// Choose by content length
    Auto,
    /// Segment count, never below 256 KiB per segment
    Count,
    /// Chunk size in bytes, never below 5 MiB
    Size,
    /// Exact segment count
    Quantity,
}

impl From<SplitArg> for SplitApproach {
    fn from(value: SplitArg) -> Self {
        match value {
            SplitArg::Auto => Self::Auto,
            SplitArg::Count => Self::ByCount,
            SplitArg::Size => Self::BySize,
            SplitArg::Quantity => Self::ByQuantity,
        }
    }
}
