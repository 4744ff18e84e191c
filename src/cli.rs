/*!
 * Command line definition and conversion into a run configuration
 */

use std::path::PathBuf;

use clap::Parser;

use crate::config::{RunConfig, DEFAULT_ENTRIES_PER_BUCKET};
use crate::error::{ConvoyError, Result};

/// Parallel rsync wrapper for local directory replication.
///
/// convoy walks SOURCE once, folds the entries into buckets bounded by entry
/// count and byte size, and hands each bucket to its own rsync process, up to
/// `--processes` of them at a time.
#[derive(Debug, Parser)]
#[command(name = "convoy", version, about, max_term_width = 100)]
pub struct Cli {
    /// Source directory followed by the destination directory
    #[arg(value_name = "SOURCE... DEST", required = true, num_args = 2..)]
    pub paths: Vec<PathBuf>,

    /// Number of rsync processes to run in parallel (default: CPU count)
    #[arg(short = 'p', long = "processes", value_name = "N")]
    pub processes: Option<usize>,

    /// Maximum number of entries per bucket
    #[arg(
        short = 'f',
        long = "files",
        value_name = "N",
        default_value_t = DEFAULT_ENTRIES_PER_BUCKET
    )]
    pub files: usize,

    /// Maximum bytes per bucket; accepts K/M/G/T suffixes (base 1024)
    #[arg(
        short = 's',
        long = "size",
        value_name = "SIZE",
        default_value = "1G",
        value_parser = parse_size
    )]
    pub size: u64,

    /// Show a live progress line (stdout must be a terminal)
    #[arg(short = 'P', long = "progress")]
    pub progress: bool,

    /// Path to the rsync executable (overrides the RSYNC environment variable)
    #[arg(short = 'r', long = "rsync", value_name = "PATH")]
    pub rsync: Option<PathBuf>,

    /// Extra options for every rsync child, split on whitespace and appended
    /// after the built-in "-aS --numeric-ids"
    #[arg(long = "rsync-options", value_name = "OPTS", allow_hyphen_values = true)]
    pub rsync_options: Option<String>,

    /// Keep dispatching buckets after the first failed one
    #[arg(short = 'k', long = "keep-going")]
    pub keep_going: bool,

    /// Print the rsync command line for every bucket without executing anything
    #[arg(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// Print extended transfer statistics in the final summary
    #[arg(long = "stats")]
    pub stats: bool,
}

impl Cli {
    /// Turn parsed arguments into a `RunConfig`. Path validation happens
    /// later in `RunConfig::validate`; this only enforces CLI shape.
    pub fn into_config(mut self) -> Result<RunConfig> {
        if self.paths.len() > 2 {
            return Err(ConvoyError::Config(format!(
                "{} source paths given; convoy replicates exactly one source tree per run",
                self.paths.len() - 1
            )));
        }
        // clap guarantees at least two paths
        let destination = self
            .paths
            .pop()
            .ok_or_else(|| ConvoyError::Internal("positional arguments missing".to_string()))?;
        let source = self
            .paths
            .pop()
            .ok_or_else(|| ConvoyError::Internal("positional arguments missing".to_string()))?;

        let mut config = RunConfig::new(source, destination);
        if let Some(processes) = self.processes {
            config.parallelism = processes;
        }
        config.entries_per_bucket = self.files;
        config.bytes_per_bucket = self.size;
        config.progress = self.progress;
        if let Some(rsync) = self.rsync {
            config.rsync_path = rsync;
        }
        if let Some(options) = &self.rsync_options {
            config.extra_rsync_args = options.split_whitespace().map(str::to_string).collect();
        }
        config.keep_going = self.keep_going;
        config.dry_run = self.dry_run;
        config.stats = self.stats;
        Ok(config)
    }
}

/// Parse a byte count with an optional K/M/G/T suffix, base 1024.
pub fn parse_size(text: &str) -> std::result::Result<u64, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty size".to_string());
    }

    let (digits, shift) = match text.as_bytes()[text.len() - 1].to_ascii_uppercase() {
        b'K' => (&text[..text.len() - 1], 10),
        b'M' => (&text[..text.len() - 1], 20),
        b'G' => (&text[..text.len() - 1], 30),
        b'T' => (&text[..text.len() - 1], 40),
        b if b.is_ascii_digit() => (text, 0),
        other => {
            return Err(format!(
                "unknown size suffix '{}' (expected K, M, G or T)",
                other as char
            ))
        }
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{text}'"))?;
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size '{text}' overflows"))
}
