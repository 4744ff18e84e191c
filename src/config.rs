/*!
 * Run configuration and validation
 */

use std::env;
use std::fs;
use std::path::PathBuf;

use crate::error::{ConvoyError, Result};

/// Entries per bucket unless `-f/--files` says otherwise.
pub const DEFAULT_ENTRIES_PER_BUCKET: usize = 1000;

/// Bytes per bucket unless `-s/--size` says otherwise (1 GiB).
pub const DEFAULT_BYTES_PER_BUCKET: u64 = 1 << 30;

/// Arguments every rsync child receives before user-supplied options.
/// `-S` is kept to match historical behaviour; override it with
/// `--rsync-options` on destinations where sparse writes are a bad idea.
pub const BASE_RSYNC_ARGS: &[&str] = &["-aS", "--numeric-ids"];

/// Environment variable naming the default rsync executable.
pub const RSYNC_ENV: &str = "RSYNC";

/// Immutable configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Source tree root (must exist and be a readable directory)
    pub source: PathBuf,

    /// Destination root (created if absent)
    pub destination: PathBuf,

    /// Number of concurrent rsync workers
    pub parallelism: usize,

    /// Maximum entries accepted by one bucket
    pub entries_per_bucket: usize,

    /// Maximum aggregate regular-file bytes accepted by one bucket
    pub bytes_per_bucket: u64,

    /// Render the live progress line (also requires stdout to be a tty)
    pub progress: bool,

    /// rsync executable to spawn
    pub rsync_path: PathBuf,

    /// Extra arguments appended verbatim to every child
    pub extra_rsync_args: Vec<String>,

    /// Keep dispatching buckets after the first failed one
    pub keep_going: bool,

    /// Print per-bucket command lines instead of executing
    pub dry_run: bool,

    /// Extended figures in the final summary
    pub stats: bool,
}

impl RunConfig {
    /// Build a config with defaults for everything but the endpoints.
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            parallelism: default_parallelism(),
            entries_per_bucket: DEFAULT_ENTRIES_PER_BUCKET,
            bytes_per_bucket: DEFAULT_BYTES_PER_BUCKET,
            progress: false,
            rsync_path: default_rsync_path(),
            extra_rsync_args: Vec::new(),
            keep_going: false,
            dry_run: false,
            stats: false,
        }
    }

    /// Check everything that must hold before a single worker starts.
    /// Creates the destination directory when it does not exist yet.
    pub fn validate(&self) -> Result<()> {
        if self.parallelism < 1 {
            return Err(ConvoyError::Config(
                "parallelism must be at least 1".to_string(),
            ));
        }
        if self.entries_per_bucket < 1 {
            return Err(ConvoyError::Config(
                "entries per bucket must be at least 1".to_string(),
            ));
        }
        if self.bytes_per_bucket < 1 {
            return Err(ConvoyError::Config(
                "bytes per bucket must be at least 1".to_string(),
            ));
        }

        for path in [&self.source, &self.destination] {
            let text = path.to_string_lossy();
            if looks_remote(&text) {
                return Err(ConvoyError::RemotePath(text.into_owned()));
            }
        }

        let meta =
            fs::metadata(&self.source).map_err(|_| ConvoyError::Source(self.source.clone()))?;
        if !meta.is_dir() {
            return Err(ConvoyError::Source(self.source.clone()));
        }
        // Readability check; an opaque directory would otherwise surface as a
        // warning-and-empty-run much later.
        fs::read_dir(&self.source).map_err(|_| ConvoyError::Source(self.source.clone()))?;

        if !self.destination.exists() {
            fs::create_dir_all(&self.destination)?;
        }

        Ok(())
    }
}

/// `host:path` and `user@host:path` are rsync remote specs; convoy is
/// local-to-local only. A single leading `X:` is allowed so Windows drive
/// letters survive.
pub fn looks_remote(path: &str) -> bool {
    match path.find(':') {
        None => false,
        Some(idx) => {
            let drive_letter = idx == 1
                && path
                    .as_bytes()
                    .first()
                    .is_some_and(|b| b.is_ascii_alphabetic());
            if drive_letter {
                // anything after the drive prefix may not contain another colon
                path[2..].contains(':')
            } else {
                true
            }
        }
    }
}

/// Worker count when `-p/--processes` is absent: one per CPU.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or_else(|err| {
            tracing::warn!("could not detect available parallelism ({err}), using 1 worker");
            1
        })
}

/// rsync executable when `-r/--rsync` is absent: `$RSYNC`, else `rsync`
/// resolved through `PATH`.
pub fn default_rsync_path() -> PathBuf {
    env::var_os(RSYNC_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("rsync"))
}
