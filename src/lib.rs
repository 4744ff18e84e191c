/*!
 * convoy - parallel rsync orchestration for local trees
 *
 * convoy walks a source directory once, folds the entries into buckets
 * bounded by entry count and aggregate size, and hands each bucket to its
 * own `rsync --files-from=-` child, running up to a configured number of
 * children at a time. A single monitor owns progress output, warnings and
 * the final report.
 *
 * The library surface is the same one the binary uses: build a
 * [`RunConfig`], call [`run`] (or [`run_with_token`] to control
 * cancellation), and inspect the returned [`RunSummary`].
 */

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod stats;

pub use crate::core::cancel::{CancelReason, CancelToken};
pub use crate::core::{run, run_with_token};
pub use config::RunConfig;
pub use error::{ConvoyError, Result};
pub use stats::RunSummary;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
