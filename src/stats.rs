/*!
 * Run summary, exit-code derivation, and human-readable formatting
 */

use std::path::PathBuf;
use std::time::Duration;

use crate::core::cancel::CancelReason;

/// Stderr tail and identity of one failed bucket, for the final report.
#[derive(Debug, Clone)]
pub struct FailureDetail {
    pub bucket_id: u64,
    /// First entry of the bucket; failure messages always name a path
    pub first_path: PathBuf,
    /// Child exit code when the child ran at all
    pub exit_code: Option<i32>,
    /// Spawn error or signal description when there is no exit code
    pub message: Option<String>,
    pub stderr_tail: Vec<String>,
}

/// Aggregate outcome of a run, produced by the monitor.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub buckets_total: u64,
    pub buckets_ok: u64,
    pub buckets_partial: u64,
    pub buckets_failed: u64,
    pub buckets_cancelled: u64,
    pub entries: u64,
    pub bytes: u64,
    /// Bytes attempted, segregated by how the owning bucket ended
    pub bytes_ok: u64,
    pub bytes_partial: u64,
    pub bytes_failed: u64,
    pub bytes_cancelled: u64,
    pub elapsed: Duration,
    pub cancel_reason: Option<CancelReason>,
    /// Exit code of the failure that triggered cancellation (keep-going off)
    pub first_failure_code: Option<i32>,
    pub failures: Vec<FailureDetail>,
    /// Failed buckets beyond the report cap
    pub failures_dropped: u64,
}

impl RunSummary {
    /// Map the aggregate to a process exit code: 130 after a signal, the
    /// first child's own code when a failure cancelled the run, otherwise
    /// worst severity across buckets.
    pub fn exit_code(&self) -> i32 {
        match self.cancel_reason {
            Some(CancelReason::Signal) => 130,
            Some(CancelReason::Failure) => self.first_failure_code.unwrap_or(1),
            None => {
                if self.buckets_failed > 0 {
                    1
                } else {
                    0
                }
            }
        }
    }
}

/// Human-readable byte count, base 1024.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Human-readable wall time.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else if total > 0 {
        format!("{}s", seconds)
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Human-readable throughput.
pub fn format_rate(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec.max(0.0) as u64))
}
