/*!
 * Monitor: single owner of aggregate run state and user-visible output
 *
 * Consumes lifecycle events until every producer hangs up, maintains the
 * counters, rate-limits the progress line, and decides run-level policy
 * (keep-going, first-bucket spawn failure). Nothing else in the process
 * writes to stdout while a run is in flight.
 */

use std::collections::VecDeque;
use std::io::{self, IsTerminal, Write};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::debug;

use crate::config::RunConfig;
use crate::core::cancel::{CancelReason, CancelToken};
use crate::core::events::{BucketResult, Event, Outcome};
use crate::stats::{format_bytes, format_duration, format_rate, FailureDetail, RunSummary};

/// Minimum delay between progress line redraws.
const REFRESH_INTERVAL: Duration = Duration::from_millis(250);

/// Throughput is computed over this trailing window.
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// Failed buckets reported in full; beyond this only counted.
pub const MAX_FAILURE_REPORTS: usize = 32;

/// Totals reported by the crawl once it finishes.
#[derive(Debug, Clone, Copy)]
struct KnownTotals {
    entries: u64,
    bytes: u64,
    buckets: u64,
}

pub struct Monitor {
    events: Receiver<Event>,
    cancel: CancelToken,
    keep_going: bool,
    print_stats: bool,
    show_progress: bool,
    started: Instant,

    queued: u64,
    ok: u64,
    partial: u64,
    failed: u64,
    cancelled: u64,
    entries_done: u64,
    bytes_done: u64,
    bytes_ok: u64,
    bytes_partial: u64,
    bytes_failed: u64,
    bytes_cancelled: u64,
    totals: Option<KnownTotals>,

    first_failure_seen: bool,
    first_failure_code: Option<i32>,
    failures: Vec<FailureDetail>,
    failures_dropped: u64,

    rate_samples: VecDeque<(Instant, u64)>,
    last_draw: Option<Instant>,
    line_width: usize,
}

impl Monitor {
    pub fn new(events: Receiver<Event>, cancel: CancelToken, config: &RunConfig) -> Self {
        Self {
            events,
            cancel,
            keep_going: config.keep_going,
            print_stats: config.stats,
            show_progress: config.progress && !config.dry_run && io::stdout().is_terminal(),
            started: Instant::now(),
            queued: 0,
            ok: 0,
            partial: 0,
            failed: 0,
            cancelled: 0,
            entries_done: 0,
            bytes_done: 0,
            bytes_ok: 0,
            bytes_partial: 0,
            bytes_failed: 0,
            bytes_cancelled: 0,
            totals: None,
            first_failure_seen: false,
            first_failure_code: None,
            failures: Vec::new(),
            failures_dropped: 0,
            rate_samples: VecDeque::new(),
            last_draw: None,
            line_width: 0,
        }
    }

    /// Drain events until the crawler and every worker have hung up, then
    /// print the final report and hand back the summary.
    pub fn run(mut self) -> RunSummary {
        loop {
            match self.events.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.maybe_draw();
        }
        self.clear_line();

        let summary = RunSummary {
            buckets_total: self.queued,
            buckets_ok: self.ok,
            buckets_partial: self.partial,
            buckets_failed: self.failed,
            buckets_cancelled: self.cancelled,
            entries: self.entries_done,
            bytes: self.bytes_done,
            bytes_ok: self.bytes_ok,
            bytes_partial: self.bytes_partial,
            bytes_failed: self.bytes_failed,
            bytes_cancelled: self.bytes_cancelled,
            elapsed: self.started.elapsed(),
            cancel_reason: self.cancel.reason(),
            first_failure_code: self.first_failure_code,
            failures: std::mem::take(&mut self.failures),
            failures_dropped: self.failures_dropped,
        };
        print_report(&summary, self.print_stats);
        summary
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::BucketQueued { id, entries, bytes } => {
                self.queued += 1;
                debug!("bucket {id} queued: {entries} entries, {bytes} bytes");
            }
            Event::BucketStarted { id, worker } => {
                debug!("bucket {id} started on worker {worker}");
            }
            Event::BucketPlanned { id, command } => {
                self.clear_line();
                println!("bucket {id}: {command}");
            }
            Event::CrawlWarning { path, message } => {
                self.clear_line();
                eprintln!("convoy: warning: {}: {message}", path.display());
            }
            Event::CrawlComplete {
                entries,
                bytes,
                buckets,
            } => {
                self.totals = Some(KnownTotals {
                    entries,
                    bytes,
                    buckets,
                });
            }
            Event::WorkerExited { worker } => {
                debug!("worker {worker} exited");
            }
            Event::BucketFinished(result) => self.finish_bucket(result),
        }
    }

    fn finish_bucket(&mut self, result: BucketResult) {
        self.entries_done += result.entries as u64;
        self.bytes_done += result.bytes;
        self.rate_samples.push_back((Instant::now(), self.bytes_done));

        match result.outcome {
            Outcome::Ok => {
                self.ok += 1;
                self.bytes_ok += result.bytes;
            }
            Outcome::Partial => {
                self.partial += 1;
                self.bytes_partial += result.bytes;
                self.clear_line();
                eprintln!(
                    "convoy: warning: bucket {} finished partially (rsync exit {}) near {}",
                    result.bucket_id,
                    result.exit_code.unwrap_or(-1),
                    result.first_path.display()
                );
            }
            Outcome::Cancelled => {
                self.cancelled += 1;
                self.bytes_cancelled += result.bytes;
            }
            Outcome::Failed => {
                self.failed += 1;
                self.bytes_failed += result.bytes;
                if !self.first_failure_seen {
                    self.first_failure_seen = true;
                    self.first_failure_code = result.exit_code;
                }
                if self.failures.len() < MAX_FAILURE_REPORTS {
                    self.failures.push(FailureDetail {
                        bucket_id: result.bucket_id,
                        first_path: result.first_path.clone(),
                        exit_code: result.exit_code,
                        message: result.failure.clone(),
                        stderr_tail: result.stderr_tail.clone(),
                    });
                } else {
                    self.failures_dropped += 1;
                }

                if result.spawn_failed && result.bucket_id == 1 && !self.cancel.is_cancelled() {
                    // the very first child failing to launch means the rsync
                    // path is wrong, not that one bucket was unlucky
                    self.clear_line();
                    eprintln!("convoy: rsync could not be launched, aborting the run");
                    self.cancel.cancel(CancelReason::Failure);
                } else if !self.keep_going && !self.cancel.is_cancelled() {
                    self.clear_line();
                    eprintln!(
                        "convoy: bucket {} failed, cancelling remaining work \
                         (use --keep-going to continue past failures)",
                        result.bucket_id
                    );
                    self.cancel.cancel(CancelReason::Failure);
                }
            }
        }
    }

    fn maybe_draw(&mut self) {
        if !self.show_progress {
            return;
        }
        let due = match self.last_draw {
            None => true,
            Some(at) => at.elapsed() >= REFRESH_INTERVAL,
        };
        if due {
            self.draw();
            self.last_draw = Some(Instant::now());
        }
    }

    fn draw(&mut self) {
        let done = self.ok + self.partial + self.failed + self.cancelled;
        let (buckets_part, eta_part) = match self.totals {
            Some(totals) => {
                let eta = match self.rate() {
                    Some(rate) if rate > 0.0 => {
                        let remaining = totals.bytes.saturating_sub(self.bytes_done);
                        let seconds = (remaining as f64 / rate).ceil() as u64;
                        format!("  eta {}", format_duration(Duration::from_secs(seconds)))
                    }
                    _ => String::new(),
                };
                (format!("{done}/{} buckets", totals.buckets), eta)
            }
            // totals unknown until the crawl completes
            None => (format!("{done}/{}+ buckets", self.queued), String::new()),
        };

        let rate_part = match self.rate() {
            Some(rate) => format!("  {}", format_rate(rate)),
            None => String::new(),
        };

        let line = format!(
            "{buckets_part}  {} entries  {}{rate_part}{eta_part}",
            self.entries_done,
            format_bytes(self.bytes_done),
        );

        let mut out = io::stdout();
        let padding = self.line_width.saturating_sub(line.len());
        let _ = write!(out, "\r{line}{:padding$}", "");
        let _ = out.flush();
        self.line_width = line.len();
    }

    /// Throughput in bytes per second over the trailing window.
    fn rate(&mut self) -> Option<f64> {
        let now = Instant::now();
        while self.rate_samples.len() > 1 {
            let Some(&(at, _)) = self.rate_samples.front() else {
                break;
            };
            if now.duration_since(at) > RATE_WINDOW {
                self.rate_samples.pop_front();
            } else {
                break;
            }
        }
        let (first_at, first_bytes) = self.rate_samples.front()?;
        let (last_at, last_bytes) = self.rate_samples.back()?;
        let span = last_at.duration_since(*first_at).as_secs_f64();
        if span <= f64::EPSILON {
            return None;
        }
        Some((last_bytes - first_bytes) as f64 / span)
    }

    fn clear_line(&mut self) {
        if self.show_progress && self.line_width > 0 {
            let mut out = io::stdout();
            let _ = write!(out, "\r{:width$}\r", "", width = self.line_width);
            let _ = out.flush();
            self.line_width = 0;
        }
    }
}

/// Final report: the summary on stdout, failure details on stderr.
fn print_report(summary: &RunSummary, print_stats: bool) {
    let stdout = io::stdout();
    let _ = write_summary(&mut stdout.lock(), summary, print_stats);

    if summary.cancel_reason == Some(CancelReason::Signal) {
        eprintln!("convoy: run cancelled by signal");
    }

    for failure in &summary.failures {
        match (failure.exit_code, &failure.message) {
            (Some(code), _) => eprintln!(
                "convoy: bucket {} failed (rsync exit {code}) near {}",
                failure.bucket_id,
                failure.first_path.display()
            ),
            (None, Some(message)) => eprintln!(
                "convoy: bucket {} failed ({message}) near {}",
                failure.bucket_id,
                failure.first_path.display()
            ),
            (None, None) => eprintln!(
                "convoy: bucket {} failed near {}",
                failure.bucket_id,
                failure.first_path.display()
            ),
        }
        for line in &failure.stderr_tail {
            eprintln!("  {line}");
        }
    }
    if summary.failures_dropped > 0 {
        eprintln!(
            "convoy: {} more failed buckets not shown",
            summary.failures_dropped
        );
    }
}

/// The stdout half of the final report, split out so tests can capture it.
fn write_summary(
    out: &mut impl io::Write,
    summary: &RunSummary,
    print_stats: bool,
) -> io::Result<()> {
    let mut breakdown = vec![format!("{} ok", summary.buckets_ok)];
    if summary.buckets_partial > 0 {
        breakdown.push(format!("{} partial", summary.buckets_partial));
    }
    if summary.buckets_failed > 0 {
        breakdown.push(format!("{} failed", summary.buckets_failed));
    }
    if summary.buckets_cancelled > 0 {
        breakdown.push(format!("{} cancelled", summary.buckets_cancelled));
    }

    writeln!(
        out,
        "convoy: {} buckets ({}), {} entries, {} in {}",
        summary.buckets_total,
        breakdown.join(", "),
        summary.entries,
        format_bytes(summary.bytes),
        format_duration(summary.elapsed),
    )?;

    if print_stats {
        let elapsed = summary.elapsed.as_secs_f64();
        if elapsed > 0.0 {
            writeln!(
                out,
                "  throughput: {}",
                format_rate(summary.bytes as f64 / elapsed)
            )?;
        }
        if summary.buckets_total > 0 {
            writeln!(
                out,
                "  average bucket: {} entries, {}",
                summary.entries / summary.buckets_total,
                format_bytes(summary.bytes / summary.buckets_total),
            )?;
        }
        writeln!(
            out,
            "  bytes by outcome: {} ok, {} partial, {} failed, {} cancelled",
            format_bytes(summary.bytes_ok),
            format_bytes(summary.bytes_partial),
            format_bytes(summary.bytes_failed),
            format_bytes(summary.bytes_cancelled),
        )?;
    }

    Ok(())
}
