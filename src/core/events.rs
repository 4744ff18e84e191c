/*!
 * Lifecycle events flowing from the crawler and the workers to the monitor
 *
 * Multi-producer, single-consumer. The channel is bounded so a stalled
 * monitor exerts back-pressure instead of buffering without limit, but the
 * capacity is generous enough that workers never block on reporting in
 * practice.
 */

use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

/// How one bucket ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// rsync exit 0
    Ok,
    /// rsync exit 23 or 24: files vanished mid-transfer; tolerated so live
    /// source trees do not fail the run
    Partial,
    /// any other exit, a signal death, or a spawn failure
    Failed,
    /// aborted by cancellation
    Cancelled,
}

/// Everything a worker knows about a finished bucket.
#[derive(Debug, Clone)]
pub struct BucketResult {
    pub bucket_id: u64,
    pub outcome: Outcome,
    /// Child exit code, when the child ran and exited normally
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    /// Aggregate regular-file bytes the bucket declared
    pub bytes: u64,
    pub entries: usize,
    /// First entry of the bucket, named in failure reports
    pub first_path: PathBuf,
    /// Last lines of the child's stderr, bounded per bucket
    pub stderr_tail: Vec<String>,
    /// Spawn error or signal description when there is no exit code
    pub failure: Option<String>,
    /// The child could not be launched at all
    pub spawn_failed: bool,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// The partitioner sealed a bucket and queued it for the workers
    BucketQueued { id: u64, entries: usize, bytes: u64 },

    /// A worker dequeued the bucket and is about to spawn its child
    BucketStarted { id: u64, worker: usize },

    /// Dry run: the command the worker would have executed
    BucketPlanned { id: u64, command: String },

    /// Exactly one per sealed bucket
    BucketFinished(BucketResult),

    /// Unreadable directory or failed stat; the subtree was skipped
    CrawlWarning { path: PathBuf, message: String },

    /// The crawl ran to completion; totals are final
    CrawlComplete {
        entries: u64,
        bytes: u64,
        buckets: u64,
    },

    /// A worker drained the channel and exited
    WorkerExited { worker: usize },
}

/// Events buffered per worker before senders block.
const EVENTS_PER_WORKER: usize = 64;

pub fn event_channel(parallelism: usize) -> (Sender<Event>, Receiver<Event>) {
    bounded(parallelism.max(1) * EVENTS_PER_WORKER)
}
