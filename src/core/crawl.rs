/*!
 * Source tree crawl fused with the partitioner
 *
 * Runs on its own thread, producing sealed buckets into the bounded bucket
 * channel. The channel capacity equals the worker count, so a saturated pool
 * throttles the crawl instead of letting it race ahead.
 */

use std::path::Path;

use crossbeam_channel::Sender;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::RunConfig;
use crate::core::bucket::{Bucket, Partitioner};
use crate::core::cancel::CancelToken;
use crate::core::entry::{Entry, EntryKind};
use crate::core::events::Event;

/// What the crawl saw before it stopped.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlTotals {
    pub entries: u64,
    pub bytes: u64,
    pub buckets: u64,
    /// False when cancellation or a closed channel cut the walk short
    pub complete: bool,
}

/// Walk the source in pre-order (parents before children, symlinks recorded
/// but never followed, native per-directory order), fold every entry into
/// buckets, and push sealed buckets downstream. Unreadable subtrees become
/// warnings; the walk continues past them.
pub fn crawl_and_partition(
    config: &RunConfig,
    buckets: Sender<Bucket>,
    events: Sender<Event>,
    cancel: &CancelToken,
) -> CrawlTotals {
    let mut partitioner = Partitioner::new(config.entries_per_bucket, config.bytes_per_bucket);
    let mut totals = CrawlTotals::default();
    let mut stopped = false;

    // The root's own `.` entry is held back until a child shows up, so an
    // empty source yields zero buckets and spawns nothing.
    let mut pending_root: Option<Entry> = None;

    for item in WalkDir::new(&config.source).follow_links(false) {
        if cancel.is_cancelled() {
            stopped = true;
            break;
        }

        let dirent = match item {
            Ok(dirent) => dirent,
            Err(err) => {
                let path = err
                    .path()
                    .unwrap_or_else(|| Path::new(&config.source))
                    .to_path_buf();
                warn!("skipping unreadable subtree at {}: {err}", path.display());
                let _ = events.send(Event::CrawlWarning {
                    path,
                    message: err.to_string(),
                });
                continue;
            }
        };

        let rel = dirent
            .path()
            .strip_prefix(&config.source)
            .unwrap_or_else(|_| dirent.path())
            .to_path_buf();

        let kind = EntryKind::from_file_type(&dirent.file_type());
        let size = match dirent.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!("stat failed for {}: {err}", dirent.path().display());
                let _ = events.send(Event::CrawlWarning {
                    path: dirent.path().to_path_buf(),
                    message: err.to_string(),
                });
                continue;
            }
        };

        if rel.as_os_str().is_empty() {
            pending_root = Some(Entry::new(".".into(), 0, kind));
            continue;
        }

        if let Some(root) = pending_root.take() {
            if !emit(root, &mut partitioner, &mut totals, &buckets, &events) {
                stopped = true;
                break;
            }
        }
        if !emit(
            Entry::new(rel, size, kind),
            &mut partitioner,
            &mut totals,
            &buckets,
            &events,
        ) {
            stopped = true;
            break;
        }
    }

    if !stopped {
        totals.buckets = partitioner.sealed();
        if let Some(last) = partitioner.finish() {
            totals.buckets += 1;
            if queue_bucket(last, &buckets, &events) {
                totals.complete = true;
            }
        } else {
            totals.complete = true;
        }
    }

    if totals.complete {
        let _ = events.send(Event::CrawlComplete {
            entries: totals.entries,
            bytes: totals.bytes,
            buckets: totals.buckets,
        });
        debug!(
            "crawl complete: {} entries, {} bytes, {} buckets",
            totals.entries, totals.bytes, totals.buckets
        );
    } else {
        debug!("crawl stopped early after {} entries", totals.entries);
    }

    totals
}

/// Fold one entry; queue any bucket that sealed. Returns false once the
/// bucket channel has no receivers left.
fn emit(
    entry: Entry,
    partitioner: &mut Partitioner,
    totals: &mut CrawlTotals,
    buckets: &Sender<Bucket>,
    events: &Sender<Event>,
) -> bool {
    totals.entries += 1;
    totals.bytes += entry.size;
    match partitioner.push(entry) {
        Some(sealed) => queue_bucket(sealed, buckets, events),
        None => true,
    }
}

fn queue_bucket(bucket: Bucket, buckets: &Sender<Bucket>, events: &Sender<Event>) -> bool {
    let _ = events.send(Event::BucketQueued {
        id: bucket.id,
        entries: bucket.count(),
        bytes: bucket.bytes,
    });
    buckets.send(bucket).is_ok()
}
