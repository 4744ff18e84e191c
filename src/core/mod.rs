/*!
 * Core pipeline: crawl, partition, dispatch, monitor
 */

pub mod bucket;
pub mod cancel;
pub mod crawl;
pub mod entry;
pub mod events;
pub mod monitor;
pub mod worker;

use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;
use tracing::debug;

use crate::config::RunConfig;
use crate::error::{ConvoyError, Result};
use crate::stats::RunSummary;
use self::cancel::CancelToken;
use self::monitor::Monitor;
use self::worker::WorkerContext;

/// Run the full pipeline with a private cancellation token. Signal handling
/// is the caller's business; see `run_with_token`.
pub fn run(config: RunConfig) -> Result<RunSummary> {
    run_with_token(config, CancelToken::new())
}

/// Run the full pipeline. The caller may hook the token up to signal
/// handlers (the binary does) or flip it from another thread (tests do).
///
/// One producer thread crawls and partitions, `parallelism` workers consume
/// the bounded bucket channel, and the monitor drains events on the calling
/// thread until everyone hangs up.
pub fn run_with_token(config: RunConfig, cancel: CancelToken) -> Result<RunSummary> {
    config.validate()?;
    let config = Arc::new(config);

    // capacity = worker count: the designed back-pressure. The crawl can be
    // at most `parallelism` sealed buckets ahead of the pool.
    let (bucket_tx, bucket_rx) = bounded(config.parallelism);
    let (event_tx, event_rx) = events::event_channel(config.parallelism);

    let crawler = {
        let config = Arc::clone(&config);
        let events = event_tx.clone();
        let cancel = cancel.clone();
        thread::Builder::new()
            .name("convoy-crawl".to_string())
            .spawn(move || crawl::crawl_and_partition(&config, bucket_tx, events, &cancel))?
    };

    let workers: Vec<_> = (0..config.parallelism)
        .map(|id| {
            let context = WorkerContext {
                id,
                config: Arc::clone(&config),
                buckets: bucket_rx.clone(),
                events: event_tx.clone(),
                cancel: cancel.clone(),
            };
            thread::Builder::new()
                .name(format!("convoy-worker-{id}"))
                .spawn(move || worker::run_worker(context))
        })
        .collect::<std::io::Result<Vec<_>>>()?;

    // the monitor stops when every sender is gone; keep none on this thread
    drop(bucket_rx);
    drop(event_tx);

    let summary = Monitor::new(event_rx, cancel.clone(), &config).run();

    let totals = crawler
        .join()
        .map_err(|_| ConvoyError::Internal("crawler thread panicked".to_string()))?;
    debug!(
        "crawl accounted {} entries in {} buckets",
        totals.entries, totals.buckets
    );
    for handle in workers {
        handle
            .join()
            .map_err(|_| ConvoyError::Internal("worker thread panicked".to_string()))?;
    }

    Ok(summary)
}
