/*!
 * Worker pool: one rsync child per bucket
 *
 * Workers are long-lived consumers of the bounded bucket channel and exit
 * when it closes and drains. Each bucket becomes exactly one child process
 * fed its file list over stdin, and exactly one published result.
 */

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use crate::config::{RunConfig, BASE_RSYNC_ARGS};
use crate::core::bucket::Bucket;
use crate::core::cancel::{self, CancelToken};
use crate::core::events::{BucketResult, Event, Outcome};

/// Lines of child stderr retained per bucket, oldest dropped first.
pub const STDERR_TAIL_LINES: usize = 64;

/// Child poll interval while waiting for exit.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// How long a SIGTERMed child may linger before SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// File-list entries written between cancellation checks.
const FEED_CHECK_INTERVAL: usize = 64;

pub struct WorkerContext {
    pub id: usize,
    pub config: Arc<RunConfig>,
    pub buckets: Receiver<Bucket>,
    pub events: Sender<Event>,
    pub cancel: CancelToken,
}

/// Consume buckets until the channel closes. After cancellation the worker
/// keeps draining, publishing cancelled results without spawning, so the
/// monitor still sees one result per sealed bucket.
pub fn run_worker(ctx: WorkerContext) {
    while let Ok(bucket) = ctx.buckets.recv() {
        let result = if ctx.cancel.is_cancelled() {
            cancelled_result(&bucket)
        } else if ctx.config.dry_run {
            plan_bucket(&ctx, &bucket)
        } else {
            let _ = ctx.events.send(Event::BucketStarted {
                id: bucket.id,
                worker: ctx.id,
            });
            sync_bucket(&ctx, &bucket)
        };
        let _ = ctx.events.send(Event::BucketFinished(result));
    }
    debug!("worker {} exiting", ctx.id);
    let _ = ctx.events.send(Event::WorkerExited { worker: ctx.id });
}

/// Spawn rsync for one bucket, feed it the file list, and wait it out.
fn sync_bucket(ctx: &WorkerContext, bucket: &Bucket) -> BucketResult {
    let config = &ctx.config;
    let started = Instant::now();

    let mut command = Command::new(&config.rsync_path);
    command
        .args(rsync_argv(config))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(
                "bucket {}: failed to spawn {}: {err}",
                bucket.id,
                config.rsync_path.display()
            );
            return BucketResult {
                bucket_id: bucket.id,
                outcome: Outcome::Failed,
                exit_code: None,
                elapsed: started.elapsed(),
                bytes: bucket.bytes,
                entries: bucket.count(),
                first_path: bucket.first_path().to_path_buf(),
                stderr_tail: Vec::new(),
                failure: Some(format!(
                    "failed to spawn {}: {err}",
                    config.rsync_path.display()
                )),
                spawn_failed: true,
            };
        }
    };

    let pid = child.id();
    ctx.cancel.register_child(bucket.id, pid);
    debug!(
        "bucket {}: spawned rsync pid {pid} ({} entries, {} bytes)",
        bucket.id,
        bucket.count(),
        bucket.bytes
    );

    // Readers drain the pipes while we feed stdin, so neither side can fill
    // a pipe buffer and deadlock the child.
    let tail_reader = child.stderr.take().map(spawn_stderr_tail);
    let stdout_logger = child
        .stdout
        .take()
        .map(|stdout| spawn_stdout_logger(bucket.id, stdout));

    if let Some(stdin) = child.stdin.take() {
        if let Err(err) = feed_file_list(stdin, bucket, &ctx.cancel) {
            // EPIPE is the child closing early; its exit status tells the story
            if err.kind() != io::ErrorKind::BrokenPipe {
                warn!("bucket {}: file-list feed failed: {err}", bucket.id);
            }
        }
    }

    let status = wait_with_cancel(&mut child, &ctx.cancel);
    ctx.cancel.unregister_child(bucket.id);

    let stderr_tail = tail_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    if let Some(handle) = stdout_logger {
        let _ = handle.join();
    }

    let (outcome, exit_code, failure) = match status {
        Ok(status) => classify(status, ctx.cancel.is_cancelled()),
        Err(err) => (
            Outcome::Failed,
            None,
            Some(format!("could not wait for rsync: {err}")),
        ),
    };

    BucketResult {
        bucket_id: bucket.id,
        outcome,
        exit_code,
        elapsed: started.elapsed(),
        bytes: bucket.bytes,
        entries: bucket.count(),
        first_path: bucket.first_path().to_path_buf(),
        stderr_tail,
        failure,
        spawn_failed: false,
    }
}

/// Dry run: report the command instead of executing it.
fn plan_bucket(ctx: &WorkerContext, bucket: &Bucket) -> BucketResult {
    let _ = ctx.events.send(Event::BucketPlanned {
        id: bucket.id,
        command: rsync_command_display(&ctx.config),
    });
    BucketResult {
        bucket_id: bucket.id,
        outcome: Outcome::Ok,
        exit_code: Some(0),
        elapsed: Duration::ZERO,
        bytes: bucket.bytes,
        entries: bucket.count(),
        first_path: bucket.first_path().to_path_buf(),
        stderr_tail: Vec::new(),
        failure: None,
        spawn_failed: false,
    }
}

fn cancelled_result(bucket: &Bucket) -> BucketResult {
    BucketResult {
        bucket_id: bucket.id,
        outcome: Outcome::Cancelled,
        exit_code: None,
        elapsed: Duration::ZERO,
        bytes: bucket.bytes,
        entries: bucket.count(),
        first_path: bucket.first_path().to_path_buf(),
        stderr_tail: Vec::new(),
        failure: None,
        spawn_failed: false,
    }
}

/// The argument vector every child receives, minus the executable itself.
/// `--files-from=-` + `--from0` pair with the NUL-separated stdin feed; the
/// trailing slash on the source makes rsync copy contents rather than nest
/// the source directory, which is what lets bucketed runs compose into one
/// destination tree.
pub fn rsync_argv(config: &RunConfig) -> Vec<OsString> {
    let mut argv: Vec<OsString> = BASE_RSYNC_ARGS.iter().map(OsString::from).collect();
    argv.extend(config.extra_rsync_args.iter().map(OsString::from));
    argv.push(OsString::from("--files-from=-"));
    argv.push(OsString::from("--from0"));
    argv.push(source_with_slash(&config.source));
    argv.push(config.destination.as_os_str().to_os_string());
    argv
}

/// One-line rendition for dry runs and debug logging.
pub fn rsync_command_display(config: &RunConfig) -> String {
    let mut parts = vec![config.rsync_path.to_string_lossy().into_owned()];
    parts.extend(
        rsync_argv(config)
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned()),
    );
    parts.join(" ")
}

fn source_with_slash(source: &Path) -> OsString {
    let mut os = source.as_os_str().to_os_string();
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        if os.as_bytes().last() != Some(&b'/') {
            os.push("/");
        }
    }
    #[cfg(not(unix))]
    {
        if !os.to_string_lossy().ends_with(['/', '\\']) {
            os.push("/");
        }
    }
    os
}

/// Write the bucket's relative paths, NUL-separated, as raw bytes. Checks
/// for cancellation every few dozen entries so a cancelled run is not stuck
/// behind a slow pipe.
fn feed_file_list(stdin: ChildStdin, bucket: &Bucket, cancel: &CancelToken) -> io::Result<()> {
    let mut writer = BufWriter::new(stdin);
    for (index, entry) in bucket.entries.iter().enumerate() {
        if index % FEED_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            break;
        }
        writer.write_all(path_bytes(&entry.path).as_ref())?;
        writer.write_all(b"\0")?;
    }
    writer.flush()
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> std::borrow::Cow<'_, [u8]> {
    use std::os::unix::ffi::OsStrExt;
    std::borrow::Cow::Borrowed(path.as_os_str().as_bytes())
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> std::borrow::Cow<'_, [u8]> {
    std::borrow::Cow::Owned(path.to_string_lossy().into_owned().into_bytes())
}

/// Poll the child until it exits. Once cancellation is observed the child
/// gets SIGTERM, a grace period, then SIGKILL; either way we keep polling
/// until it is reaped so no zombie outlives the worker.
fn wait_with_cancel(child: &mut Child, cancel: &CancelToken) -> io::Result<ExitStatus> {
    let mut termed_at: Option<Instant> = None;
    let mut killed = false;

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }

        if cancel.is_cancelled() {
            match termed_at {
                None => {
                    debug!("terminating rsync pid {}", child.id());
                    cancel::send_sigterm(child.id());
                    termed_at = Some(Instant::now());
                }
                Some(at) if !killed && at.elapsed() >= TERM_GRACE => {
                    warn!("rsync pid {} ignored SIGTERM, killing", child.id());
                    cancel::send_sigkill(child.id());
                    killed = true;
                }
                _ => {}
            }
        }

        thread::sleep(WAIT_POLL);
    }
}

/// Collect the last lines of the child's stderr without ever holding more
/// than the tail in memory.
fn spawn_stderr_tail(stderr: ChildStderr) -> JoinHandle<Vec<String>> {
    thread::spawn(move || {
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        for line in BufReader::new(stderr).lines() {
            let Ok(line) = line else { break };
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into()
    })
}

/// rsync is quiet on stdout unless the user asked for verbosity through
/// `--rsync-options`; whatever shows up goes to the diagnostic log, never to
/// the monitor's stdout.
fn spawn_stdout_logger(bucket_id: u64, stdout: ChildStdout) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            debug!("bucket {bucket_id} rsync: {line}");
        }
    })
}

/// Map an exit status onto the bucket outcome taxonomy. Exit 23/24 are
/// rsync's "partial transfer" / "files vanished" codes; a live source tree
/// produces them routinely, so they warn instead of fail.
fn classify(status: ExitStatus, cancelled: bool) -> (Outcome, Option<i32>, Option<String>) {
    match status.code() {
        Some(0) => (Outcome::Ok, Some(0), None),
        Some(code @ (23 | 24)) => (Outcome::Partial, Some(code), None),
        Some(code) => (Outcome::Failed, Some(code), None),
        None => {
            let description = signal_description(&status);
            if cancelled {
                (Outcome::Cancelled, None, Some(description))
            } else {
                (Outcome::Failed, None, Some(description))
            }
        }
    }
}

#[cfg(unix)]
fn signal_description(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("terminated by signal {signal}"),
        None => "terminated without exit code".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_description(_status: &ExitStatus) -> String {
    "terminated without exit code".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> RunConfig {
        let mut config = RunConfig::new("/data/src", "/data/dst");
        config.extra_rsync_args = vec!["--bwlimit=5000".to_string()];
        config
    }

    #[test]
    fn test_argv_shape_and_order() {
        let argv = rsync_argv(&config());
        let argv: Vec<String> = argv
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            argv,
            vec![
                "-aS",
                "--numeric-ids",
                "--bwlimit=5000",
                "--files-from=-",
                "--from0",
                "/data/src/",
                "/data/dst",
            ]
        );
    }

    #[test]
    fn test_source_slash_not_doubled() {
        assert_eq!(
            source_with_slash(Path::new("/data/src/")),
            OsString::from("/data/src/")
        );
        assert_eq!(
            source_with_slash(Path::new("/data/src")),
            OsString::from("/data/src/")
        );
    }

    #[test]
    fn test_command_display_names_executable() {
        let mut config = config();
        config.rsync_path = PathBuf::from("/opt/rsync");
        let display = rsync_command_display(&config);
        assert!(display.starts_with("/opt/rsync -aS --numeric-ids"));
        assert!(display.ends_with("/data/src/ /data/dst"));
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_exit_codes() {
        use std::os::unix::process::ExitStatusExt;

        let ok = ExitStatus::from_raw(0);
        assert_eq!(classify(ok, false).0, Outcome::Ok);

        let partial = ExitStatus::from_raw(23 << 8);
        assert_eq!(classify(partial, false).0, Outcome::Partial);
        let vanished = ExitStatus::from_raw(24 << 8);
        assert_eq!(classify(vanished, false).0, Outcome::Partial);

        let failed = ExitStatus::from_raw(12 << 8);
        let (outcome, code, _) = classify(failed, false);
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(code, Some(12));
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_signal_death() {
        use std::os::unix::process::ExitStatusExt;

        // raw status 15: killed by SIGTERM
        let signalled = ExitStatus::from_raw(15);
        let (outcome, code, message) = classify(signalled, true);
        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(code, None);
        assert!(message.unwrap().contains("signal 15"));

        let (outcome, _, _) = classify(ExitStatus::from_raw(9), false);
        assert_eq!(outcome, Outcome::Failed);
    }

    #[cfg(unix)]
    #[test]
    fn test_path_bytes_are_exact() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let raw: &[u8] = b"dir/na\xffme";
        let path = Path::new(OsStr::from_bytes(raw));
        assert_eq!(path_bytes(path).as_ref(), raw);
    }
}
