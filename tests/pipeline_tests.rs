/*!
 * End-to-end tests for the bucket pipeline
 *
 * Most tests drive the full pipeline against a recording stub in place of
 * rsync, asserting on the argument vectors and NUL-separated file lists the
 * children actually received. The final test runs the real rsync when one is
 * installed and quietly skips otherwise.
 */

#![cfg(unix)]

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::Result;
use assert_fs::prelude::*;
use predicates::prelude::*;

use convoy::core::cancel::CancelReason;
use convoy::{run, run_with_token, CancelToken, RunConfig};

/// One recorded stub invocation: argv (minus the executable) and raw stdin.
struct Invocation {
    args: Vec<String>,
    stdin: Vec<u8>,
}

impl Invocation {
    /// NUL-separated file list the child was fed.
    fn file_list(&self) -> BTreeSet<String> {
        self.stdin
            .split(|byte| *byte == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect()
    }
}

/// Install a stub "rsync" that records its argv and stdin, then exits with
/// `exit_code` after an optional sleep.
fn write_stub(bin_dir: &Path, log_dir: &Path, exit_code: i32, sleep_secs: u32) -> PathBuf {
    let path = bin_dir.join("fake-rsync");
    let sleep = if sleep_secs > 0 {
        format!("sleep {sleep_secs}\n")
    } else {
        String::new()
    };
    let script = format!(
        "#!/bin/sh\n\
         log=\"{log}\"\n\
         n=$$\n\
         {{ for a in \"$@\"; do printf '%s\\n' \"$a\"; done; }} > \"$log/$n.args\"\n\
         cat > \"$log/$n.stdin\"\n\
         {sleep}exit {exit_code}\n",
        log = log_dir.display(),
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A stub that ignores everything and sleeps until it is signalled.
fn write_sleepy_stub(bin_dir: &Path, log_dir: &Path) -> PathBuf {
    let path = bin_dir.join("fake-rsync");
    let script = format!(
        "#!/bin/sh\n\
         : > \"{log}/$$.args\"\n\
         exec sleep 600\n",
        log = log_dir.display(),
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn read_invocations(log_dir: &Path) -> Vec<Invocation> {
    let mut invocations = Vec::new();
    for entry in fs::read_dir(log_dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_some_and(|ext| ext == "args") {
            let args = fs::read_to_string(&path)
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect();
            let stdin = fs::read(path.with_extension("stdin")).unwrap_or_default();
            invocations.push(Invocation { args, stdin });
        }
    }
    invocations
}

struct Fixture {
    _temp: assert_fs::TempDir,
    source: PathBuf,
    destination: PathBuf,
    log_dir: PathBuf,
    bin_dir: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = assert_fs::TempDir::new().unwrap();
        let source = temp.child("source").path().to_path_buf();
        let destination = temp.child("dest").path().to_path_buf();
        let log_dir = temp.child("log").path().to_path_buf();
        let bin_dir = temp.child("bin").path().to_path_buf();
        for dir in [&source, &log_dir, &bin_dir] {
            fs::create_dir_all(dir).unwrap();
        }
        Self {
            _temp: temp,
            source,
            destination,
            log_dir,
            bin_dir,
        }
    }

    fn config_with_stub(&self, exit_code: i32, sleep_secs: u32) -> RunConfig {
        let mut config = RunConfig::new(&self.source, &self.destination);
        config.rsync_path = write_stub(&self.bin_dir, &self.log_dir, exit_code, sleep_secs);
        config.parallelism = 2;
        config
    }

    fn write_files(&self, count: usize, size: usize) {
        for index in 0..count {
            fs::write(self.source.join(format!("f{index:04}")), vec![0u8; size]).unwrap();
        }
    }
}

#[test]
fn test_small_tree_single_bucket() -> Result<()> {
    let fixture = Fixture::new();
    fs::write(fixture.source.join("a"), vec![0u8; 10])?;
    fs::write(fixture.source.join("b"), vec![0u8; 20])?;
    fs::write(fixture.source.join("c"), vec![0u8; 30])?;

    let summary = run(fixture.config_with_stub(0, 0))?;

    assert_eq!(summary.buckets_total, 1);
    assert_eq!(summary.buckets_ok, 1);
    assert_eq!(summary.entries, 4); // root dir rides along
    assert_eq!(summary.bytes, 60);
    assert_eq!(summary.exit_code(), 0);

    let invocations = read_invocations(&fixture.log_dir);
    assert_eq!(invocations.len(), 1);
    let inv = &invocations[0];

    assert_eq!(inv.args[0], "-aS");
    assert_eq!(inv.args[1], "--numeric-ids");
    assert!(inv.args.contains(&"--files-from=-".to_string()));
    assert!(inv.args.contains(&"--from0".to_string()));

    let source_arg = &inv.args[inv.args.len() - 2];
    assert!(source_arg.ends_with('/'), "source must carry a trailing slash");
    assert!(source_arg.starts_with(fixture.source.to_str().unwrap()));
    assert_eq!(
        inv.args.last().unwrap(),
        fixture.destination.to_str().unwrap()
    );

    let expected: BTreeSet<String> = [".", "a", "b", "c"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(inv.file_list(), expected);
    Ok(())
}

#[test]
fn test_entry_count_split() -> Result<()> {
    let fixture = Fixture::new();
    fixture.write_files(2500, 1);

    let mut config = fixture.config_with_stub(0, 0);
    config.entries_per_bucket = 1000;
    config.parallelism = 4;

    let summary = run(config)?;
    assert_eq!(summary.buckets_total, 3);
    assert_eq!(summary.buckets_ok, 3);
    assert_eq!(summary.entries, 2501);
    assert_eq!(summary.exit_code(), 0);

    let invocations = read_invocations(&fixture.log_dir);
    assert_eq!(invocations.len(), 3);
    let total_fed: usize = invocations.iter().map(|inv| inv.file_list().len()).sum();
    assert_eq!(total_fed, 2501);
    Ok(())
}

#[test]
fn test_byte_split() -> Result<()> {
    let fixture = Fixture::new();
    fixture.write_files(5, 400);

    let mut config = fixture.config_with_stub(0, 0);
    config.bytes_per_bucket = 1000;

    let summary = run(config)?;
    assert_eq!(summary.buckets_total, 3);
    assert_eq!(summary.buckets_ok, 3);
    assert_eq!(summary.bytes, 2000);
    Ok(())
}

#[test]
fn test_oversize_file_gets_its_own_bucket() -> Result<()> {
    let fixture = Fixture::new();
    fs::write(fixture.source.join("huge"), vec![0u8; 2000])?;

    let mut config = fixture.config_with_stub(0, 0);
    config.bytes_per_bucket = 1000;

    let summary = run(config)?;
    assert_eq!(summary.buckets_ok, summary.buckets_total);
    assert_eq!(summary.bytes, 2000);
    assert_eq!(summary.exit_code(), 0);

    // the oversized file travels alone
    let invocations = read_invocations(&fixture.log_dir);
    let singleton = invocations
        .iter()
        .find(|inv| inv.file_list().contains("huge"))
        .unwrap();
    assert_eq!(singleton.file_list().len(), 1);
    Ok(())
}

#[test]
fn test_partial_exit_codes_tolerated() -> Result<()> {
    let fixture = Fixture::new();
    fixture.write_files(3, 10);

    let summary = run(fixture.config_with_stub(24, 0))?;
    assert_eq!(summary.buckets_partial, summary.buckets_total);
    assert_eq!(summary.buckets_failed, 0);
    assert!(summary.cancel_reason.is_none());
    assert_eq!(summary.exit_code(), 0);
    Ok(())
}

#[test]
fn test_first_failure_cancels_and_propagates_code() -> Result<()> {
    let fixture = Fixture::new();
    fixture.write_files(6, 10);

    let mut config = fixture.config_with_stub(12, 1);
    config.entries_per_bucket = 2;
    config.parallelism = 1;
    config.keep_going = false;

    let summary = run(config)?;
    assert!(summary.buckets_failed >= 1);
    assert!(summary.buckets_cancelled >= 1);
    assert_eq!(summary.buckets_ok, 0);
    assert_eq!(summary.cancel_reason, Some(CancelReason::Failure));
    assert_eq!(summary.first_failure_code, Some(12));
    assert_eq!(summary.exit_code(), 12);
    Ok(())
}

#[test]
fn test_keep_going_runs_everything_and_exits_one() -> Result<()> {
    let fixture = Fixture::new();
    fixture.write_files(6, 10);

    let mut config = fixture.config_with_stub(3, 0);
    config.entries_per_bucket = 2;
    config.keep_going = true;

    let summary = run(config)?;
    assert_eq!(summary.buckets_failed, summary.buckets_total);
    assert_eq!(summary.buckets_cancelled, 0);
    assert!(summary.cancel_reason.is_none());
    assert_eq!(summary.exit_code(), 1);

    // every bucket still ran
    let invocations = read_invocations(&fixture.log_dir);
    assert_eq!(invocations.len() as u64, summary.buckets_total);
    Ok(())
}

#[test]
fn test_dry_run_spawns_no_children() -> Result<()> {
    let fixture = Fixture::new();
    fixture.write_files(4, 10);

    let mut config = RunConfig::new(&fixture.source, &fixture.destination);
    config.rsync_path = PathBuf::from("/definitely/not/rsync");
    config.dry_run = true;

    let summary = run(config)?;
    assert!(summary.buckets_total >= 1);
    assert_eq!(summary.buckets_ok, summary.buckets_total);
    assert_eq!(summary.exit_code(), 0);
    assert!(read_invocations(&fixture.log_dir).is_empty());
    Ok(())
}

#[test]
fn test_spawn_failure_on_first_bucket_aborts() -> Result<()> {
    let fixture = Fixture::new();
    fixture.write_files(4, 10);

    let mut config = RunConfig::new(&fixture.source, &fixture.destination);
    config.rsync_path = PathBuf::from("/definitely/not/rsync");
    config.keep_going = true;
    config.parallelism = 1;

    let summary = run(config)?;
    assert!(summary.buckets_failed >= 1);
    assert_eq!(summary.cancel_reason, Some(CancelReason::Failure));
    // spawn failures have no child exit code to propagate
    assert_eq!(summary.exit_code(), 1);
    Ok(())
}

#[test]
fn test_precancelled_token_yields_130() -> Result<()> {
    let fixture = Fixture::new();
    fixture.write_files(4, 10);

    let token = CancelToken::new();
    token.cancel(CancelReason::Signal);

    let summary = run_with_token(fixture.config_with_stub(0, 0), token)?;
    assert_eq!(summary.buckets_total, 0);
    assert_eq!(summary.exit_code(), 130);
    assert!(read_invocations(&fixture.log_dir).is_empty());
    Ok(())
}

#[test]
fn test_cancellation_reaps_sleeping_child() -> Result<()> {
    let fixture = Fixture::new();
    fixture.write_files(2, 10);

    let mut config = RunConfig::new(&fixture.source, &fixture.destination);
    config.rsync_path = write_sleepy_stub(&fixture.bin_dir, &fixture.log_dir);
    config.parallelism = 1;

    let token = CancelToken::new();
    let canceller = {
        let token = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            token.cancel(CancelReason::Signal);
        })
    };

    let started = Instant::now();
    let summary = run_with_token(config, token)?;
    canceller.join().unwrap();

    // SIGTERM, not the 600s sleep, ended the child
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(summary.buckets_cancelled, summary.buckets_total);
    assert_eq!(summary.exit_code(), 130);
    Ok(())
}

#[test]
fn test_empty_source_touches_nothing() -> Result<()> {
    let temp = assert_fs::TempDir::new()?;
    let source = temp.child("source");
    let destination = temp.child("dest");
    source.create_dir_all()?;

    let mut config = RunConfig::new(source.path(), destination.path());
    config.rsync_path = PathBuf::from("/definitely/not/rsync");

    let summary = run(config)?;
    assert_eq!(summary.buckets_total, 0);
    assert_eq!(summary.exit_code(), 0);
    destination.assert(predicate::path::is_dir());
    assert_eq!(fs::read_dir(destination.path())?.count(), 0);
    Ok(())
}

#[test]
fn test_stats_flag_prints_extended_summary() -> Result<()> {
    let fixture = Fixture::new();
    fixture.write_files(3, 100);
    let stub = write_stub(&fixture.bin_dir, &fixture.log_dir, 0, 0);

    let output = Command::new(env!("CARGO_BIN_EXE_convoy"))
        .arg("--stats")
        .arg("--rsync")
        .arg(&stub)
        .arg(&fixture.source)
        .arg(&fixture.destination)
        .output()?;

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("throughput:"), "missing throughput: {stdout}");
    assert!(
        stdout.contains("average bucket:"),
        "missing average bucket: {stdout}"
    );
    assert!(
        stdout.contains("bytes by outcome:"),
        "missing per-outcome bytes: {stdout}"
    );
    // the whole 300 B tree succeeded, so it all lands in the ok column
    assert!(stdout.contains("300 B ok"), "wrong ok tally: {stdout}");
    Ok(())
}

#[test]
fn test_summary_carries_per_outcome_bytes() -> Result<()> {
    let fixture = Fixture::new();
    fixture.write_files(4, 50);

    let mut config = fixture.config_with_stub(24, 0);
    config.stats = true;

    let summary = run(config)?;
    assert_eq!(summary.bytes_partial, 200);
    assert_eq!(summary.bytes_ok, 0);
    assert_eq!(summary.bytes, summary.bytes_partial);
    Ok(())
}

fn rsync_available() -> bool {
    Command::new("rsync")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[test]
fn test_real_rsync_round_trip() -> Result<()> {
    if !rsync_available() {
        eprintln!("rsync not installed, skipping");
        return Ok(());
    }

    let temp = assert_fs::TempDir::new()?;
    let source = temp.child("source");
    source.create_dir_all()?;
    source.child("sub/inner").create_dir_all()?;
    source.child("top.txt").write_str("top level")?;
    source.child("sub/inner/deep.txt").write_str("deep file")?;
    source.child("sub/data.bin").write_binary(&[7u8; 4096])?;
    std::os::unix::fs::symlink("top.txt", source.child("link").path())?;

    let destination = temp.child("dest");
    let mut config = RunConfig::new(source.path(), destination.path());
    config.entries_per_bucket = 3; // force several buckets over one small tree
    config.parallelism = 2;

    let summary = run(config.clone())?;
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.buckets_ok, summary.buckets_total);
    assert!(summary.buckets_total > 1);

    destination
        .child("top.txt")
        .assert(predicate::path::eq_file(source.child("top.txt").path()));
    destination
        .child("sub/inner/deep.txt")
        .assert(predicate::path::eq_file(
            source.child("sub/inner/deep.txt").path(),
        ));
    destination
        .child("sub/data.bin")
        .assert(predicate::path::eq_file(source.child("sub/data.bin").path()));
    let link_target = fs::read_link(destination.child("link").path())?;
    assert_eq!(link_target, PathBuf::from("top.txt"));

    // second pass over an up-to-date destination still succeeds cleanly
    let summary = run(config)?;
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.buckets_ok, summary.buckets_total);
    Ok(())
}
