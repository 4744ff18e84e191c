/*!
 * Cooperative cancellation and child reaping
 *
 * One token is shared by every component. The crawler stops emitting, workers
 * stop dequeuing and terminate their children, and the monitor records the
 * reason. Cancellation is single-shot and irreversible; the first reason
 * wins.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{ConvoyError, Result};

/// Why the run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// SIGINT or SIGTERM from the user
    Signal,
    /// First failed bucket with keep-going off, or an unlaunchable rsync
    Failure,
}

const REASON_NONE: u8 = 0;
const REASON_SIGNAL: u8 = 1;
const REASON_FAILURE: u8 = 2;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    reason: AtomicU8,
    /// bucket id -> live child pid, so signal escalation can reach every child
    children: Mutex<HashMap<u64, u32>>,
}

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the flag. Only the first call records its reason.
    pub fn cancel(&self, reason: CancelReason) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            let code = match reason {
                CancelReason::Signal => REASON_SIGNAL,
                CancelReason::Failure => REASON_FAILURE,
            };
            self.inner.reason.store(code, Ordering::SeqCst);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        match self.inner.reason.load(Ordering::SeqCst) {
            REASON_SIGNAL => Some(CancelReason::Signal),
            REASON_FAILURE => Some(CancelReason::Failure),
            _ => None,
        }
    }

    pub fn register_child(&self, bucket_id: u64, pid: u32) {
        self.inner.children.lock().unwrap().insert(bucket_id, pid);
    }

    pub fn unregister_child(&self, bucket_id: u64) {
        self.inner.children.lock().unwrap().remove(&bucket_id);
    }

    /// SIGKILL every registered child. Used by the second-interrupt
    /// escalation path; normal cancellation goes through the workers'
    /// SIGTERM-then-grace discipline instead.
    pub fn kill_all_children(&self) {
        let children = self.inner.children.lock().unwrap();
        for pid in children.values() {
            send_sigkill(*pid);
        }
    }
}

#[cfg(unix)]
pub fn send_sigterm(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(unix)]
pub fn send_sigkill(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn send_sigterm(_pid: u32) {}

#[cfg(not(unix))]
pub fn send_sigkill(_pid: u32) {}

/// Window in which a second interrupt escalates to SIGKILL-everything.
const ESCALATION_WINDOW: Duration = Duration::from_secs(2);

/// Hook SIGINT/SIGTERM to the token. First signal: cooperative cancel.
/// Second within two seconds: kill every registered child and exit 130.
/// May only be installed once per process, so this lives in the binary
/// path, not in `core::run`.
pub fn install_signal_handlers(token: &CancelToken) -> Result<()> {
    let token = token.clone();
    let mut last_signal: Option<Instant> = None;

    ctrlc::set_handler(move || {
        let now = Instant::now();
        if let Some(previous) = last_signal {
            if now.duration_since(previous) <= ESCALATION_WINDOW {
                token.kill_all_children();
                std::process::exit(130);
            }
        }
        last_signal = Some(now);

        if !token.is_cancelled() {
            eprintln!(
                "convoy: cancelling, waiting for running rsync processes \
                 (interrupt again within 2s to kill them)"
            );
        }
        token.cancel(CancelReason::Signal);
    })
    .map_err(|err| ConvoyError::Internal(format!("failed to install signal handler: {err}")))
}
