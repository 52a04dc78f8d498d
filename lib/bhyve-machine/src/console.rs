// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Acquisition of the VM's serial console device.
//!
//! The hypervisor creates `<state_dir>/tty` only once the guest has gotten far
//! enough along in boot, so opening it is retried at a fixed interval. By
//! default there is no limit on how long that takes.

use std::fs::{File, OpenOptions};
use std::io::{Error, ErrorKind};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::termios;

/// Name of the console device within a VM's state directory.
pub const CONSOLE_DEVICE: &str = "tty";

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("cannot open console {} ({attempts} attempts)", .path.display())]
    Open {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: Error,
    },

    #[error("cannot configure console {}", .path.display())]
    Configure {
        path: PathBuf,
        #[source]
        source: Error,
    },
}

/// When to give up on opening the console device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsoleRetry {
    /// Delay between open attempts.
    pub interval: Duration,

    /// Total number of open attempts before giving up.
    pub max_attempts: Option<u32>,

    /// Time after the first attempt past which no further attempt is made.
    pub timeout: Option<Duration>,

    /// Give up at once if the device exists but we are not permitted to
    /// open it.
    pub permission_denied_is_fatal: bool,
}
impl Default for ConsoleRetry {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10),
            max_attempts: None,
            timeout: None,
            permission_denied_is_fatal: true,
        }
    }
}

/// Fixed-interval schedule, bounded by [`ConsoleRetry`] limits if any.
struct Schedule {
    interval: Duration,
    max_attempts: Option<u32>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    failed: u32,
}
impl Schedule {
    fn new(retry: &ConsoleRetry) -> Self {
        let mut sched = Self {
            interval: retry.interval,
            max_attempts: retry.max_attempts,
            timeout: retry.timeout,
            deadline: None,
            failed: 0,
        };
        backoff::backoff::Backoff::reset(&mut sched);
        sched
    }
}
impl backoff::backoff::Backoff for Schedule {
    fn reset(&mut self) {
        self.failed = 0;
        self.deadline = self.timeout.map(|t| Instant::now() + t);
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.failed = self.failed.saturating_add(1);
        if matches!(self.max_attempts, Some(max) if self.failed >= max) {
            return None;
        }
        if matches!(self.deadline, Some(dl) if Instant::now() >= dl) {
            return None;
        }
        Some(self.interval)
    }
}

/// Open the console device at `<state_dir>/tty` and put it in raw mode.
pub async fn open_console(
    state_dir: &Path,
    retry: &ConsoleRetry,
    log: &slog::Logger,
) -> Result<File, ConsoleError> {
    let path = state_dir.join(CONSOLE_DEVICE);
    acquire_with(&path, retry, log, |p| {
        OpenOptions::new().read(true).custom_flags(libc::O_NOCTTY).open(p)
    })
    .await
}

/// Acquire a console using `open` for each attempt.
///
/// Once opened, the device has its NL to CR-NL output translation removed and
/// is then switched into raw mode.
pub async fn acquire_with<F>(
    path: &Path,
    retry: &ConsoleRetry,
    log: &slog::Logger,
    mut open: F,
) -> Result<File, ConsoleError>
where
    F: FnMut(&Path) -> std::io::Result<File>,
{
    let attempts = AtomicU32::new(0);
    let op = || {
        attempts.fetch_add(1, Ordering::Relaxed);
        let res = open(path).map_err(|e| {
            if retry.permission_denied_is_fatal
                && e.kind() == ErrorKind::PermissionDenied
            {
                backoff::Error::permanent(e)
            } else {
                backoff::Error::transient(e)
            }
        });
        std::future::ready(res)
    };
    let notify = |e: Error, wait: Duration| {
        slog::debug!(log, "console not ready, retrying";
            "path" => %path.display(),
            "attempt" => attempts.load(Ordering::Relaxed),
            "error" => %e,
            "wait" => ?wait);
    };

    let res =
        backoff::future::retry_notify(Schedule::new(retry), op, notify).await;
    let attempts = attempts.into_inner();
    let fp = res.map_err(|source| ConsoleError::Open {
        path: path.to_path_buf(),
        attempts,
        source,
    })?;

    let configure = |source| ConsoleError::Configure {
        path: path.to_path_buf(),
        source,
    };
    termios::sane(&fp).map_err(configure)?;
    termios::raw(&fp).map_err(configure)?;

    slog::info!(log, "acquired console";
        "path" => %path.display(), "attempts" => attempts);
    Ok(fp)
}
