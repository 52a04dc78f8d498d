// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Launching the bootloader process and watching for its exit.

use std::future::Future;
use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};

use tokio::process::{Child, Command};
use tokio::sync::oneshot;

/// Guest memory handed to the bootloader.
pub const BOOT_MEMORY: &str = "1024M";

/// How the bootloader process ended, as observed by the watcher.
pub type ExitResult = std::io::Result<ExitStatus>;

#[derive(Debug, thiserror::Error)]
#[error("failed to launch {}", .program.display())]
pub struct LaunchError {
    pub program: PathBuf,
    #[source]
    pub source: Error,
}

/// Build the grub-bhyve invocation for a VM.
///
/// The child inherits our environment and standard streams, so that the
/// GRUB menu is usable from the controlling terminal.
pub fn bootloader_command(
    bootloader: &Path,
    device_map: &Path,
    grub_config: &Path,
    vm_name: &str,
) -> Command {
    let mut cmd = Command::new(bootloader);
    cmd.arg("-m")
        .arg(device_map)
        .arg("-g")
        .arg(grub_config)
        .arg("-M")
        .arg(BOOT_MEMORY)
        .arg(vm_name)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    cmd
}

/// Start `cmd`, returning the child and its pid.
///
/// Must be called from within a tokio runtime.
pub fn launch(
    cmd: &mut Command,
    log: &slog::Logger,
) -> Result<(Child, u32), LaunchError> {
    let program = PathBuf::from(cmd.as_std().get_program());
    let args: Vec<_> = cmd
        .as_std()
        .get_args()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    slog::info!(log, "launching bootloader";
        "program" => %program.display(), "args" => ?args);

    let child = cmd
        .spawn()
        .map_err(|source| LaunchError { program: program.clone(), source })?;
    let pid = child.id().ok_or_else(|| LaunchError {
        program,
        source: Error::new(ErrorKind::Other, "process exited without a pid"),
    })?;

    slog::info!(log, "bootloader running"; "pid" => pid);
    Ok((child, pid))
}

/// Spawn a task which waits for `child` to exit and delivers the result
/// through the returned [`Completion`].
///
/// `on_exit` runs on the watcher task after the process has been reaped and
/// before the result is made available to the receiver.
pub fn watch<F>(mut child: Child, log: slog::Logger, on_exit: F) -> Completion
where
    F: FnOnce(&ExitResult) + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        slog::debug!(log, "waiting for bootloader to exit");
        let res = child.wait().await;
        match &res {
            Ok(status) => {
                slog::info!(log, "bootloader exited"; "status" => %status)
            }
            Err(e) => {
                slog::error!(log, "failed to wait on bootloader"; "error" => %e)
            }
        }
        on_exit(&res);
        // Nobody may be listening; the result is simply dropped then.
        let _ = tx.send(res);
    });
    Completion(Some(rx))
}

/// Single-value handoff of a bootloader's exit.
///
/// Resolves exactly once, and only after the process has been reaped. Once
/// the result has been handed out, by either [`Completion::try_result`] or
/// awaiting, the handle never yields again.
#[derive(Debug)]
pub struct Completion(Option<oneshot::Receiver<ExitResult>>);
impl Completion {
    /// Check for the result without waiting. `None` while the process is
    /// still running, or if the result was already taken.
    pub fn try_result(&mut self) -> Option<ExitResult> {
        let rx = self.0.as_mut()?;
        let res = match rx.try_recv() {
            Ok(res) => res,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(watcher_gone()),
        };
        self.0 = None;
        Some(res)
    }

    /// Whether the result has already been handed out.
    pub fn is_taken(&self) -> bool {
        self.0.is_none()
    }
}
impl Future for Completion {
    type Output = ExitResult;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let Some(rx) = self.0.as_mut() else {
            return Poll::Pending;
        };
        let res = match Pin::new(rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(res) => res.unwrap_or_else(|_| Err(watcher_gone())),
        };
        self.0 = None;
        Poll::Ready(res)
    }
}

fn watcher_gone() -> Error {
    Error::new(
        ErrorKind::BrokenPipe,
        "exit watcher terminated without a result",
    )
}
