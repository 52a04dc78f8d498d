// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A single grub-bhyve booted VM and its lifecycle.

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, OnceLock};

use thiserror::Error;

use crate::boot_files::{self, BootFilesError, BootPaths};
use crate::console::{self, ConsoleError, ConsoleRetry};
use crate::launch::{self, Completion, LaunchError};

/// How the guest is booted.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum BootMethod {
    /// Load the kernel via grub-bhyve using a generated device map and GRUB
    /// configuration.
    #[default]
    Grub,
}

/// Everything needed to describe a VM before it is booted.
#[derive(Clone, Debug)]
pub struct InstanceParams {
    /// Name given to the bootloader to identify the VM.
    pub name: String,
    /// Directory holding the console device and (usually) the boot
    /// artifacts.
    pub state_dir: PathBuf,
    pub device_map_path: PathBuf,
    pub grub_cfg_path: PathBuf,
    pub disk_path: PathBuf,
    pub iso_path: PathBuf,
    pub boot: BootMethod,
    /// Bootloader executable.
    pub bootloader: PathBuf,
}

/// How the bootloader process ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Exit {
    Status(ExitStatus),
    WaitFailed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    Created,
    BootFilesReady,
    Launched { pid: u32 },
    Exited { pid: u32, exit: Exit },
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    BootFiles(#[from] BootFilesError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("VM {name} already launched as pid {pid}")]
    AlreadyLaunched { name: String, pid: u32 },
}

#[derive(Copy, Clone, Debug)]
enum Phase {
    Created,
    BootFilesReady,
    Launched { pid: u32 },
}

/// A VM booted by an external bootloader process.
///
/// The instance moves one way through its lifecycle: once launched it cannot
/// be started again, and a fresh `Instance` is needed to boot anew.
pub struct Instance {
    params: InstanceParams,
    phase: Phase,
    exit: Arc<OnceLock<Exit>>,
    log: slog::Logger,
}

impl Instance {
    pub fn new(params: InstanceParams, log: &slog::Logger) -> Self {
        let log = log.new(slog::o!("vm" => params.name.clone()));
        Self {
            params,
            phase: Phase::Created,
            exit: Arc::new(OnceLock::new()),
            log,
        }
    }

    pub fn params(&self) -> &InstanceParams {
        &self.params
    }

    pub fn state(&self) -> State {
        match self.phase {
            Phase::Created => State::Created,
            Phase::BootFilesReady => State::BootFilesReady,
            Phase::Launched { pid } => match self.exit.get() {
                Some(exit) => State::Exited { pid, exit: *exit },
                None => State::Launched { pid },
            },
        }
    }

    /// Pid of the bootloader, once it has been launched.
    pub fn pid(&self) -> Option<u32> {
        match self.phase {
            Phase::Launched { pid } => Some(pid),
            _ => None,
        }
    }

    /// Generate boot artifacts and launch the bootloader.
    ///
    /// Returns as soon as the process has been started. Its exit is reported
    /// through the returned [`Completion`]. Must be called from within a
    /// tokio runtime.
    pub fn start(&mut self) -> Result<Completion, StartError> {
        if let Phase::Launched { pid } = self.phase {
            return Err(StartError::AlreadyLaunched {
                name: self.params.name.clone(),
                pid,
            });
        }

        match self.params.boot {
            BootMethod::Grub => {
                self.ensure_boot_files()?;
                self.boot_grub()
            }
        }
    }

    /// Write the device map and GRUB configuration if they are not present.
    pub fn ensure_boot_files(&mut self) -> Result<(), BootFilesError> {
        let p = &self.params;
        boot_files::ensure_boot_files(
            &BootPaths {
                device_map: &p.device_map_path,
                grub_config: &p.grub_cfg_path,
                disk: &p.disk_path,
                iso: &p.iso_path,
            },
            &self.log,
        )?;
        if let Phase::Created = self.phase {
            self.phase = Phase::BootFilesReady;
        }
        Ok(())
    }

    fn boot_grub(&mut self) -> Result<Completion, StartError> {
        let p = &self.params;
        let mut cmd = launch::bootloader_command(
            &p.bootloader,
            &p.device_map_path,
            &p.grub_cfg_path,
            &p.name,
        );
        let (child, pid) = launch::launch(&mut cmd, &self.log)?;
        self.phase = Phase::Launched { pid };

        let exit = Arc::clone(&self.exit);
        let log = self.log.new(slog::o!("pid" => pid));
        Ok(launch::watch(child, log, move |res| {
            let _ = exit.set(match res {
                Ok(status) => Exit::Status(*status),
                Err(_) => Exit::WaitFailed,
            });
        }))
    }

    /// Deliver `sig` to the running bootloader.
    pub fn signal(&self, sig: libc::c_int) -> std::io::Result<()> {
        use std::io::{Error, ErrorKind};

        let pid = match self.state() {
            State::Launched { pid } => pid,
            State::Exited { pid, .. } => {
                return Err(Error::new(
                    ErrorKind::NotFound,
                    format!("bootloader (pid {pid}) has already exited"),
                ));
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::NotConnected,
                    "bootloader has not been launched",
                ));
            }
        };
        slog::info!(self.log, "signalling bootloader";
            "pid" => pid, "signal" => sig);
        let r = unsafe { libc::kill(pid as libc::pid_t, sig) };
        if r == -1 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Open the VM's console, retrying until it appears per `retry`.
    pub async fn open_console(
        &self,
        retry: &ConsoleRetry,
    ) -> Result<File, ConsoleError> {
        console::open_console(&self.params.state_dir, retry, &self.log).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::ErrorKind;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    /// Write an executable script standing in for grub-bhyve.
    fn fake_bootloader(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("grub-bhyve");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .unwrap();
        path
    }

    fn params(dir: &Path, bootloader: PathBuf) -> InstanceParams {
        InstanceParams {
            name: "boot2docker".to_string(),
            state_dir: dir.to_path_buf(),
            device_map_path: dir.join("device.map"),
            grub_cfg_path: dir.join("grub.cfg"),
            disk_path: dir.join("disk.img"),
            iso_path: dir.join("boot2docker.iso"),
            boot: BootMethod::Grub,
            bootloader,
        }
    }

    #[tokio::test]
    async fn start_runs_to_exit() {
        let dir = tempfile::tempdir().unwrap();
        // Record the arguments to check what the bootloader was handed
        let loader = fake_bootloader(
            dir.path(),
            &format!(
                "echo \"$@\" > {}\nsleep 0.3\nexit 7",
                dir.path().join("argv").display()
            ),
        );
        let mut inst =
            Instance::new(params(dir.path(), loader), &test_logger());
        assert_eq!(inst.state(), State::Created);

        let mut done = inst.start().unwrap();
        let pid = inst.pid().unwrap();
        assert_eq!(inst.state(), State::Launched { pid });
        assert!(done.try_result().is_none());

        assert!(dir.path().join("device.map").exists());
        assert!(dir.path().join("grub.cfg").exists());

        let status = done.await.unwrap();
        assert_eq!(status.code(), Some(7));
        assert_eq!(
            inst.state(),
            State::Exited { pid, exit: Exit::Status(status) }
        );

        let argv = std::fs::read_to_string(dir.path().join("argv")).unwrap();
        assert_eq!(
            argv.trim_end(),
            format!(
                "-m {} -g {} -M 1024M boot2docker",
                dir.path().join("device.map").display(),
                dir.path().join("grub.cfg").display()
            )
        );

        // No restart in place
        assert!(matches!(
            inst.start(),
            Err(StartError::AlreadyLaunched { pid: p, .. }) if p == pid
        ));
        assert_eq!(
            inst.signal(libc::SIGTERM).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn missing_bootloader() {
        let dir = tempfile::tempdir().unwrap();
        let mut inst = Instance::new(
            params(dir.path(), dir.path().join("no-such-grub-bhyve")),
            &test_logger(),
        );

        match inst.start() {
            Err(StartError::Launch(e)) => {
                assert_eq!(e.source.kind(), ErrorKind::NotFound)
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(inst.pid(), None);
        assert_eq!(inst.state(), State::BootFilesReady);
    }

    #[tokio::test]
    async fn boot_file_failure_stops_launch() {
        let dir = tempfile::tempdir().unwrap();
        let loader = fake_bootloader(dir.path(), "exit 0");
        let mut p = params(dir.path(), loader);
        p.grub_cfg_path = dir.path().join("nope").join("grub.cfg");
        let mut inst = Instance::new(p, &test_logger());

        assert!(matches!(inst.start(), Err(StartError::BootFiles(_))));
        assert_eq!(inst.state(), State::Created);
        assert_eq!(inst.pid(), None);
    }

    #[tokio::test]
    async fn signal_terminates_bootloader() {
        let dir = tempfile::tempdir().unwrap();
        let loader = fake_bootloader(dir.path(), "exec sleep 30");
        let mut inst =
            Instance::new(params(dir.path(), loader), &test_logger());

        assert_eq!(
            inst.signal(libc::SIGTERM).unwrap_err().kind(),
            ErrorKind::NotConnected
        );

        let done = inst.start().unwrap();
        inst.signal(libc::SIGTERM).unwrap();

        let status = tokio::time::timeout(Duration::from_secs(10), done)
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(matches!(inst.state(), State::Exited { .. }));
    }
}
