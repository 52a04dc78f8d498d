// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-facing driver for a boot2docker machine.
//!
//! A host orchestrator sees only the narrow [`Driver`] capability; the
//! machine store layout and the disk image step are handled here.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};

use crate::instance::{BootMethod, Instance, InstanceParams, State};
use crate::launch::Completion;

/// Name of the boot ISO within a machine's state directory.
pub const ISO_FILENAME: &str = "boot2docker.iso";
pub const DEVICE_MAP_FILENAME: &str = "device.map";
pub const GRUB_CFG_FILENAME: &str = "grub.cfg";

/// Lifecycle operations an orchestrator may invoke on a machine.
pub trait Driver {
    /// Check that the environment allows the machine to be run.
    fn preflight_check(&self) -> anyhow::Result<()>;

    /// Prepare the machine's disk image, then start it.
    fn create(&mut self) -> anyhow::Result<Completion>;

    /// Boot the machine. Must be called from within a tokio runtime.
    fn start(&mut self) -> anyhow::Result<Completion>;
}

/// Where a machine's files live within the machine store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreLayout {
    pub state_dir: PathBuf,
    pub device_map: PathBuf,
    pub grub_config: PathBuf,
    pub disk: PathBuf,
    pub iso: PathBuf,
}
impl StoreLayout {
    pub fn new(store_path: &Path, machine_name: &str) -> Self {
        let state_dir = store_path.join("machines").join(machine_name);
        Self {
            device_map: state_dir.join(DEVICE_MAP_FILENAME),
            grub_config: state_dir.join(GRUB_CFG_FILENAME),
            disk: state_dir.join(format!("{machine_name}.img")),
            iso: state_dir.join(ISO_FILENAME),
            state_dir,
        }
    }
}

/// Produces a bootable disk image (and ISO) for a machine before it is first
/// started.
pub trait DiskImageBuilder {
    fn make_disk_image(
        &self,
        source_url: Option<&str>,
        size_mib: u64,
        layout: &StoreLayout,
    ) -> anyhow::Result<()>;
}

/// Creates a sparse raw disk image, leaving any existing image untouched.
///
/// The boot ISO must already be in place; fetching it is left to whoever
/// populates the store.
#[derive(Copy, Clone, Debug, Default)]
pub struct SparseDiskBuilder;

impl DiskImageBuilder for SparseDiskBuilder {
    fn make_disk_image(
        &self,
        source_url: Option<&str>,
        size_mib: u64,
        layout: &StoreLayout,
    ) -> anyhow::Result<()> {
        std::fs::create_dir_all(&layout.state_dir).with_context(|| {
            format!("creating {}", layout.state_dir.display())
        })?;

        if !layout.iso.exists() {
            return Err(match source_url {
                Some(url) => anyhow!(
                    "boot ISO {} is missing; fetch it from {url}",
                    layout.iso.display()
                ),
                None => anyhow!("boot ISO {} is missing", layout.iso.display()),
            });
        }

        let size = size_mib
            .checked_mul(1024 * 1024)
            .ok_or_else(|| anyhow!("disk size {size_mib} MiB is too large"))?;
        let fp = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&layout.disk)
        {
            Ok(fp) => fp,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Ok(())
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("creating {}", layout.disk.display())
                })
            }
        };
        fp.set_len(size).with_context(|| {
            format!("sizing {} to {size_mib} MiB", layout.disk.display())
        })?;
        Ok(())
    }
}

/// Fails unless running with an effective uid of 0.
pub fn check_privileges() -> anyhow::Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }
    let exe = std::env::current_exe().context("locating own executable")?;
    bail!(privilege_message(&exe))
}

fn privilege_message(exe: &Path) -> String {
    let name = exe.file_name().unwrap_or(exe.as_os_str()).to_string_lossy();
    let path = exe.display();
    format!(
        "{name} needs to run with elevated permissions. \
         Please run the following command, then try again: \
         sudo chown root:wheel {path} && sudo chmod u+s {path}"
    )
}

/// Settings for a [`Boot2DockerDriver`].
#[derive(Clone, Debug)]
pub struct MachineParams {
    pub machine_name: String,
    pub store_path: PathBuf,
    /// Name the VM is known by to the bootloader.
    pub vm_name: String,
    pub boot2docker_url: Option<String>,
    /// Disk size in MiB.
    pub disk_size: u64,
    pub bootloader: PathBuf,
}

/// boot2docker machine booted from ISO with grub-bhyve.
pub struct Boot2DockerDriver {
    params: MachineParams,
    layout: StoreLayout,
    disk_builder: Box<dyn DiskImageBuilder + Send + Sync>,
    instance: Option<Instance>,
    log: slog::Logger,
}

impl Boot2DockerDriver {
    pub fn new(
        params: MachineParams,
        disk_builder: Box<dyn DiskImageBuilder + Send + Sync>,
        log: &slog::Logger,
    ) -> Self {
        let layout = StoreLayout::new(&params.store_path, &params.machine_name);
        let log = log.new(slog::o!("machine" => params.machine_name.clone()));
        Self { params, layout, disk_builder, instance: None, log }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// The most recently started VM, if any.
    pub fn instance(&self) -> Option<&Instance> {
        self.instance.as_ref()
    }

    /// Generate the device map and GRUB configuration without booting.
    pub fn prepare_boot_files(&self) -> anyhow::Result<()> {
        let mut instance = Instance::new(self.instance_params(), &self.log);
        instance.ensure_boot_files().context("writing boot files")
    }

    fn instance_params(&self) -> InstanceParams {
        InstanceParams {
            name: self.params.vm_name.clone(),
            state_dir: self.layout.state_dir.clone(),
            device_map_path: self.layout.device_map.clone(),
            grub_cfg_path: self.layout.grub_config.clone(),
            disk_path: self.layout.disk.clone(),
            iso_path: self.layout.iso.clone(),
            boot: BootMethod::Grub,
            bootloader: self.params.bootloader.clone(),
        }
    }
}

impl Driver for Boot2DockerDriver {
    fn preflight_check(&self) -> anyhow::Result<()> {
        check_privileges()
    }

    fn create(&mut self) -> anyhow::Result<Completion> {
        slog::info!(self.log, "creating disk image";
            "path" => %self.layout.disk.display(),
            "size_mib" => self.params.disk_size);
        self.disk_builder
            .make_disk_image(
                self.params.boot2docker_url.as_deref(),
                self.params.disk_size,
                &self.layout,
            )
            .context("making disk image")?;

        self.start()
    }

    fn start(&mut self) -> anyhow::Result<Completion> {
        if let Some(State::Launched { pid }) =
            self.instance.as_ref().map(Instance::state)
        {
            bail!(
                "machine {} is already running (pid {pid})",
                self.params.machine_name
            );
        }

        let mut instance = Instance::new(self.instance_params(), &self.log);
        let res = instance.start();
        self.instance = Some(instance);
        Ok(res?)
    }
}
