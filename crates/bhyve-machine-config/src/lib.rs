// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TOML configuration for a single grub-bhyve booted machine.

use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Location of `grub-bhyve` as installed from FreeBSD ports.
pub const DEFAULT_BOOTLOADER: &str = "/usr/local/sbin/grub-bhyve";

/// Name handed to the bootloader when none is configured.
pub const DEFAULT_VM_NAME: &str = "boot2docker";

/// Size (MiB) of the disk image created for a new machine.
pub const DEFAULT_DISK_SIZE: u64 = 16384;

pub const DEFAULT_CONSOLE_RETRY_MS: u64 = 10;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Config {
    pub machine: Machine,

    #[serde(default)]
    pub console: Console,
}

/// The machine being managed and where its state lives.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Machine {
    /// Machine name, which also names its state directory.
    pub name: String,

    /// Root of the machine store. State for this machine is kept under
    /// `<store_path>/machines/<name>`.
    pub store_path: PathBuf,

    #[serde(default = "default_vm_name")]
    pub vm_name: String,

    /// Source image handed to the disk image builder.
    #[serde(default)]
    pub boot2docker_url: Option<String>,

    /// Disk image size in MiB.
    #[serde(default = "default_disk_size")]
    pub disk_size: u64,

    #[serde(default = "default_bootloader")]
    pub bootloader: PathBuf,
}

/// Console acquisition policy.
///
/// With neither `max_attempts` nor `timeout_ms` set, acquisition retries until
/// the console device can be opened.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Console {
    #[serde(default = "default_console_retry_ms")]
    pub retry_interval_ms: u64,

    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Stop retrying when the device exists but cannot be opened due to
    /// permissions.
    #[serde(default = "default_true")]
    pub permission_denied_is_fatal: bool,
}
impl Default for Console {
    fn default() -> Self {
        Self {
            retry_interval_ms: DEFAULT_CONSOLE_RETRY_MS,
            max_attempts: None,
            timeout_ms: None,
            permission_denied_is_fatal: true,
        }
    }
}

fn default_vm_name() -> String {
    DEFAULT_VM_NAME.to_string()
}
fn default_disk_size() -> u64 {
    DEFAULT_DISK_SIZE
}
fn default_bootloader() -> PathBuf {
    PathBuf::from(DEFAULT_BOOTLOADER)
}
fn default_console_retry_ms() -> u64 {
    DEFAULT_CONSOLE_RETRY_MS
}
fn default_true() -> bool {
    true
}

/// Errors which may be returned when parsing the machine configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}

pub fn parse_str(contents: &str) -> Result<Config, ParseError> {
    let cfg = toml::from_str::<Config>(contents)?;
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    fn validate(&self) -> Result<(), ParseError> {
        let name = &self.machine.name;
        if name.is_empty() || name.contains('/') {
            return Err(ParseError::Invalid("machine.name", name.clone()));
        }
        if self.machine.vm_name.is_empty() {
            return Err(ParseError::Invalid(
                "machine.vm_name",
                self.machine.vm_name.clone(),
            ));
        }
        if self.machine.disk_size == 0 {
            return Err(ParseError::Invalid("machine.disk_size", "0".into()));
        }
        if self.console.retry_interval_ms == 0 {
            return Err(ParseError::Invalid(
                "console.retry_interval_ms",
                "0".into(),
            ));
        }
        Ok(())
    }
}
