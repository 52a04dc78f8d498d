// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generation of the files grub-bhyve consumes at boot: the device map and
//! the GRUB configuration.
//!
//! Each file is written only if it does not already exist. An existing file
//! is never rewritten, even if the paths it names have since changed; remove
//! it (or the whole state directory) to force regeneration.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Boot script loading the boot2docker kernel and initrd off the CD device.
pub const GRUB_CONFIG: &str = "linux (cd0)/boot/vmlinuz loglevel=3 user=docker nomodeset norestore base\n\
     initrd (cd0)/boot/initrd.img\n\
     boot";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Artifact {
    DeviceMap,
    GrubConfig,
}
impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Artifact::DeviceMap => write!(f, "device map"),
            Artifact::GrubConfig => write!(f, "grub config"),
        }
    }
}

#[derive(Debug, Error)]
#[error("cannot write {artifact} {}", .path.display())]
pub struct BootFilesError {
    pub artifact: Artifact,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Outcome for a single artifact.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Written {
    Created,
    AlreadyPresent,
}

/// Paths involved in producing the boot artifacts.
#[derive(Copy, Clone, Debug)]
pub struct BootPaths<'a> {
    pub device_map: &'a Path,
    pub grub_config: &'a Path,
    pub disk: &'a Path,
    pub iso: &'a Path,
}

pub fn device_map_contents(disk: &Path, iso: &Path) -> String {
    format!("(hd0) {}\n(cd0) {}", disk.display(), iso.display())
}

/// Ensure both boot artifacts exist.
///
/// The device map is handled first. If it succeeds and the GRUB config then
/// fails, the device map is left in place.
pub fn ensure_boot_files(
    paths: &BootPaths<'_>,
    log: &slog::Logger,
) -> Result<(Written, Written), BootFilesError> {
    let map = write_once(
        Artifact::DeviceMap,
        paths.device_map,
        &device_map_contents(paths.disk, paths.iso),
        log,
    )?;
    let cfg =
        write_once(Artifact::GrubConfig, paths.grub_config, GRUB_CONFIG, log)?;
    Ok((map, cfg))
}

fn write_once(
    artifact: Artifact,
    path: &Path,
    contents: &str,
    log: &slog::Logger,
) -> Result<Written, BootFilesError> {
    let err = |source| BootFilesError {
        artifact,
        path: path.to_path_buf(),
        source,
    };

    let mut fp =
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(fp) => fp,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                slog::info!(log, "keeping existing {}", artifact;
                    "path" => %path.display());
                return Ok(Written::AlreadyPresent);
            }
            Err(e) => return Err(err(e)),
        };
    fp.write_all(contents.as_bytes()).map_err(err)?;
    fp.sync_all().map_err(err)?;

    slog::info!(log, "wrote {}", artifact; "path" => %path.display());
    Ok(Written::Created)
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn device_map_format() {
        assert_eq!(
            device_map_contents(Path::new("/d.img"), Path::new("/i.iso")),
            "(hd0) /d.img\n(cd0) /i.iso"
        );
    }

    #[test]
    fn writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("device.map");
        let cfg = dir.path().join("grub.cfg");
        let paths = BootPaths {
            device_map: &map,
            grub_config: &cfg,
            disk: Path::new("/d.img"),
            iso: Path::new("/i.iso"),
        };

        let res = ensure_boot_files(&paths, &test_logger()).unwrap();
        assert_eq!(res, (Written::Created, Written::Created));

        assert_eq!(
            std::fs::read_to_string(&map).unwrap(),
            "(hd0) /d.img\n(cd0) /i.iso"
        );
        assert_eq!(
            std::fs::read_to_string(&cfg).unwrap(),
            "linux (cd0)/boot/vmlinuz loglevel=3 user=docker nomodeset norestore base\n\
             initrd (cd0)/boot/initrd.img\n\
             boot"
        );
    }

    #[test]
    fn second_call_leaves_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("device.map");
        let cfg = dir.path().join("grub.cfg");
        let log = test_logger();

        let first = BootPaths {
            device_map: &map,
            grub_config: &cfg,
            disk: Path::new("/d.img"),
            iso: Path::new("/i.iso"),
        };
        ensure_boot_files(&first, &log).unwrap();
        let map_before = std::fs::read(&map).unwrap();
        let cfg_before = std::fs::read(&cfg).unwrap();

        let res = ensure_boot_files(&first, &log).unwrap();
        assert_eq!(res, (Written::AlreadyPresent, Written::AlreadyPresent));
        assert_eq!(std::fs::read(&map).unwrap(), map_before);
        assert_eq!(std::fs::read(&cfg).unwrap(), cfg_before);

        // Changed paths do not cause the stale map to be rewritten
        let moved = BootPaths { disk: Path::new("/elsewhere.img"), ..first };
        ensure_boot_files(&moved, &log).unwrap();
        assert_eq!(std::fs::read(&map).unwrap(), map_before);
    }

    #[test]
    fn each_file_checked_independently() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("device.map");
        let cfg = dir.path().join("grub.cfg");
        std::fs::write(&cfg, "custom").unwrap();

        let paths = BootPaths {
            device_map: &map,
            grub_config: &cfg,
            disk: Path::new("/d.img"),
            iso: Path::new("/i.iso"),
        };
        let res = ensure_boot_files(&paths, &test_logger()).unwrap();
        assert_eq!(res, (Written::Created, Written::AlreadyPresent));
        assert_eq!(std::fs::read_to_string(&cfg).unwrap(), "custom");
    }

    #[test]
    fn missing_directory_fails_on_grub_config() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("device.map");
        let cfg = dir.path().join("missing").join("grub.cfg");
        let paths = BootPaths {
            device_map: &map,
            grub_config: &cfg,
            disk: Path::new("/d.img"),
            iso: Path::new("/i.iso"),
        };

        let err = ensure_boot_files(&paths, &test_logger()).unwrap_err();
        assert_eq!(err.artifact, Artifact::GrubConfig);
        assert_eq!(err.path, cfg);
        assert_eq!(err.source.kind(), ErrorKind::NotFound);
        // The device map written before the failure stays
        assert!(map.exists());
    }
}
