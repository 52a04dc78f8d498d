// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Terminal attribute manipulation for the VM's serial console device.
//!
//! These operate on any open terminal-backed descriptor. None of them retry:
//! a failed attribute get/set (descriptor is not a terminal, or has been
//! closed) is returned to the caller as-is.

use std::io::{Error, Result};
use std::os::unix::io::AsRawFd;

/// Fetch the current attributes of the terminal behind `fd`.
pub fn get_attrs(fd: &impl AsRawFd) -> Result<libc::termios> {
    let termios = unsafe {
        let mut curr_termios = std::mem::zeroed();
        let r = libc::tcgetattr(fd.as_raw_fd(), &mut curr_termios);
        if r == -1 {
            return Err(Error::last_os_error());
        }
        curr_termios
    };
    Ok(termios)
}

/// Apply `termios` to the terminal behind `fd`, effective immediately.
pub fn set_attrs(fd: &impl AsRawFd, termios: &libc::termios) -> Result<()> {
    let r = unsafe { libc::tcsetattr(fd.as_raw_fd(), libc::TCSANOW, termios) };
    if r == -1 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Whether `fd` refers to a terminal. Probes by fetching attributes; nothing
/// is modified.
pub fn is_terminal(fd: &impl AsRawFd) -> bool {
    get_attrs(fd).is_ok()
}

/// Stop translating NL to CR-NL on output, so console output coming from the
/// guest is not translated a second time on its way to the host terminal.
pub fn sane(fd: &impl AsRawFd) -> Result<()> {
    let termios = make_sane(get_attrs(fd)?);
    set_attrs(fd, &termios)
}

/// Put the terminal behind `fd` into raw mode. See [`make_raw`].
pub fn raw(fd: &impl AsRawFd) -> Result<()> {
    let termios = make_raw(get_attrs(fd)?);
    set_attrs(fd, &termios)
}

/// Sane-mode transform: only `ONLCR` is cleared from the output flags.
pub fn make_sane(mut t: libc::termios) -> libc::termios {
    t.c_oflag &= !libc::ONLCR;
    t
}

/// Raw-mode transform of a set of terminal attributes.
///
/// This is the classic `cfmakeraw` recipe, after which output
/// post-processing (`OPOST`) is switched back on. The console is read
/// byte-at-a-time: `VMIN` of 1 and no inter-byte timeout.
pub fn make_raw(mut t: libc::termios) -> libc::termios {
    t.c_iflag &= !(libc::IGNBRK
        | libc::BRKINT
        | libc::PARMRK
        | libc::ISTRIP
        | libc::INLCR
        | libc::IGNCR
        | libc::ICRNL
        | libc::IXON);
    t.c_oflag &= !libc::OPOST;
    t.c_lflag &= !(libc::ECHO
        | libc::ECHONL
        | libc::ICANON
        | libc::ISIG
        | libc::IEXTEN);
    t.c_cflag &= !(libc::CSIZE | libc::PARENB);
    t.c_cflag |= libc::CS8;
    t.c_cc[libc::VMIN] = 1;
    t.c_cc[libc::VTIME] = 0;

    t.c_oflag |= libc::OPOST;
    t
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    use std::fs::File;
    use std::os::unix::io::FromRawFd;

    /// Allocate a pseudo-terminal, returning the (controller, subsidiary)
    /// pair.
    pub(crate) fn openpty() -> (File, File) {
        let mut ctrl: libc::c_int = -1;
        let mut sub: libc::c_int = -1;
        let r = unsafe {
            libc::openpty(
                &mut ctrl,
                &mut sub,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        assert_eq!(r, 0, "openpty: {}", Error::last_os_error());
        unsafe { (File::from_raw_fd(ctrl), File::from_raw_fd(sub)) }
    }

    fn same_attrs(a: &libc::termios, b: &libc::termios) -> bool {
        a.c_iflag == b.c_iflag
            && a.c_oflag == b.c_oflag
            && a.c_cflag == b.c_cflag
            && a.c_lflag == b.c_lflag
            && a.c_cc == b.c_cc
    }

    fn cooked() -> libc::termios {
        let mut t: libc::termios = unsafe { std::mem::zeroed() };
        t.c_iflag = libc::BRKINT | libc::ICRNL | libc::IXON | libc::ISTRIP;
        t.c_oflag = libc::OPOST | libc::ONLCR;
        t.c_cflag = libc::CS7 | libc::PARENB | libc::CREAD;
        t.c_lflag = libc::ECHO | libc::ICANON | libc::ISIG | libc::IEXTEN;
        t.c_cc[libc::VMIN] = 4;
        t.c_cc[libc::VTIME] = 3;
        t
    }

    #[test]
    fn raw_transform() {
        let t = make_raw(cooked());

        assert_eq!(t.c_iflag & (libc::BRKINT | libc::ICRNL | libc::IXON), 0);
        assert_eq!(t.c_iflag & libc::ISTRIP, 0);
        assert_eq!(t.c_lflag, 0);
        assert_eq!(t.c_cflag & libc::CSIZE, libc::CS8);
        assert_eq!(t.c_cflag & libc::PARENB, 0);
        // Untouched by the transform
        assert_ne!(t.c_cflag & libc::CREAD, 0);
        assert_eq!(t.c_cc[libc::VMIN], 1);
        assert_eq!(t.c_cc[libc::VTIME], 0);

        // OPOST comes back on; the rest of the output flags are left alone
        assert_ne!(t.c_oflag & libc::OPOST, 0);
        assert_ne!(t.c_oflag & libc::ONLCR, 0);
    }

    #[test]
    fn raw_transform_idempotent() {
        let once = make_raw(cooked());
        let twice = make_raw(make_raw(cooked()));
        assert!(same_attrs(&once, &twice));
    }

    #[test]
    fn sane_only_clears_onlcr() {
        let before = cooked();
        let after = make_sane(before);

        assert_eq!(after.c_oflag, libc::OPOST);
        assert_eq!(after.c_iflag, before.c_iflag);
        assert_eq!(after.c_cflag, before.c_cflag);
        assert_eq!(after.c_lflag, before.c_lflag);
        assert_eq!(after.c_cc, before.c_cc);
    }

    #[test]
    fn pty_raw_and_sane() {
        let (_ctrl, sub) = openpty();
        assert!(is_terminal(&sub));

        sane(&sub).unwrap();
        raw(&sub).unwrap();

        let t = get_attrs(&sub).unwrap();
        assert_eq!(t.c_oflag & libc::ONLCR, 0);
        assert_ne!(t.c_oflag & libc::OPOST, 0);
        assert_eq!(t.c_lflag & (libc::ECHO | libc::ICANON | libc::ISIG), 0);
        assert_eq!(t.c_cc[libc::VMIN], 1);
        assert_eq!(t.c_cc[libc::VTIME], 0);

        // A second application changes nothing
        raw(&sub).unwrap();
        assert!(same_attrs(&t, &get_attrs(&sub).unwrap()));
    }

    #[test]
    fn not_a_terminal() {
        let file = tempfile::tempfile().unwrap();
        assert!(!is_terminal(&file));
        assert!(get_attrs(&file).is_err());
        assert!(raw(&file).is_err());
        assert!(sane(&file).is_err());
    }
}
