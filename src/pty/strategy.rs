//! PTY pair acquisition strategies.
//!
//! Not all systems hand out pseudo-terminals the same way, so allocation is
//! attempted with each mechanism in [`Strategy::candidates`] order:
//!
//! - `openpty(3)`: opens both ends and reports the slave name
//! - Unix98: `posix_openpt(3)`, `ptsname_r(3)`/`TIOCGPTN`, `grantpt(3)`, `unlockpt(3)`
//! - Legacy BSD devices: scan `/dev/ptyXY` masters for a usable `/dev/ttyXY`

use std::ffi::{CStr, OsStr};
use std::fs::{self, Permissions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::pty::{grantpt, posix_openpt, unlockpt};
use nix::sys::stat::Mode;
use nix::unistd::{access, chown, geteuid, getgid, getuid, AccessFlags, Group};
use tracing::{debug, warn};

use super::grant::{self, GrantOp};
use crate::error::{PtyError, PtyResult};

const TTY_GROUP: &str = "tty";

/// Legacy device names are `/dev/pty` + series + unit
const LEGACY_SERIES: &[u8] = b"pqrstuvwxyzabcde";
const LEGACY_UNITS: &[u8] = b"0123456789abcdef";

/// Group-read, group-exec and any access for others
const LOOSE_MODE_BITS: u32 = 0o057;

/// A way of obtaining a master/slave pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// `openpty(3)`, opens both ends at once
    OpenPty,
    /// Cloning master device with kernel-mediated grant/unlock
    Unix98,
    /// Scan of pre-created BSD-style device pairs
    Legacy,
}

impl Strategy {
    /// Strategies to try on this platform, preferred first
    pub fn candidates() -> &'static [Strategy] {
        &[Strategy::OpenPty, Strategy::Unix98, Strategy::Legacy]
    }

    pub fn name(self) -> &'static str {
        match self {
            Strategy::OpenPty => "openpty",
            Strategy::Unix98 => "unix98",
            Strategy::Legacy => "legacy",
        }
    }

    /// Allocate a pair. Anything opened by a failed attempt is closed again.
    pub(crate) fn allocate(self, grant_helper: Option<&Path>) -> PtyResult<Allocation> {
        match self {
            Strategy::OpenPty => open_pty(),
            Strategy::Unix98 => open_unix98(),
            Strategy::Legacy => open_legacy(grant_helper),
        }
    }
}

/// A freshly allocated master/slave pair
#[derive(Debug)]
pub(crate) struct Allocation {
    pub master: OwnedFd,
    pub slave: OwnedFd,
    pub tty_name: PathBuf,
    /// Set when the slave may be accessible to other users
    pub warning: Option<PtyError>,
}

fn open_pty() -> PtyResult<Allocation> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    let mut name = [0 as libc::c_char; libc::PATH_MAX as usize];

    // SAFETY: all out-pointers are valid; the name buffer is PATH_MAX long
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            name.as_mut_ptr(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if rc != 0 {
        return Err(PtyError::AllocationFailed(format!(
            "openpty: {}",
            Errno::last()
        )));
    }

    // SAFETY: openpty succeeded, both descriptors are ours
    let master = unsafe { OwnedFd::from_raw_fd(master) };
    let slave = unsafe { OwnedFd::from_raw_fd(slave) };
    let tty_name = c_path(&name);

    Ok(Allocation {
        master,
        slave,
        tty_name,
        warning: None,
    })
}

fn open_unix98() -> PtyResult<Allocation> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(PtyError::OpenMaster)?;
    let fd = master.as_raw_fd();
    let tty_name = slave_path_of(fd).map_err(|source| PtyError::SlaveName { fd, source })?;

    grantpt(&master).map_err(PtyError::GrantPty)?;
    unlockpt(&master).map_err(PtyError::UnlockPty)?;

    // SAFETY: into_raw_fd hands over sole ownership
    let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
    let slave = open_slave_device(&tty_name)?;

    Ok(Allocation {
        master,
        slave,
        tty_name,
        warning: None,
    })
}

fn open_legacy(grant_helper: Option<&Path>) -> PtyResult<Allocation> {
    for &series in LEGACY_SERIES {
        for &unit in LEGACY_UNITS {
            let pty_name = format!("/dev/pty{}{}", series as char, unit as char);
            let tty_name = PathBuf::from(format!("/dev/tty{}{}", series as char, unit as char));

            let Ok(fd) = open(pty_name.as_str(), OFlag::O_RDWR, Mode::empty()) else {
                continue;
            };
            // SAFETY: open succeeded, the descriptor is ours
            let master = unsafe { OwnedFd::from_raw_fd(fd) };

            // availability is decided by the permission bits of the slave
            if access(&tty_name, AccessFlags::R_OK | AccessFlags::W_OK).is_err() {
                continue;
            }

            if geteuid().is_root() {
                claim_legacy_slave(&tty_name);
            }

            return finish_legacy(master, tty_name, grant_helper);
        }
    }

    Err(PtyError::AllocationFailed(
        "no free legacy pty device".to_string(),
    ))
}

/// Hand the slave to the real user, group tty (or wheel), mode 0620
fn claim_legacy_slave(tty_name: &Path) {
    let gid = [TTY_GROUP, "wheel"]
        .iter()
        .find_map(|name| Group::from_name(name).ok().flatten())
        .map(|group| group.gid)
        .unwrap_or_else(getgid);

    if let Err(e) = chown(tty_name, Some(getuid()), Some(gid)) {
        debug!("chown {:?} failed: {}", tty_name, e);
    }
    if let Err(e) = fs::set_permissions(tty_name, Permissions::from_mode(0o620)) {
        debug!("chmod {:?} failed: {}", tty_name, e);
    }
}

fn finish_legacy(
    master: OwnedFd,
    tty_name: PathBuf,
    grant_helper: Option<&Path>,
) -> PtyResult<Allocation> {
    let meta = fs::metadata(&tty_name).map_err(|e| {
        PtyError::AllocationFailed(format!("{:?} disappeared: {}", tty_name, e))
    })?;

    let mut warning = None;
    let foreign = meta.uid() != getuid().as_raw() || meta.mode() & LOOSE_MODE_BITS != 0;
    if foreign && !grant::run(grant_helper, GrantOp::Grant, master.as_raw_fd()) {
        warn!(
            "chownpty failed for device {:?}; communication can be eavesdropped",
            tty_name
        );
        warning = Some(PtyError::PermissionDenied {
            path: tty_name.clone(),
        });
    }

    // Legacy masters usually have no lock; failure here is expected
    // SAFETY: plain syscall wrapper on a descriptor we own
    let _ = unsafe { libc::unlockpt(master.as_raw_fd()) };

    let slave = open_slave_device(&tty_name)?;

    Ok(Allocation {
        master,
        slave,
        tty_name,
        warning,
    })
}

/// Open the slave side without making it our controlling terminal
pub(crate) fn open_slave_device(path: &Path) -> PtyResult<OwnedFd> {
    let fd = open(path, OFlag::O_RDWR | OFlag::O_NOCTTY, Mode::empty()).map_err(|source| {
        PtyError::OpenSlave {
            path: path.to_path_buf(),
            source,
        }
    })?;
    // SAFETY: open succeeded, the descriptor is ours
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Ask the kernel for the slave device belonging to a master
#[cfg(target_os = "linux")]
pub(crate) fn slave_path_of(fd: RawFd) -> io::Result<PathBuf> {
    let mut buf = [0 as libc::c_char; 128];
    // SAFETY: buf is valid for buf.len() bytes
    let rc = unsafe { libc::ptsname_r(fd, buf.as_mut_ptr(), buf.len()) };
    if rc == 0 {
        return Ok(c_path(&buf));
    }

    let mut ptyno: libc::c_uint = 0;
    // SAFETY: TIOCGPTN writes a single unsigned int
    if unsafe { libc::ioctl(fd, libc::TIOCGPTN, &mut ptyno) } == 0 {
        return Ok(PathBuf::from(format!("/dev/pts/{}", ptyno)));
    }

    Err(io::Error::from_raw_os_error(rc))
}

/// Ask the kernel for the slave device belonging to a master
#[cfg(not(target_os = "linux"))]
pub(crate) fn slave_path_of(fd: RawFd) -> io::Result<PathBuf> {
    // SAFETY: ptsname returns a pointer to static storage or null; it is
    // copied out before anything else can call it on this thread
    let name = unsafe { libc::ptsname(fd) };
    if name.is_null() {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: non-null result is a NUL-terminated string
    let name = unsafe { CStr::from_ptr(name) };
    Ok(PathBuf::from(OsStr::from_bytes(name.to_bytes())))
}

fn c_path(buf: &[libc::c_char]) -> PathBuf {
    // SAFETY: the buffer was zero-initialised and filled by libc with a
    // NUL-terminated string shorter than the buffer
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    PathBuf::from(OsStr::from_bytes(name.to_bytes()))
}
