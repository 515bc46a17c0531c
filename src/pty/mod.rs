//! Pseudo-terminal allocation and slave-side control
//!
//! A [`Pty`] owns (or adopts) a master descriptor and keeps the matching
//! slave open until told otherwise. It does no I/O itself; see
//! [`PtyDevice`](crate::PtyDevice) for buffered transport over the master.

mod grant;
mod strategy;
mod utmp;

pub use strategy::Strategy;
pub use utmp::{Accounting, HelperVerbs};

use std::fs::{self, Permissions};
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::{chown, geteuid, getgid, getpid, setsid, Gid, Uid};
use tracing::{debug, warn};

use self::grant::GrantOp;
use crate::config::PtyConfig;
use crate::error::{PtyError, PtyResult};
use crate::size::WindowSize;

/// The master side, either ours or borrowed from the caller
#[derive(Debug)]
enum Master {
    Owned(OwnedFd),
    Adopted(RawFd),
}

impl Master {
    fn raw(&self) -> RawFd {
        match self {
            Master::Owned(fd) => fd.as_raw_fd(),
            Master::Adopted(fd) => *fd,
        }
    }
}

/// A master/slave pseudo-terminal pair
#[derive(Debug)]
pub struct Pty {
    master: Option<Master>,
    slave: Option<OwnedFd>,
    tty_name: Option<PathBuf>,
    strategy: Option<Strategy>,
    with_ctty: bool,
    grant_helper: Option<PathBuf>,
    accounting: Accounting,
    permission_warning: Option<PtyError>,
}

impl Default for Pty {
    fn default() -> Self {
        Pty::new()
    }
}

impl Pty {
    /// A closed PTY using the default configuration
    pub fn new() -> Self {
        Pty::with_config(&PtyConfig::default())
    }

    pub fn with_config(config: &PtyConfig) -> Self {
        Pty {
            master: None,
            slave: None,
            tty_name: None,
            strategy: None,
            with_ctty: config.controlling_tty,
            grant_helper: config.grant_helper.clone(),
            accounting: config.accounting.clone(),
            permission_warning: None,
        }
    }

    /// Allocate a fresh pair. Does nothing if this PTY is already open.
    pub fn open(&mut self) -> PtyResult<()> {
        if self.master.is_some() {
            return Ok(());
        }

        let mut failures = Vec::new();
        for &strategy in Strategy::candidates() {
            let pair = match strategy.allocate(self.grant_helper.as_deref()) {
                Ok(pair) => pair,
                Err(e) => {
                    debug!("{} allocation failed: {}", strategy.name(), e);
                    failures.push(format!("{}: {}", strategy.name(), e));
                    continue;
                }
            };

            set_cloexec(pair.master.as_raw_fd())?;
            set_cloexec(pair.slave.as_raw_fd())?;

            debug!(
                "Allocated {:?} via {} (master fd {}, slave fd {})",
                pair.tty_name,
                strategy.name(),
                pair.master.as_raw_fd(),
                pair.slave.as_raw_fd()
            );

            self.master = Some(Master::Owned(pair.master));
            self.slave = Some(pair.slave);
            self.tty_name = Some(pair.tty_name);
            self.strategy = Some(strategy);
            self.permission_warning = pair.warning;
            return Ok(());
        }

        warn!("Can't open a pseudo teletype");
        Err(PtyError::AllocationFailed(failures.join("; ")))
    }

    /// Adopt a master descriptor owned by the caller and open its slave.
    ///
    /// The descriptor is never closed by this PTY.
    pub fn open_fd(&mut self, fd: RawFd) -> PtyResult<()> {
        if self.master.is_some() {
            warn!("Attempting to open an already open pty");
            return Err(PtyError::AlreadyOpen);
        }

        let tty_name =
            strategy::slave_path_of(fd).map_err(|source| PtyError::SlaveName { fd, source })?;

        self.master = Some(Master::Adopted(fd));
        self.tty_name = Some(tty_name);
        if let Err(e) = self.open_slave() {
            self.master = None;
            self.tty_name = None;
            return Err(e);
        }
        Ok(())
    }

    pub fn close_slave(&mut self) {
        self.slave = None;
    }

    pub fn open_slave(&mut self) -> PtyResult<()> {
        if self.slave.is_some() {
            return Ok(());
        }
        if self.master.is_none() {
            warn!("Attempting to open pty slave while master is closed");
            return Err(PtyError::NotOpen);
        }
        let tty_name = self.tty_name.as_deref().ok_or(PtyError::NotOpen)?;
        let slave = strategy::open_slave_device(tty_name)?;
        set_cloexec(slave.as_raw_fd())?;
        self.slave = Some(slave);
        Ok(())
    }

    /// Close both sides. An adopted master is left open.
    pub fn close(&mut self) {
        let Some(master) = self.master.take() else {
            return;
        };
        self.close_slave();

        if let Master::Owned(fd) = master {
            if self.needs_permission_restore() {
                self.restore_permissions(&fd);
            }
            drop(fd);
        }

        self.tty_name = None;
        self.strategy = None;
        self.permission_warning = None;
    }

    /// Legacy devices keep their mode after we let go, so hand them back
    fn needs_permission_restore(&self) -> bool {
        self.strategy != Some(Strategy::OpenPty)
            && self
                .tty_name
                .as_deref()
                .map_or(false, |path| !path.starts_with("/dev/pts/"))
    }

    fn restore_permissions(&self, master: &OwnedFd) {
        let Some(tty_name) = self.tty_name.as_deref() else {
            return;
        };

        if geteuid().is_root() {
            let group = match fs::metadata(tty_name) {
                Ok(meta) if meta.gid() == getgid().as_raw() => Some(Gid::from_raw(0)),
                _ => None,
            };
            if let Err(e) = chown(tty_name, Some(Uid::from_raw(0)), group) {
                debug!("chown {:?} failed: {}", tty_name, e);
            }
            if let Err(e) = fs::set_permissions(tty_name, Permissions::from_mode(0o666)) {
                debug!("chmod {:?} failed: {}", tty_name, e);
            }
        } else {
            // The helper inherits the master
            if let Err(e) = fcntl(master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty())) {
                debug!("clearing close-on-exec failed: {}", e);
            }
            grant::run(
                self.grant_helper.as_deref(),
                GrantOp::Revoke,
                master.as_raw_fd(),
            );
        }
    }

    /// Make the slave the controlling terminal of the calling process.
    ///
    /// Meant for a freshly forked child. A no-op when disabled.
    pub fn set_controlling_terminal(&self) -> PtyResult<()> {
        if !self.with_ctty {
            return Ok(());
        }
        let slave = self.slave_fd().ok_or(PtyError::NotOpen)?;

        // Fails when already a session leader, which is fine
        let _ = setsid();

        // SAFETY: TIOCSCTTY takes an int argument
        if unsafe { libc::ioctl(slave, libc::TIOCSCTTY as _, 0) } < 0 {
            return Err(PtyError::SetControllingTerminal(Errno::last()));
        }
        // SAFETY: plain syscall wrapper
        if unsafe { libc::tcsetpgrp(slave, getpid().as_raw()) } < 0 {
            return Err(PtyError::SetControllingTerminal(Errno::last()));
        }
        Ok(())
    }

    pub fn set_controlling_tty_enabled(&mut self, enabled: bool) {
        self.with_ctty = enabled;
    }

    pub fn controlling_tty_enabled(&self) -> bool {
        self.with_ctty
    }

    /// Record a login session on the slave for `user`
    pub fn login(&self, user: &str, remote_host: &str) -> PtyResult<()> {
        let (master, tty_name) = self.master_and_name()?;
        self.accounting.login(master, tty_name, user, remote_host)
    }

    /// Remove the session record written by [`login`](Self::login)
    pub fn logout(&self) -> PtyResult<()> {
        let (master, tty_name) = self.master_and_name()?;
        self.accounting.logout(master, tty_name)
    }

    fn master_and_name(&self) -> PtyResult<(RawFd, &Path)> {
        match (self.master_fd(), self.tty_name.as_deref()) {
            (Some(fd), Some(name)) => Ok((fd, name)),
            _ => Err(PtyError::NotOpen),
        }
    }

    pub fn set_window_size(&self, size: WindowSize) -> PtyResult<()> {
        size.set_on_fd(self.master_fd().ok_or(PtyError::NotOpen)?)
    }

    pub fn window_size(&self) -> PtyResult<WindowSize> {
        WindowSize::get_from_fd(self.master_fd().ok_or(PtyError::NotOpen)?)
    }

    pub fn set_echo(&self, echo: bool) -> PtyResult<()> {
        let mut attrs = self.get_attrs()?;
        if echo {
            attrs.c_lflag |= libc::ECHO;
        } else {
            attrs.c_lflag &= !libc::ECHO;
        }
        self.set_attrs(&attrs)
    }

    /// Terminal attributes of the slave side
    pub fn get_attrs(&self) -> PtyResult<libc::termios> {
        let fd = self.attr_fd()?;
        // SAFETY: termios is plain old data and fully written by tcgetattr
        let mut attrs: libc::termios = unsafe { mem::zeroed() };
        // SAFETY: attrs outlives the call
        if unsafe { libc::tcgetattr(fd, &mut attrs) } != 0 {
            return Err(PtyError::Termios(Errno::last()));
        }
        Ok(attrs)
    }

    pub fn set_attrs(&self, attrs: &libc::termios) -> PtyResult<()> {
        let fd = self.attr_fd()?;
        // SAFETY: attrs outlives the call
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, attrs) } != 0 {
            return Err(PtyError::Termios(Errno::last()));
        }
        Ok(())
    }

    // Attributes live on the line discipline; either side reaches it
    fn attr_fd(&self) -> PtyResult<RawFd> {
        self.slave_fd()
            .or_else(|| self.master_fd())
            .ok_or(PtyError::NotOpen)
    }

    pub fn is_open(&self) -> bool {
        self.master.is_some()
    }

    pub fn owns_master(&self) -> bool {
        matches!(self.master, Some(Master::Owned(_)))
    }

    pub fn master_fd(&self) -> Option<RawFd> {
        self.master.as_ref().map(Master::raw)
    }

    pub fn slave_fd(&self) -> Option<RawFd> {
        self.slave.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Path of the slave device while open
    pub fn tty_name(&self) -> Option<&Path> {
        self.tty_name.as_deref()
    }

    /// How the current pair was obtained; `None` for adopted masters
    pub fn strategy(&self) -> Option<Strategy> {
        self.strategy
    }

    /// Set when a legacy slave may be readable by other users
    pub fn permission_warning(&self) -> Option<&PtyError> {
        self.permission_warning.as_ref()
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn set_cloexec(fd: RawFd) -> PtyResult<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| PtyError::Io(e.into()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> PtyConfig {
        PtyConfig {
            grant_helper: None,
            ..PtyConfig::default()
        }
    }

    #[test]
    fn test_open_and_close() {
        let mut pty = Pty::with_config(&quiet_config());
        assert!(!pty.is_open());
        pty.open().unwrap();
        assert!(pty.is_open());
        assert!(pty.owns_master());
        assert!(pty.master_fd().is_some());
        assert!(pty.slave_fd().is_some());
        assert!(pty.tty_name().is_some());

        pty.close();
        assert!(!pty.is_open());
        assert_eq!(pty.master_fd(), None);
        assert_eq!(pty.slave_fd(), None);
        assert_eq!(pty.tty_name(), None);

        // idempotent
        pty.close();
    }

    #[test]
    fn test_open_twice_is_noop() {
        let mut pty = Pty::with_config(&quiet_config());
        pty.open().unwrap();
        let master = pty.master_fd();
        pty.open().unwrap();
        assert_eq!(pty.master_fd(), master);
    }

    #[test]
    fn test_descriptors_are_cloexec() {
        let mut pty = Pty::with_config(&quiet_config());
        pty.open().unwrap();
        for fd in [pty.master_fd().unwrap(), pty.slave_fd().unwrap()] {
            let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
            assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        }
    }

    #[test]
    fn test_slave_toggle() {
        let mut pty = Pty::with_config(&quiet_config());
        pty.open().unwrap();
        pty.close_slave();
        assert_eq!(pty.slave_fd(), None);
        pty.close_slave();
        pty.open_slave().unwrap();
        assert!(pty.slave_fd().is_some());
        pty.open_slave().unwrap();
    }

    #[test]
    fn test_open_slave_requires_master() {
        let mut pty = Pty::new();
        assert!(matches!(pty.open_slave(), Err(PtyError::NotOpen)));
    }

    #[test]
    fn test_closed_operations_fail() {
        let pty = Pty::new();
        assert!(matches!(pty.window_size(), Err(PtyError::NotOpen)));
        assert!(matches!(pty.set_echo(false), Err(PtyError::NotOpen)));
        assert!(matches!(pty.get_attrs(), Err(PtyError::NotOpen)));
        assert!(matches!(pty.logout(), Err(PtyError::NotOpen)));
    }

    #[test]
    fn test_window_size_round_trip() {
        let mut pty = Pty::with_config(&quiet_config());
        pty.open().unwrap();
        let size = WindowSize::with_pixels(40, 120, 960, 800);
        pty.set_window_size(size).unwrap();
        assert_eq!(pty.window_size().unwrap(), size);
    }

    #[test]
    fn test_set_echo() {
        let mut pty = Pty::with_config(&quiet_config());
        pty.open().unwrap();

        pty.set_echo(false).unwrap();
        assert_eq!(pty.get_attrs().unwrap().c_lflag & libc::ECHO, 0);

        pty.set_echo(true).unwrap();
        assert_ne!(pty.get_attrs().unwrap().c_lflag & libc::ECHO, 0);
    }

    #[test]
    fn test_adopted_master_survives_close() {
        let mut owner = Pty::with_config(&quiet_config());
        owner.open().unwrap();
        let fd = owner.master_fd().unwrap();

        let mut adopter = Pty::with_config(&quiet_config());
        adopter.open_fd(fd).unwrap();
        assert!(!adopter.owns_master());
        assert_eq!(adopter.tty_name(), owner.tty_name());
        assert!(matches!(adopter.open_fd(fd), Err(PtyError::AlreadyOpen)));

        adopter.close();
        assert!(fcntl(fd, FcntlArg::F_GETFD).is_ok());
    }

    #[test]
    fn test_open_fd_rejects_non_pty() {
        let file = tempfile::tempfile().unwrap();
        let mut pty = Pty::new();
        assert!(matches!(
            pty.open_fd(file.as_raw_fd()),
            Err(PtyError::SlaveName { .. })
        ));
        assert!(!pty.is_open());
    }

    #[test]
    fn test_unix98_devices_skip_permission_restore() {
        let mut pty = Pty::with_config(&quiet_config());
        pty.open().unwrap();
        if pty.tty_name().map_or(false, |p| p.starts_with("/dev/pts")) {
            assert!(!pty.needs_permission_restore());
        }
    }
}
