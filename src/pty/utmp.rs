//! Login session accounting for the slave device.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PtyError, PtyResult};

/// How sessions on a PTY are recorded in the system login database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum Accounting {
    /// No records are written
    #[default]
    Disabled,
    /// Delegate to a utempter-compatible helper which finds the terminal
    /// through the master descriptor on its fd 3
    Utempter {
        path: PathBuf,
        #[serde(default)]
        verbs: HelperVerbs,
    },
    /// Write utmpx records directly, mirrored into wtmp
    Utmpx,
}

/// Command words understood by the accounting helper
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HelperVerbs {
    /// libutempter: `add <host>` / `del`
    #[default]
    Utempter,
    /// ulog-helper: `login <host>` / `logout`
    Ulog,
}

impl HelperVerbs {
    fn add(self) -> &'static str {
        match self {
            HelperVerbs::Utempter => "add",
            HelperVerbs::Ulog => "login",
        }
    }

    fn del(self) -> &'static str {
        match self {
            HelperVerbs::Utempter => "del",
            HelperVerbs::Ulog => "logout",
        }
    }
}

impl Accounting {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Accounting::Disabled)
    }

    pub(crate) fn login(
        &self,
        master_fd: RawFd,
        tty_name: &Path,
        user: &str,
        remote_host: &str,
    ) -> PtyResult<()> {
        match self {
            Accounting::Disabled => Ok(()),
            Accounting::Utempter { path, verbs } => {
                utempter(path, master_fd, &[verbs.add(), remote_host])
            }
            Accounting::Utmpx => utmpx::login(tty_name, user, remote_host),
        }
    }

    pub(crate) fn logout(&self, master_fd: RawFd, tty_name: &Path) -> PtyResult<()> {
        match self {
            Accounting::Disabled => Ok(()),
            Accounting::Utempter { path, verbs } => utempter(path, master_fd, &[verbs.del()]),
            Accounting::Utmpx => utmpx::logout(tty_name),
        }
    }
}

fn utempter(helper: &Path, master_fd: RawFd, args: &[&str]) -> PtyResult<()> {
    use std::os::unix::process::CommandExt;

    let mut command = Command::new(helper);
    command.args(args);
    // SAFETY: only async-signal-safe dup2 calls run between fork and exec
    unsafe {
        command.pre_exec(move || {
            for target in [0, 1, 3] {
                nix::unistd::dup2(master_fd, target)?;
            }
            Ok(())
        });
    }

    let status = command
        .status()
        .map_err(|e| PtyError::Accounting(format!("{:?}: {}", helper, e)))?;
    if status.success() {
        Ok(())
    } else {
        Err(PtyError::Accounting(format!(
            "{:?} {} exited with {}",
            helper,
            args.join(" "),
            status
        )))
    }
}

/// The utmp line of a device: its path below /dev
fn utmp_line(tty_name: &Path) -> &[u8] {
    use std::os::unix::ffi::OsStrExt;

    let path = tty_name.strip_prefix("/dev").unwrap_or(tty_name);
    path.as_os_str().as_bytes()
}

/// The short id: the trailing (at most four) bytes of the line
fn utmp_id(line: &[u8]) -> &[u8] {
    &line[line.len().saturating_sub(4)..]
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod utmpx {
    use std::mem;
    use std::path::Path;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{debug, utmp_id, utmp_line};
    use crate::error::{PtyError, PtyResult};

    const WTMP_PATH: &[u8] = b"/var/log/wtmp\0";

    extern "C" {
        fn updwtmpx(wtmpx_file: *const libc::c_char, utmpx: *const libc::utmpx);
    }

    /// Append to the login history. Failures are silent, as with login(3).
    fn append_wtmp(entry: &libc::utmpx) {
        // SAFETY: the path is NUL-terminated and entry outlives the call
        unsafe { updwtmpx(WTMP_PATH.as_ptr() as *const libc::c_char, entry) };
    }

    fn copy_field(dst: &mut [libc::c_char], src: &[u8]) {
        dst.iter_mut().for_each(|d| *d = 0);
        for (d, s) in dst.iter_mut().zip(src) {
            *d = *s as libc::c_char;
        }
    }

    fn stamp(entry: &mut libc::utmpx) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        entry.ut_tv.tv_sec = now.as_secs() as _;
        entry.ut_tv.tv_usec = now.subsec_micros() as _;
    }

    pub(super) fn login(tty_name: &Path, user: &str, remote_host: &str) -> PtyResult<()> {
        let line = utmp_line(tty_name);
        // SAFETY: utmpx is plain old data
        let mut entry: libc::utmpx = unsafe { mem::zeroed() };
        entry.ut_type = libc::USER_PROCESS;
        entry.ut_pid = std::process::id() as libc::pid_t;
        copy_field(&mut entry.ut_line, line);
        copy_field(&mut entry.ut_id, utmp_id(line));
        copy_field(&mut entry.ut_user, user.as_bytes());
        copy_field(&mut entry.ut_host, remote_host.as_bytes());
        stamp(&mut entry);

        // SAFETY: the database cursor is reset and closed around the write
        let written = unsafe {
            libc::setutxent();
            let written = libc::pututxline(&entry);
            libc::endutxent();
            written
        };
        if written.is_null() {
            return Err(PtyError::Accounting(format!(
                "pututxline: {}",
                std::io::Error::last_os_error()
            )));
        }
        append_wtmp(&entry);
        debug!("login record written for {:?}", tty_name);
        Ok(())
    }

    pub(super) fn logout(tty_name: &Path) -> PtyResult<()> {
        // SAFETY: utmpx is plain old data
        let mut probe: libc::utmpx = unsafe { mem::zeroed() };
        copy_field(&mut probe.ut_line, utmp_line(tty_name));

        // SAFETY: getutxline returns a pointer into libc's static record,
        // copied out before the next database call
        unsafe {
            libc::setutxent();
            let found = libc::getutxline(&probe);
            if found.is_null() {
                libc::endutxent();
                debug!("no login record for {:?}", tty_name);
                return Ok(());
            }
            let mut entry = *found;
            copy_field(&mut entry.ut_user, b"");
            copy_field(&mut entry.ut_host, b"");
            entry.ut_type = libc::DEAD_PROCESS;
            stamp(&mut entry);
            let written = libc::pututxline(&entry);
            libc::endutxent();
            if written.is_null() {
                return Err(PtyError::Accounting(format!(
                    "pututxline: {}",
                    std::io::Error::last_os_error()
                )));
            }
            append_wtmp(&entry);
        }
        Ok(())
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
mod utmpx {
    use std::path::Path;

    use crate::error::{PtyError, PtyResult};

    pub(super) fn login(_tty_name: &Path, _user: &str, _remote_host: &str) -> PtyResult<()> {
        Err(PtyError::Accounting(
            "utmpx records are not supported on this platform".to_string(),
        ))
    }

    pub(super) fn logout(_tty_name: &Path) -> PtyResult<()> {
        Err(PtyError::Accounting(
            "utmpx records are not supported on this platform".to_string(),
        ))
    }
}
