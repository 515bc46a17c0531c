//! Child processes attached to a PTY
//!
//! The child becomes a session leader with the slave as its controlling
//! terminal, optionally records a login session, and gets the slave on the
//! selected standard channels before exec. The parent keeps a [`PtyDevice`]
//! on the master.

use std::ffi::{CStr, CString, OsStr};
use std::ops::BitOr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{self, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid, User};
use tracing::{debug, warn};

use crate::config::PtyConfig;
use crate::device::PtyDevice;
use crate::error::{PtyError, PtyResult};
use crate::pty::Pty;
use crate::size::WindowSize;

/// Standard channels of the child that are connected to the slave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PtyChannels(u8);

impl PtyChannels {
    pub const NONE: PtyChannels = PtyChannels(0);
    pub const STDIN: PtyChannels = PtyChannels(1);
    pub const STDOUT: PtyChannels = PtyChannels(2);
    pub const STDERR: PtyChannels = PtyChannels(4);
    pub const ALL: PtyChannels = PtyChannels(7);

    pub fn contains(self, other: PtyChannels) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for PtyChannels {
    type Output = PtyChannels;

    fn bitor(self, rhs: PtyChannels) -> PtyChannels {
        PtyChannels(self.0 | rhs.0)
    }
}

impl Default for PtyChannels {
    fn default() -> Self {
        PtyChannels::ALL
    }
}

/// Builder for spawning a child process on a PTY
pub struct ProcessBuilder {
    program: CString,
    args: Vec<CString>,
    env: Vec<CString>,
    cwd: Option<CString>,
    size: Option<WindowSize>,
    channels: PtyChannels,
    use_utmp: bool,
    master_fd: Option<RawFd>,
    config: PtyConfig,
}

fn c_string(value: &OsStr) -> PtyResult<CString> {
    CString::new(value.as_bytes()).map_err(|e| PtyError::InvalidArgument(e.to_string()))
}

impl ProcessBuilder {
    /// Run `program`, looked up in `PATH` unless it contains a slash
    pub fn new<S: AsRef<OsStr>>(program: S) -> PtyResult<Self> {
        let program = c_string(program.as_ref())?;

        Ok(ProcessBuilder {
            program: program.clone(),
            args: vec![program],
            env: Self::inherited_env(),
            cwd: None,
            size: None,
            channels: PtyChannels::ALL,
            use_utmp: false,
            master_fd: None,
            config: PtyConfig::default(),
        })
    }

    /// `/bin/sh -c command`
    pub fn shell_command<S: AsRef<OsStr>>(command: S) -> PtyResult<Self> {
        Self::new("/bin/sh")?.arg("-c")?.arg(command)
    }

    /// The user's login shell from `$SHELL`, falling back to `/bin/sh`
    pub fn default_shell() -> PtyResult<Self> {
        let shell = std::env::var_os("SHELL").unwrap_or_else(|| "/bin/sh".into());
        Self::new(shell)
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> PtyResult<Self> {
        self.args.push(c_string(arg.as_ref())?);
        Ok(self)
    }

    pub fn args<I, S>(mut self, args: I) -> PtyResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg)?;
        }
        Ok(self)
    }

    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> PtyResult<Self> {
        let key = key.as_ref().as_bytes();
        let mut prefix = key.to_vec();
        prefix.push(b'=');
        self.env.retain(|var| !var.as_bytes().starts_with(&prefix));

        let mut var = prefix;
        var.extend_from_slice(value.as_ref().as_bytes());
        self.env.push(c_string(OsStr::from_bytes(&var))?);
        Ok(self)
    }

    pub fn env_clear(mut self) -> Self {
        self.env.clear();
        self
    }

    pub fn current_dir<S: AsRef<OsStr>>(mut self, dir: S) -> PtyResult<Self> {
        self.cwd = Some(c_string(dir.as_ref())?);
        Ok(self)
    }

    /// Initial window size; defaults to the configured size
    pub fn size(mut self, size: WindowSize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn channels(mut self, channels: PtyChannels) -> Self {
        self.channels = channels;
        self
    }

    /// Record a login session for the lifetime of the child
    pub fn use_utmp(mut self, enabled: bool) -> Self {
        self.use_utmp = enabled;
        self
    }

    /// Run on an existing master instead of allocating a new PTY.
    /// The descriptor stays owned by the caller.
    pub fn master_fd(mut self, fd: RawFd) -> Self {
        self.master_fd = Some(fd);
        self
    }

    pub fn config(mut self, config: PtyConfig) -> Self {
        self.config = config;
        self
    }

    fn inherited_env() -> Vec<CString> {
        std::env::vars_os()
            .filter_map(|(key, value)| {
                let mut var = key.as_bytes().to_vec();
                var.push(b'=');
                var.extend_from_slice(value.as_bytes());
                CString::new(var).ok()
            })
            .collect()
    }

    pub fn spawn(self) -> PtyResult<PtyProcess> {
        let program = resolve_program(&self.program)?;

        let mut device = PtyDevice::with_config(&self.config);
        match self.master_fd {
            Some(fd) => device.open_fd(fd)?,
            None => device.open()?,
        }
        match (self.size, self.master_fd) {
            (Some(size), _) => device.pty().set_window_size(size)?,
            (None, None) => device.pty().set_window_size(self.config.window_size)?,
            // a shared master keeps whatever size its owner set
            (None, Some(_)) => {}
        }

        let session = self.use_utmp.then(|| (login_name(), remote_host()));

        // Everything the child touches is allocated before forking
        let argv: Vec<&CStr> = self.args.iter().map(|s| s.as_c_str()).collect();
        let envp: Vec<&CStr> = self.env.iter().map(|s| s.as_c_str()).collect();

        // SAFETY: the child only performs the exec sequence below
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Parent { child }) => {
                debug!(
                    "Spawned {:?} as pid {} on {:?}",
                    program,
                    child,
                    device.pty().tty_name()
                );
                Ok(PtyProcess {
                    device,
                    pid: child,
                    use_utmp: self.use_utmp,
                    status: None,
                })
            }
            Ok(ForkResult::Child) => {
                self.exec_child(device.pty(), &program, &argv, &envp, session.as_ref())
            }
            Err(e) => Err(PtyError::Fork(e)),
        }
    }

    /// Runs in the forked child; never returns
    fn exec_child(
        &self,
        pty: &Pty,
        program: &CStr,
        argv: &[&CStr],
        envp: &[&CStr],
        session: Option<&(String, String)>,
    ) -> ! {
        let _ = pty.set_controlling_terminal();

        if let Some((user, remote_host)) = session {
            let _ = pty.login(user, remote_host);
        }

        if let Some(slave) = pty.slave_fd() {
            for (channel, target) in [
                (PtyChannels::STDIN, libc::STDIN_FILENO),
                (PtyChannels::STDOUT, libc::STDOUT_FILENO),
                (PtyChannels::STDERR, libc::STDERR_FILENO),
            ] {
                if self.channels.contains(channel) && dup_onto(slave, target).is_err() {
                    // SAFETY: terminating the forked child without unwinding
                    unsafe { libc::_exit(127) };
                }
            }
        }

        // SAFETY: restoring default dispositions has no handler code to race
        unsafe {
            for sig in [
                Signal::SIGCHLD,
                Signal::SIGHUP,
                Signal::SIGINT,
                Signal::SIGQUIT,
                Signal::SIGTERM,
                Signal::SIGALRM,
                Signal::SIGPIPE,
            ] {
                let _ = signal::signal(sig, SigHandler::SigDfl);
            }
        }
        let _ = SigSet::empty().thread_set_mask();

        if let Some(cwd) = &self.cwd {
            let _ = unistd::chdir(cwd.as_c_str());
        }

        let _ = unistd::execve(program, argv, envp);

        // SAFETY: exec failed; leave without running parent-owned destructors
        unsafe { libc::_exit(127) }
    }
}

/// Make `target` refer to `fd` across exec.
///
/// `dup2` is a no-op when both are the same descriptor, which would leave
/// close-on-exec set, so that case clears the flag instead.
fn dup_onto(fd: RawFd, target: RawFd) -> nix::Result<()> {
    if fd == target {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    } else {
        unistd::dup2(fd, target)?;
    }
    Ok(())
}

/// Find `program` on `PATH` the way a shell would
fn resolve_program(program: &CStr) -> PtyResult<CString> {
    let bytes = program.to_bytes();
    if bytes.is_empty() {
        return Err(PtyError::InvalidArgument("empty program name".to_string()));
    }
    if bytes.contains(&b'/') {
        return Ok(program.to_owned());
    }

    let path = std::env::var_os("PATH").unwrap_or_else(|| "/usr/bin:/bin".into());
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(OsStr::from_bytes(bytes));
        if is_executable(&candidate) {
            return c_string(candidate.as_os_str());
        }
    }

    Err(PtyError::InvalidArgument(format!(
        "{} not found in PATH",
        program.to_string_lossy()
    )))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn login_name() -> String {
    User::from_uid(unistd::getuid())
        .ok()
        .flatten()
        .map(|user| user.name)
        .unwrap_or_default()
}

fn remote_host() -> String {
    std::env::var("DISPLAY").unwrap_or_default()
}

/// A child process running on a PTY
pub struct PtyProcess {
    device: PtyDevice,
    pid: Pid,
    use_utmp: bool,
    status: Option<ExitStatus>,
}

impl PtyProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The transport on the master side
    pub fn pty(&self) -> &PtyDevice {
        &self.device
    }

    pub fn pty_mut(&mut self) -> &mut PtyDevice {
        &mut self.device
    }

    /// Set the window size and notify the child with SIGWINCH
    pub fn resize(&mut self, size: WindowSize) -> PtyResult<()> {
        self.device.pty().set_window_size(size)?;
        self.signal(Signal::SIGWINCH)
    }

    /// Check if the child has exited (non-blocking)
    pub fn try_wait(&mut self) -> PtyResult<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                Ok(Some(self.finish(ExitStatus::from_raw(code << 8))))
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                Ok(Some(self.finish(ExitStatus::from_raw(sig as i32))))
            }
            Ok(_) => Ok(None),
            // reaped elsewhere
            Err(Errno::ECHILD) => Ok(Some(self.finish(ExitStatus::from_raw(0)))),
            Err(e) => Err(PtyError::Wait(e)),
        }
    }

    /// Wait for the child to exit (blocking)
    pub fn wait(&mut self) -> PtyResult<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    return Ok(self.finish(ExitStatus::from_raw(code << 8)))
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    return Ok(self.finish(ExitStatus::from_raw(sig as i32)))
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(self.finish(ExitStatus::from_raw(0))),
                Err(e) => return Err(PtyError::Wait(e)),
            }
        }
    }

    /// Poll for exit until `timeout` elapses
    pub fn wait_timeout(&mut self, timeout: Duration) -> PtyResult<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    pub fn signal(&self, sig: Signal) -> PtyResult<()> {
        signal::kill(self.pid, sig).map_err(PtyError::Signal)
    }

    pub fn terminate(&self) -> PtyResult<()> {
        self.signal(Signal::SIGTERM)
    }

    pub fn kill(&self) -> PtyResult<()> {
        self.signal(Signal::SIGKILL)
    }

    fn finish(&mut self, status: ExitStatus) -> ExitStatus {
        debug!("Child {} exited: {}", self.pid, status);
        self.status = Some(status);
        if self.use_utmp {
            self.logout();
        }
        status
    }

    fn logout(&self) {
        if let Err(e) = self.device.pty().logout() {
            warn!("Failed to remove login record: {}", e);
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.status.is_some() {
            return;
        }
        // Reap if possible; otherwise the session ends with this handle
        if matches!(self.try_wait(), Ok(None)) && self.use_utmp {
            self.logout();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channels() {
        let channels = PtyChannels::STDIN | PtyChannels::STDOUT;
        assert!(channels.contains(PtyChannels::STDIN));
        assert!(channels.contains(PtyChannels::STDOUT));
        assert!(!channels.contains(PtyChannels::STDERR));
        assert!(PtyChannels::ALL.contains(channels));
        assert!(PtyChannels::NONE.is_empty());
        assert_eq!(PtyChannels::default(), PtyChannels::ALL);
    }

    fn is_cloexec(fd: RawFd) -> bool {
        let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
        FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC)
    }

    #[test]
    fn test_dup_onto_same_descriptor_clears_cloexec() {
        let file = tempfile::tempfile().unwrap();
        let fd = std::os::fd::AsRawFd::as_raw_fd(&file);
        assert!(is_cloexec(fd));

        dup_onto(fd, fd).unwrap();
        assert!(!is_cloexec(fd));
    }

    #[test]
    fn test_dup_onto_other_descriptor() {
        let source = tempfile::tempfile().unwrap();
        let target = tempfile::tempfile().unwrap();
        let (src, dst) = (
            std::os::fd::AsRawFd::as_raw_fd(&source),
            std::os::fd::AsRawFd::as_raw_fd(&target),
        );

        dup_onto(src, dst).unwrap();
        // dup2 targets never inherit close-on-exec
        assert!(!is_cloexec(dst));
        assert!(is_cloexec(src));
        let inode = |fd: RawFd| nix::sys::stat::fstat(fd).unwrap().st_ino;
        assert_eq!(inode(src), inode(dst));
    }

    #[test]
    fn test_resolve_program() {
        let sh = resolve_program(&CString::new("sh").unwrap()).unwrap();
        assert!(sh.to_bytes().ends_with(b"/sh"));

        let absolute = resolve_program(&CString::new("/bin/sh").unwrap()).unwrap();
        assert_eq!(absolute.to_bytes(), b"/bin/sh");

        assert!(matches!(
            resolve_program(&CString::new("definitely-not-a-real-program").unwrap()),
            Err(PtyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_env_replaces_existing_key() {
        let builder = ProcessBuilder::new("/bin/true")
            .unwrap()
            .env_clear()
            .env("TERM", "dumb")
            .unwrap()
            .env("TERM", "xterm")
            .unwrap();
        assert_eq!(builder.env.len(), 1);
        assert_eq!(builder.env[0].as_bytes(), b"TERM=xterm");
    }

    #[test]
    fn test_nul_in_argument_is_rejected() {
        let result = ProcessBuilder::new("/bin/echo").unwrap().arg("a\0b");
        assert!(matches!(result, Err(PtyError::InvalidArgument(_))));
    }

    #[test]
    fn test_exit_status() {
        let mut child = ProcessBuilder::shell_command("exit 3")
            .unwrap()
            .spawn()
            .unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.code(), Some(3));
        // cached after the first wait
        assert_eq!(child.try_wait().unwrap(), Some(status));
        assert!(!child.is_running());
    }

    #[test]
    fn test_kill() {
        let mut child = ProcessBuilder::new("sleep")
            .unwrap()
            .arg("30")
            .unwrap()
            .spawn()
            .unwrap();
        assert!(child.is_running());
        child.kill().unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn test_resize_updates_window_size() {
        let mut child = ProcessBuilder::new("sleep")
            .unwrap()
            .arg("30")
            .unwrap()
            .size(WindowSize::new(10, 40))
            .spawn()
            .unwrap();
        assert_eq!(
            child.pty().pty().window_size().unwrap(),
            WindowSize::new(10, 40)
        );

        child.resize(WindowSize::new(50, 160)).unwrap();
        assert_eq!(
            child.pty().pty().window_size().unwrap(),
            WindowSize::new(50, 160)
        );
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
