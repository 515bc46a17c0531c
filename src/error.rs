//! Error types for PTY operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Can't open a pseudo teletype: {0}")]
    AllocationFailed(String),

    #[error("Failed to open PTY master: {0}")]
    OpenMaster(#[source] nix::Error),

    #[error("Failed to grant PTY access: {0}")]
    GrantPty(#[source] nix::Error),

    #[error("Failed to unlock PTY: {0}")]
    UnlockPty(#[source] nix::Error),

    #[error("Failed to determine PTY slave device for fd {fd}: {source}")]
    SlaveName {
        fd: i32,
        #[source]
        source: io::Error,
    },

    #[error("Can't open slave pseudo teletype {path:?}: {source}")]
    OpenSlave {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("Permissions of {path:?} could not be fixed; communication can be eavesdropped")]
    PermissionDenied { path: PathBuf },

    #[error("PTY is already open")]
    AlreadyOpen,

    #[error("PTY is not open")]
    NotOpen,

    #[error("Failed to set controlling terminal: {0}")]
    SetControllingTerminal(#[source] nix::Error),

    #[error("Failed to set window size: {0}")]
    SetWindowSize(#[source] nix::Error),

    #[error("Failed to get window size: {0}")]
    GetWindowSize(#[source] nix::Error),

    #[error("Failed to access terminal attributes: {0}")]
    Termios(#[source] nix::Error),

    #[error("Failed to set non-blocking mode: {0}")]
    SetNonBlocking(#[source] nix::Error),

    #[error("Error reading from PTY: {0}")]
    Read(#[source] nix::Error),

    #[error("Error writing to PTY: {0}")]
    Write(#[source] nix::Error),

    #[error("Failed to poll PTY: {0}")]
    Poll(#[source] nix::Error),

    #[error("No device has a registration that can become ready")]
    Idle,

    #[error("PTY operation timed out")]
    Timeout,

    #[error("Failed to fork process: {0}")]
    Fork(#[source] nix::Error),

    #[error("Failed to wait for child: {0}")]
    Wait(#[source] nix::Error),

    #[error("Failed to signal child: {0}")]
    Signal(#[source] nix::Error),

    #[error("Invalid argument for child process: {0}")]
    InvalidArgument(String),

    #[error("Session accounting failed: {0}")]
    Accounting(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// io::Error is not Clone; keep its kind, errno and message
fn clone_io(e: &io::Error) -> io::Error {
    match e.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(e.kind(), e.to_string()),
    }
}

impl Clone for PtyError {
    fn clone(&self) -> Self {
        use PtyError::*;

        match self {
            AllocationFailed(msg) => AllocationFailed(msg.clone()),
            OpenMaster(e) => OpenMaster(*e),
            GrantPty(e) => GrantPty(*e),
            UnlockPty(e) => UnlockPty(*e),
            SlaveName { fd, source } => SlaveName {
                fd: *fd,
                source: clone_io(source),
            },
            OpenSlave { path, source } => OpenSlave {
                path: path.clone(),
                source: *source,
            },
            PermissionDenied { path } => PermissionDenied { path: path.clone() },
            AlreadyOpen => AlreadyOpen,
            NotOpen => NotOpen,
            SetControllingTerminal(e) => SetControllingTerminal(*e),
            SetWindowSize(e) => SetWindowSize(*e),
            GetWindowSize(e) => GetWindowSize(*e),
            Termios(e) => Termios(*e),
            SetNonBlocking(e) => SetNonBlocking(*e),
            Read(e) => Read(*e),
            Write(e) => Write(*e),
            Poll(e) => Poll(*e),
            Idle => Idle,
            Timeout => Timeout,
            Fork(e) => Fork(*e),
            Wait(e) => Wait(*e),
            Signal(e) => Signal(*e),
            InvalidArgument(msg) => InvalidArgument(msg.clone()),
            Accounting(msg) => Accounting(msg.clone()),
            Io(e) => Io(clone_io(e)),
        }
    }
}

impl PtyError {
    /// Whether this error came from a failed read or write on the master.
    pub fn is_io(&self) -> bool {
        matches!(self, PtyError::Read(_) | PtyError::Write(_) | PtyError::Io(_))
    }
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn test_clone_keeps_variant_and_errno() {
        let err = PtyError::SlaveName {
            fd: 7,
            source: io::Error::from_raw_os_error(libc::ENOTTY),
        };
        match err.clone() {
            PtyError::SlaveName { fd, source } => {
                assert_eq!(fd, 7);
                assert_eq!(source.raw_os_error(), Some(libc::ENOTTY));
            }
            other => panic!("unexpected variant: {:?}", other),
        }

        assert!(matches!(
            PtyError::Read(Errno::EIO).clone(),
            PtyError::Read(Errno::EIO)
        ));
        let io_err = PtyError::Io(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(io_err.clone().to_string(), io_err.to_string());
    }

    #[test]
    fn test_window_size_messages() {
        assert!(PtyError::GetWindowSize(Errno::EBADF)
            .to_string()
            .starts_with("Failed to get window size"));
        assert!(PtyError::SetWindowSize(Errno::EBADF)
            .to_string()
            .starts_with("Failed to set window size"));
    }
}
