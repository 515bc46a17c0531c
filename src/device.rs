//! Buffered, non-blocking transport over a PTY master
//!
//! [`PtyDevice`] keeps a read buffer filled from the master and a write
//! buffer drained into it. The buffers are moved by two pumps that run
//! when the master is readable or writable, either from an external
//! [`EventLoop`](crate::EventLoop) or from the blocking `wait_for_*` calls.
//! Progress is reported through [`PtyEvent`]s delivered to a single
//! registered handler.

use std::collections::VecDeque;
use std::mem;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Once;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{signal, SigHandler, Signal};
use tracing::{debug, warn};

use crate::config::PtyConfig;
use crate::error::{PtyError, PtyResult};
use crate::pty::Pty;
use crate::ring_buffer::{RingBuffer, CHUNK_SIZE};

static IGNORE_SIGPIPE: Once = Once::new();

/// Notification from the pumps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyEvent {
    /// New bytes were appended to the read buffer
    ReadyRead,
    /// The slave side hung up; read monitoring has stopped
    ReadEof,
    /// Bytes left the write buffer
    BytesWritten(usize),
}

type EventHandler = Box<dyn FnMut(&mut PtyDevice, PtyEvent)>;

/// Interest in one readiness direction of the master
#[derive(Debug)]
struct Notifier {
    enabled: bool,
}

/// PTY with buffered non-blocking I/O on the master
pub struct PtyDevice {
    pty: Pty,
    read_buffer: RingBuffer,
    write_buffer: RingBuffer,
    read_notifier: Option<Notifier>,
    write_notifier: Option<Notifier>,
    suspended: bool,
    emitted_ready_read: bool,
    emitted_bytes_written: bool,
    flushed_since_wait: bool,
    handler: Option<EventHandler>,
    dispatching: bool,
    deferred: VecDeque<PtyEvent>,
    read_failure: Option<Errno>,
    write_failure: Option<Errno>,
    last_error: Option<PtyError>,
}

impl Default for PtyDevice {
    fn default() -> Self {
        PtyDevice::new()
    }
}

impl std::fmt::Debug for PtyDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyDevice")
            .field("pty", &self.pty)
            .field("buffered", &self.read_buffer.len())
            .field("pending_write", &self.write_buffer.len())
            .field("suspended", &self.suspended)
            .finish()
    }
}

impl PtyDevice {
    pub fn new() -> Self {
        PtyDevice::from_pty(Pty::new())
    }

    pub fn with_config(config: &PtyConfig) -> Self {
        PtyDevice::from_pty(Pty::with_config(config))
    }

    fn from_pty(pty: Pty) -> Self {
        PtyDevice {
            pty,
            read_buffer: RingBuffer::new(),
            write_buffer: RingBuffer::new(),
            read_notifier: None,
            write_notifier: None,
            suspended: false,
            emitted_ready_read: false,
            emitted_bytes_written: false,
            flushed_since_wait: false,
            handler: None,
            dispatching: false,
            deferred: VecDeque::new(),
            read_failure: None,
            write_failure: None,
            last_error: None,
        }
    }

    /// Allocate a PTY and start monitoring its master
    pub fn open(&mut self) -> PtyResult<()> {
        if self.is_open() {
            return Ok(());
        }
        if let Err(e) = self.pty.open() {
            return Err(self.fail(e));
        }
        self.finish_open()
    }

    /// Share a master descriptor owned by someone else
    pub fn open_fd(&mut self, fd: RawFd) -> PtyResult<()> {
        if let Err(e) = self.pty.open_fd(fd) {
            return Err(self.fail(e));
        }
        self.finish_open()
    }

    fn finish_open(&mut self) -> PtyResult<()> {
        let Some(fd) = self.pty.master_fd() else {
            return Err(PtyError::NotOpen);
        };
        if let Err(e) = set_nonblocking(fd) {
            self.pty.close();
            return Err(self.fail(e));
        }

        self.read_buffer.clear();
        self.read_notifier = Some(Notifier { enabled: true });
        self.write_notifier = Some(Notifier { enabled: false });
        self.suspended = false;
        self.read_failure = None;
        self.write_failure = None;
        self.flushed_since_wait = false;
        self.last_error = None;
        Ok(())
    }

    /// Stop monitoring and close the PTY. Buffered input stays readable.
    pub fn close(&mut self) {
        if !self.pty.is_open() {
            return;
        }
        self.read_notifier = None;
        self.write_notifier = None;
        self.write_buffer.clear();
        self.pty.close();
    }

    pub fn is_open(&self) -> bool {
        self.pty.is_open() && self.read_notifier.is_some()
    }

    pub fn pty(&self) -> &Pty {
        &self.pty
    }

    pub fn pty_mut(&mut self) -> &mut Pty {
        &mut self.pty
    }

    pub fn master_fd(&self) -> Option<RawFd> {
        self.pty.master_fd()
    }

    /// Register the handler that receives [`PtyEvent`]s, replacing any other
    pub fn set_event_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut PtyDevice, PtyEvent) + 'static,
    {
        self.handler = Some(Box::new(handler));
    }

    pub fn clear_event_handler(&mut self) {
        self.handler = None;
    }

    /// Queue bytes for the master. Never blocks and accepts everything.
    pub fn write(&mut self, data: &[u8]) -> PtyResult<usize> {
        if !self.is_open() {
            return Err(PtyError::NotOpen);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let was_idle = self.write_buffer.is_empty();
        self.write_buffer.write(data);
        self.set_write_enabled(true);
        if was_idle {
            self.handle_writable();
        }
        Ok(data.len())
    }

    /// Take up to `max_len` buffered bytes
    pub fn read(&mut self, max_len: usize) -> PtyResult<Vec<u8>> {
        self.check_read_failure()?;
        let mut out = vec![0; max_len.min(self.read_buffer.len())];
        let n = self.read_buffer.read(&mut out);
        out.truncate(n);
        Ok(out)
    }

    pub fn read_into(&mut self, dst: &mut [u8]) -> PtyResult<usize> {
        self.check_read_failure()?;
        Ok(self.read_buffer.read(dst))
    }

    /// Take one line including its newline, or up to `max_len` bytes of a
    /// line that has not been terminated yet
    pub fn read_line(&mut self, max_len: usize) -> PtyResult<Vec<u8>> {
        self.check_read_failure()?;
        let mut out = vec![0; max_len.min(self.read_buffer.len())];
        let n = self.read_buffer.read_line(&mut out);
        out.truncate(n);
        Ok(out)
    }

    pub fn read_all(&mut self) -> PtyResult<Vec<u8>> {
        self.check_read_failure()?;
        Ok(self.read_buffer.read_all())
    }

    pub fn can_read_line(&self) -> bool {
        self.read_buffer.can_read_line()
    }

    /// A recorded read failure surfaces once the buffer has been drained
    fn check_read_failure(&mut self) -> PtyResult<()> {
        if self.read_buffer.is_empty() {
            if let Some(errno) = self.read_failure.take() {
                return Err(PtyError::Read(errno));
            }
        }
        Ok(())
    }

    /// Buffered bytes plus, unless suspended, bytes queued in the kernel
    pub fn bytes_available(&self) -> usize {
        let buffered = self.read_buffer.len();
        match self.pty.master_fd() {
            Some(fd) if self.is_open() && !self.suspended => {
                buffered + bytes_queued(fd).unwrap_or(0)
            }
            _ => buffered,
        }
    }

    pub fn bytes_to_write(&self) -> usize {
        self.write_buffer.len()
    }

    /// Stop (or resume) moving bytes from the master into the read buffer
    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
        if let Some(notifier) = self.read_notifier.as_mut() {
            notifier.enabled = !suspended;
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// The most recent failure, kept until the next successful open
    pub fn last_error(&self) -> Option<&PtyError> {
        self.last_error.as_ref()
    }

    /// Take the most recent failure, clearing any pending write failure
    pub fn take_error(&mut self) -> Option<PtyError> {
        self.write_failure = None;
        self.last_error.take()
    }

    fn read_enabled(&self) -> bool {
        self.read_notifier.as_ref().map_or(false, |n| n.enabled)
    }

    fn write_enabled(&self) -> bool {
        self.write_notifier.as_ref().map_or(false, |n| n.enabled)
    }

    fn set_read_enabled(&mut self, enabled: bool) {
        if let Some(notifier) = self.read_notifier.as_mut() {
            notifier.enabled = enabled;
        }
    }

    fn set_write_enabled(&mut self, enabled: bool) {
        if let Some(notifier) = self.write_notifier.as_mut() {
            notifier.enabled = enabled;
        }
    }

    /// Poll flags for the currently enabled registrations
    pub fn interest(&self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.read_enabled() {
            flags |= PollFlags::POLLIN;
        }
        if self.write_enabled() {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }

    /// Run the pumps matching `revents`. Returns whether either one ran.
    pub fn dispatch(&mut self, revents: PollFlags) -> bool {
        let hangup = PollFlags::POLLHUP | PollFlags::POLLERR;
        let mut ran = false;
        if revents.intersects(PollFlags::POLLIN | hangup) && self.read_enabled() {
            self.handle_readable();
            ran = true;
        }
        if revents.intersects(PollFlags::POLLOUT | hangup) && self.write_enabled() {
            self.handle_writable();
            ran = true;
        }
        ran
    }

    /// Read pump entry point for external readiness sources
    pub fn handle_readable(&mut self) -> bool {
        match self.pump_read() {
            Ok(read) => read,
            Err(e) => {
                self.last_error = Some(PtyError::Read(e));
                false
            }
        }
    }

    /// Write pump entry point for external readiness sources
    pub fn handle_writable(&mut self) -> bool {
        match self.pump_write() {
            Ok(wrote) => wrote,
            Err(e) => {
                self.last_error = Some(PtyError::Write(e));
                false
            }
        }
    }

    /// Move whatever the master has into the read buffer.
    ///
    /// `Ok(false)` covers both EOF and a read that would block.
    fn pump_read(&mut self) -> nix::Result<bool> {
        if !self.read_enabled() {
            return Ok(false);
        }
        let Some(fd) = self.pty.master_fd() else {
            return Ok(false);
        };

        // A shared master may already have been drained by another reader,
        // in which case the read below just reports EAGAIN
        let queued = bytes_queued(fd).unwrap_or(0);
        let wanted = if queued > 0 { queued } else { CHUNK_SIZE };

        let slot = self.read_buffer.reserve(wanted);
        let result = retry_on_eintr(|| nix::unistd::read(fd, &mut slot[..]));

        let read = match result {
            Ok(n) => {
                self.read_buffer.unreserve(wanted - n);
                n
            }
            Err(e) if e == Errno::EAGAIN || e == Errno::EWOULDBLOCK => {
                self.read_buffer.unreserve(wanted);
                return Ok(false);
            }
            // Linux reports a hung-up slave as EIO
            Err(Errno::EIO) => {
                self.read_buffer.unreserve(wanted);
                0
            }
            Err(e) => {
                self.read_buffer.unreserve(wanted);
                self.set_read_enabled(false);
                self.read_failure = Some(e);
                return Err(e);
            }
        };

        if read == 0 {
            debug!("EOF on pty master fd {}", fd);
            self.set_read_enabled(false);
            self.emit(PtyEvent::ReadEof);
            return Ok(false);
        }

        if !self.emitted_ready_read {
            self.emitted_ready_read = true;
            self.emit(PtyEvent::ReadyRead);
            self.emitted_ready_read = false;
        }
        Ok(true)
    }

    /// Push the contiguous head of the write buffer into the master
    fn pump_write(&mut self) -> nix::Result<bool> {
        self.set_write_enabled(false);
        if self.write_buffer.is_empty() {
            return Ok(false);
        }
        let Some(fd) = self.pty.master_fd() else {
            return Ok(false);
        };

        ignore_sigpipe();
        let result = retry_on_eintr(|| nix::unistd::write(fd, self.write_buffer.read_slice()));

        let wrote = match result {
            Ok(n) => n,
            Err(e) if e == Errno::EAGAIN || e == Errno::EWOULDBLOCK => {
                self.set_write_enabled(true);
                return Ok(false);
            }
            Err(e) => {
                warn!("Write to pty master fd {} failed: {}", fd, e);
                self.write_failure = Some(e);
                return Err(e);
            }
        };

        self.write_buffer.free(wrote);
        self.flushed_since_wait = true;

        if !self.emitted_bytes_written {
            self.emitted_bytes_written = true;
            self.emit(PtyEvent::BytesWritten(wrote));
            self.emitted_bytes_written = false;
        }

        if !self.write_buffer.is_empty() {
            self.set_write_enabled(true);
        }
        Ok(true)
    }

    /// Deliver an event. Events raised from inside the handler are queued
    /// and delivered after it returns.
    fn emit(&mut self, event: PtyEvent) {
        if self.dispatching {
            self.deferred.push_back(event);
            return;
        }
        let Some(mut handler) = self.handler.take() else {
            return;
        };

        self.dispatching = true;
        handler(self, event);
        while let Some(event) = self.deferred.pop_front() {
            handler(self, event);
        }
        self.dispatching = false;

        // the handler may have installed a replacement
        if self.handler.is_none() {
            self.handler = Some(handler);
        }
    }

    /// Block until new data has been read into the buffer.
    ///
    /// `None` waits forever. Returns `Ok(false)` when no more data can
    /// arrive, because of EOF or suspension.
    pub fn wait_for_ready_read(&mut self, timeout: Option<Duration>) -> PtyResult<bool> {
        self.wait(timeout, true)
    }

    /// Block until the write buffer has been handed to the kernel.
    ///
    /// Returns `Ok(true)` once everything queued since the previous wait has
    /// been written, including writes that completed inside [`write`](Self::write),
    /// and `Ok(false)` if nothing was queued at all.
    pub fn wait_for_bytes_written(&mut self, timeout: Option<Duration>) -> PtyResult<bool> {
        if let Some(errno) = self.write_failure.take() {
            return Err(PtyError::Write(errno));
        }
        self.wait(timeout, false)?;
        Ok(mem::take(&mut self.flushed_since_wait))
    }

    fn wait(&mut self, timeout: Option<Duration>, reading: bool) -> PtyResult<bool> {
        let fd = match self.pty.master_fd() {
            Some(fd) if self.is_open() => fd,
            _ => return Err(PtyError::NotOpen),
        };
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let waiting = if reading {
                self.read_enabled()
            } else {
                self.wants_write()
            };
            if !waiting {
                break;
            }

            let mut events = PollFlags::empty();
            if self.read_enabled() {
                events |= PollFlags::POLLIN;
            }
            if self.wants_write() {
                events |= PollFlags::POLLOUT;
            }

            let timeout_ms = match deadline {
                None => -1,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    // round up so a sub-millisecond remainder still sleeps
                    let ms = (remaining.as_micros() + 999) / 1000;
                    ms.min(i32::MAX as u128) as i32
                }
            };

            // SAFETY: fd stays open for the duration of the poll
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            let mut fds = [PollFd::new(&borrowed, events)];
            let ready = match poll(&mut fds, timeout_ms) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(self.fail(PtyError::Poll(e))),
            };
            if ready == 0 {
                return Err(self.fail(PtyError::Timeout));
            }

            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if revents.contains(PollFlags::POLLNVAL) {
                return Err(self.fail(PtyError::Poll(Errno::EBADF)));
            }
            let hangup = PollFlags::POLLHUP | PollFlags::POLLERR;

            if revents.intersects(PollFlags::POLLIN | hangup) && self.read_enabled() {
                match self.pump_read() {
                    Ok(true) if reading => return Ok(true),
                    Ok(_) => {}
                    Err(e) => return Err(self.fail(PtyError::Read(e))),
                }
            }

            if revents.intersects(PollFlags::POLLOUT | hangup) && self.wants_write() {
                match self.pump_write() {
                    Ok(_) => {}
                    Err(e) if reading => self.last_error = Some(PtyError::Write(e)),
                    Err(e) => {
                        self.write_failure = None;
                        return Err(self.fail(PtyError::Write(e)));
                    }
                }
            }
        }

        Ok(false)
    }

    /// Pending output that has not already failed
    fn wants_write(&self) -> bool {
        !self.write_buffer.is_empty() && self.write_failure.is_none()
    }

    /// Remember `error` as the latest failure and hand it back
    fn fail(&mut self, error: PtyError) -> PtyError {
        self.last_error = Some(error.clone());
        error
    }
}

impl Drop for PtyDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn ignore_sigpipe() {
    IGNORE_SIGPIPE.call_once(|| {
        // SAFETY: SIG_IGN installs no handler code
        if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
            warn!("Failed to ignore SIGPIPE: {}", e);
        }
    });
}

fn retry_on_eintr<T>(mut op: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match op() {
            Err(Errno::EINTR) => continue,
            result => return result,
        }
    }
}

fn set_nonblocking(fd: RawFd) -> PtyResult<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(PtyError::SetNonBlocking)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(PtyError::SetNonBlocking)?;
    Ok(())
}

/// Bytes the kernel holds for the master's reader
fn bytes_queued(fd: RawFd) -> nix::Result<usize> {
    let mut queued: libc::c_int = 0;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let request = libc::TIOCINQ;
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    let request = libc::TIOCOUTQ;
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd"
    )))]
    let request = libc::FIONREAD;

    // SAFETY: the request writes a single int
    if unsafe { libc::ioctl(fd, request, &mut queued) } == -1 {
        return Err(Errno::last());
    }
    Ok(queued.max(0) as usize)
}
