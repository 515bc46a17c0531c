//! poll(2)-driven readiness source for one or more devices

use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use tracing::trace;

use crate::device::PtyDevice;
use crate::error::{PtyError, PtyResult};

/// Drives the read and write pumps of a set of devices
#[derive(Debug, Default, Clone, Copy)]
pub struct EventLoop;

impl EventLoop {
    /// Wait once for readiness on every enabled registration and dispatch it.
    ///
    /// Returns how many devices had a pump run. Fails with
    /// [`PtyError::Idle`] when no registration is enabled and `timeout` is
    /// `None`. Devices sharing a master may
    /// both be reported readable when only one of them gets the bytes.
    pub fn poll_once(
        devices: &mut [&mut PtyDevice],
        timeout: Option<Duration>,
    ) -> PtyResult<usize> {
        let mut slots = Vec::with_capacity(devices.len());
        for (index, device) in devices.iter().enumerate() {
            let interest = device.interest();
            if let (Some(fd), false) = (device.master_fd(), interest.is_empty()) {
                // SAFETY: the device keeps the descriptor open across the poll
                slots.push((index, unsafe { BorrowedFd::borrow_raw(fd) }, interest));
            }
        }

        // Nothing can become ready, so an unbounded wait would never end
        if slots.is_empty() {
            let Some(timeout) = timeout else {
                return Err(PtyError::Idle);
            };
            std::thread::sleep(timeout);
            return Ok(0);
        }

        let mut fds: Vec<PollFd> = slots
            .iter()
            .map(|(_, fd, interest)| PollFd::new(fd, *interest))
            .collect();

        let ready = match poll(&mut fds, timeout_ms(timeout)) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(0),
            Err(e) => return Err(PtyError::Poll(e)),
        };
        if ready == 0 {
            return Ok(0);
        }

        let fired: Vec<(usize, PollFlags)> = fds
            .iter()
            .zip(&slots)
            .filter_map(|(pfd, (index, _, _))| {
                pfd.revents()
                    .filter(|revents| !revents.is_empty())
                    .map(|revents| (*index, revents))
            })
            .collect();
        drop(fds);

        let mut active = 0;
        for (index, revents) in fired {
            trace!("device {} ready: {:?}", index, revents);
            if devices[index].dispatch(revents) {
                active += 1;
            }
        }
        Ok(active)
    }

    /// Keep polling until `done` returns true or `timeout` expires.
    ///
    /// Returns whether `done` was satisfied. Without a timeout, `done` gets
    /// one chance to re-enable a device once everything has gone idle.
    pub fn run_until<F>(
        devices: &mut [&mut PtyDevice],
        timeout: Option<Duration>,
        mut done: F,
    ) -> PtyResult<bool>
    where
        F: FnMut(&mut [&mut PtyDevice]) -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if done(devices) {
                return Ok(true);
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            Self::poll_once(devices, remaining)?;
        }
    }
}

fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => ((t.as_micros() + 999) / 1000).min(i32::MAX as u128) as i32,
    }
}
