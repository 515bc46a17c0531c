//! Window size management for PTY

use std::os::unix::io::RawFd;

use serde::{Deserialize, Serialize};

use crate::error::{PtyError, PtyResult};

/// Window size in rows, columns, and pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    /// Number of rows (lines)
    pub rows: u16,
    /// Number of columns (characters per line)
    pub cols: u16,
    /// Width in pixels (optional, can be 0)
    #[serde(default)]
    pub pixel_width: u16,
    /// Height in pixels (optional, can be 0)
    #[serde(default)]
    pub pixel_height: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        WindowSize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    pub fn with_pixels(rows: u16, cols: u16, pixel_width: u16, pixel_height: u16) -> Self {
        WindowSize {
            rows,
            cols,
            pixel_width,
            pixel_height,
        }
    }

    pub fn to_winsize(&self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }

    pub fn from_winsize(ws: libc::winsize) -> Self {
        WindowSize {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }

    /// Apply this size to a terminal descriptor
    pub fn set_on_fd(&self, fd: RawFd) -> PtyResult<()> {
        let ws = self.to_winsize();
        // SAFETY: TIOCSWINSZ reads a winsize that lives for the whole call
        let result = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) };
        if result == -1 {
            Err(PtyError::SetWindowSize(nix::errno::Errno::last()))
        } else {
            Ok(())
        }
    }

    /// Read the size currently set on a terminal descriptor
    pub fn get_from_fd(fd: RawFd) -> PtyResult<Self> {
        let mut ws = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCGWINSZ writes into the winsize we own
        let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
        if result == -1 {
            Err(PtyError::GetWindowSize(nix::errno::Errno::last()))
        } else {
            Ok(WindowSize::from_winsize(ws))
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        WindowSize::new(24, 80)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_size_new() {
        let size = WindowSize::new(24, 80);
        assert_eq!(size.rows, 24);
        assert_eq!(size.cols, 80);
        assert_eq!(size.pixel_width, 0);
        assert_eq!(size.pixel_height, 0);
    }

    #[test]
    fn test_window_size_with_pixels() {
        let size = WindowSize::with_pixels(24, 80, 640, 480);
        assert_eq!(size.pixel_width, 640);
        assert_eq!(size.pixel_height, 480);
    }

    #[test]
    fn test_winsize_conversion() {
        let size = WindowSize::with_pixels(30, 100, 800, 600);
        let ws = size.to_winsize();
        assert_eq!(ws.ws_row, 30);
        assert_eq!(ws.ws_col, 100);
        assert_eq!(ws.ws_xpixel, 800);
        assert_eq!(ws.ws_ypixel, 600);
        assert_eq!(WindowSize::from_winsize(ws), size);
    }

    #[test]
    fn test_set_on_invalid_fd_fails() {
        assert!(WindowSize::default().set_on_fd(-1).is_err());
    }

    #[test]
    fn test_get_from_invalid_fd_fails() {
        assert!(matches!(
            WindowSize::get_from_fd(-1),
            Err(PtyError::GetWindowSize(_))
        ));
    }

    #[test]
    fn test_deserialize_without_pixels() {
        let size: WindowSize = toml::from_str("rows = 40\ncols = 120").unwrap();
        assert_eq!(size, WindowSize::new(40, 120));
    }
}
