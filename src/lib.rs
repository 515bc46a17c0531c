//! Pseudo-terminal allocation and buffered PTY I/O for Unix
//!
//! - `pty`: allocate master/slave pairs, adopt existing masters, slave-side
//!   control (controlling terminal, echo, attributes, window size, login records)
//! - `device`: non-blocking buffered transport over a master with event callbacks
//! - `event_loop`: `poll(2)` readiness source driving one or more devices
//! - `process`: spawn a child on the slave side
//! - `ring_buffer`: chunked byte queue backing the device buffers

pub mod config;
pub mod device;
pub mod error;
pub mod event_loop;
pub mod process;
pub mod pty;
pub mod ring_buffer;
pub mod size;

pub use config::{ConfigError, PtyConfig};
pub use device::{PtyDevice, PtyEvent};
pub use error::{PtyError, PtyResult};
pub use event_loop::EventLoop;
pub use process::{ProcessBuilder, PtyChannels, PtyProcess};
pub use pty::{Accounting, HelperVerbs, Pty, Strategy};
pub use ring_buffer::RingBuffer;
pub use size::WindowSize;
