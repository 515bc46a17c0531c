//! pty-relay - run a shell on a PTY and relay stdin/stdout through it
//!
//! Reads from stdin on a helper thread; everything else is driven by the
//! poll-based event loop on the main thread.

use std::cell::Cell;
use std::io::{self, IsTerminal, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use ptyio::{EventLoop, ProcessBuilder, PtyConfig, PtyEvent, WindowSize};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut cols: Option<u16> = None;
    let mut rows: Option<u16> = None;
    let mut shell: Option<String> = None;
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--cols" => {
                i += 1;
                cols = args.get(i).and_then(|v| v.parse().ok());
            }
            "-r" | "--rows" => {
                i += 1;
                rows = args.get(i).and_then(|v| v.parse().ok());
            }
            "-s" | "--shell" => {
                i += 1;
                shell = args.get(i).cloned();
            }
            "--config" => {
                i += 1;
                config_path = args.get(i).map(PathBuf::from);
            }
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                return ExitCode::FAILURE;
            }
        }
        i += 1;
    }

    let config = match PtyConfig::load_with_path(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let size = WindowSize::new(
        rows.unwrap_or(config.window_size.rows),
        cols.unwrap_or(config.window_size.cols),
    );

    let builder = match &shell {
        Some(s) => ProcessBuilder::new(s),
        None => ProcessBuilder::default_shell(),
    };
    let use_utmp = config.accounting.is_enabled();
    let spawned = builder.and_then(|b| b.size(size).use_utmp(use_utmp).config(config).spawn());
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            eprintln!("Failed to spawn PTY: {}", e);
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        "Relaying {}x{} session, child PID: {}",
        size.cols,
        size.rows,
        child.pid()
    );

    // Only the child should hold the slave, so EOF arrives when it exits
    child.pty_mut().pty_mut().close_slave();

    // The child's line discipline does the echoing and editing
    let _raw_guard = if io::stdin().is_terminal() {
        match RawModeGuard::new() {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::warn!("Failed to put stdin into raw mode: {}", e);
                None
            }
        }
    } else {
        None
    };

    let hung_up = Rc::new(Cell::new(false));
    let eof = Rc::clone(&hung_up);
    child.pty_mut().set_event_handler(move |device, event| match event {
        PtyEvent::ReadyRead => {
            let data = device.read_all().unwrap_or_default();
            let mut stdout = io::stdout();
            let _ = stdout.write_all(&data);
            let _ = stdout.flush();
        }
        PtyEvent::ReadEof => eof.set(true),
        PtyEvent::BytesWritten(_) => {}
    });

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    while !hung_up.get() {
        while let Ok(input) = rx.try_recv() {
            if let Err(e) = child.pty_mut().write(&input) {
                tracing::error!("Write error: {}", e);
                break;
            }
        }

        let tick = Some(Duration::from_millis(50));
        if let Err(e) = EventLoop::poll_once(&mut [child.pty_mut()], tick) {
            tracing::error!("Poll error: {}", e);
            break;
        }
    }

    match child.wait() {
        Ok(status) => {
            tracing::info!("Child exited: {}", status);
            match (status.code(), status.signal()) {
                (Some(0), _) => ExitCode::SUCCESS,
                (Some(code), _) => ExitCode::from(code as u8),
                (None, Some(sig)) => ExitCode::from((128 + sig) as u8),
                (None, None) => ExitCode::FAILURE,
            }
        }
        Err(e) => {
            tracing::error!("Wait error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Puts stdin into raw mode and restores the original settings on drop
struct RawModeGuard {
    original: nix::sys::termios::Termios,
}

impl RawModeGuard {
    fn new() -> nix::Result<Self> {
        use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices};

        let original = termios::tcgetattr(io::stdin())?;

        let mut raw = original.clone();
        raw.local_flags
            .remove(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG | LocalFlags::IEXTEN);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &raw)?;

        Ok(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        use nix::sys::termios::{self, SetArg};

        if let Err(e) = termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &self.original) {
            tracing::warn!("Failed to restore terminal settings: {}", e);
        }
    }
}

fn print_help() {
    println!("pty-relay - run a shell on a pseudo-terminal");
    println!();
    println!("Usage: pty-relay [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --cols <N>       Set terminal width (default: from config, 80)");
    println!("  -r, --rows <N>       Set terminal height (default: from config, 24)");
    println!("  -s, --shell <PATH>   Shell to spawn (default: $SHELL or /bin/sh)");
    println!("      --config <FILE>  Read settings from FILE instead of the default location");
    println!("  -h, --help           Show this help message");
    println!();
    println!("Environment:");
    println!("  PTYIO_GRANT_HELPER   Permission helper for legacy devices (empty disables)");
    println!("  PTYIO_UTEMPTER       Record sessions through this utempter helper");
    println!("  PTYIO_NO_CTTY        Do not give the shell a controlling terminal");
    println!("  RUST_LOG             Log filter (default: info)");
}
