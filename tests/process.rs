//! End-to-end tests: child processes talking through the line discipline

use std::time::{Duration, Instant};

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use ptyio::{
    Accounting, HelperVerbs, ProcessBuilder, PtyChannels, PtyConfig, PtyDevice, PtyError,
    PtyEvent, PtyProcess,
};

/// Collect output until EOF or the deadline
fn read_to_eof(device: &mut PtyDevice, timeout: Duration) -> Vec<u8> {
    let mut out = Vec::new();
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match device.wait_for_ready_read(Some(remaining)) {
            Ok(true) => out.extend(device.read_all().unwrap()),
            Ok(false) | Err(PtyError::Timeout) => break,
            Err(e) => panic!("wait failed: {}", e),
        }
    }
    out.extend(device.read_all().unwrap());
    out
}

fn spawn(builder: ProcessBuilder) -> PtyProcess {
    let mut child = builder.spawn().expect("failed to spawn");
    // leave the slave to the child so its exit shows up as EOF
    child.pty_mut().pty_mut().close_slave();
    child
}

#[test]
fn test_shell_echo() {
    let mut child = spawn(ProcessBuilder::shell_command("echo hi").unwrap());

    let output = read_to_eof(child.pty_mut(), Duration::from_secs(5));
    assert_eq!(output, b"hi\r\n");
    assert_eq!(child.wait().unwrap().code(), Some(0));
}

#[test]
fn test_input_through_line_discipline() {
    let mut child =
        ProcessBuilder::shell_command(r#"read VAL; echo "1: $VAL"; read VAL; echo "2: $VAL""#)
            .unwrap()
            .spawn()
            .unwrap();
    // no echo, so only the script's own output comes back
    child.pty().pty().set_echo(false).unwrap();
    child.pty_mut().pty_mut().close_slave();

    child.pty_mut().write(b"test\n").unwrap();
    child.pty_mut().write(b"test\n").unwrap();

    let output = read_to_eof(child.pty_mut(), Duration::from_secs(5));
    assert_eq!(output, b"1: test\r\n2: test\r\n");
    assert!(child.wait().unwrap().success());
}

#[test]
fn test_controlling_terminal() {
    // the child holds no slave descriptor until it opens /dev/tty, so keep
    // ours open instead of waiting for EOF
    let mut child = ProcessBuilder::shell_command("echo this is a test > /dev/tty")
        .unwrap()
        .channels(PtyChannels::NONE)
        .spawn()
        .unwrap();

    let mut output = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !output.ends_with(b"\r\n") && Instant::now() < deadline {
        let _ = child
            .pty_mut()
            .wait_for_ready_read(Some(Duration::from_millis(200)));
        output.extend(child.pty_mut().read_all().unwrap());
    }
    assert_eq!(output, b"this is a test\r\n");
    assert!(child.wait().unwrap().success());
}

#[test]
fn test_events_from_child() {
    let mut child = spawn(ProcessBuilder::shell_command("printf done").unwrap());

    let events = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = std::rc::Rc::clone(&events);
    child
        .pty_mut()
        .set_event_handler(move |_, event| sink.borrow_mut().push(event));

    let output = read_to_eof(child.pty_mut(), Duration::from_secs(5));
    assert_eq!(output, b"done");

    let events = events.borrow();
    assert!(events.contains(&PtyEvent::ReadyRead));
    assert_eq!(events.last(), Some(&PtyEvent::ReadEof));
    assert_eq!(
        events.iter().filter(|e| **e == PtyEvent::ReadEof).count(),
        1
    );
}

#[test]
fn test_shared_master_process() {
    let mut first = ProcessBuilder::new("sleep")
        .unwrap()
        .arg("10")
        .unwrap()
        .spawn()
        .unwrap();
    first.pty_mut().set_suspended(true);

    let master = first.pty().master_fd().unwrap();
    let mut second = ProcessBuilder::shell_command("echo hello from me")
        .unwrap()
        .master_fd(master)
        .spawn()
        .unwrap();

    let mut output = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !output.ends_with(b"\r\n") && Instant::now() < deadline {
        let _ = second
            .pty_mut()
            .wait_for_ready_read(Some(Duration::from_millis(200)));
        output.extend(second.pty_mut().read_all().unwrap());
    }
    assert_eq!(output, b"hello from me\r\n");
    assert_eq!(first.pty().bytes_available(), 0);
    assert!(second.wait().unwrap().success());

    drop(second);
    // the adopted master outlives the second session
    assert!(first.pty().is_open());
    first.kill().unwrap();
    first.wait().unwrap();
}

#[test]
fn test_working_directory_and_env() {
    let dir = tempfile::tempdir().unwrap();
    let mut child = spawn(
        ProcessBuilder::shell_command(r#"printf '%s:%s' "$(pwd -P)" "$PTYIO_TEST""#)
            .unwrap()
            .current_dir(dir.path())
            .unwrap()
            .env("PTYIO_TEST", "value")
            .unwrap(),
    );

    let output = read_to_eof(child.pty_mut(), Duration::from_secs(5));
    let expected = format!(
        "{}:value",
        dir.path().canonicalize().unwrap().display()
    );
    assert_eq!(String::from_utf8_lossy(&output), expected);
}

/// A utempter stand-in that appends each invocation's arguments to `log`
fn accounting_config(dir: &Path) -> (PtyConfig, PathBuf) {
    let log = dir.join("sessions");
    let helper = dir.join("utempter");
    fs::write(
        &helper,
        format!("#!/bin/sh\necho \"$1\" >> {}\n", log.display()),
    )
    .unwrap();
    fs::set_permissions(&helper, fs::Permissions::from_mode(0o755)).unwrap();

    let config = PtyConfig {
        grant_helper: None,
        accounting: Accounting::Utempter {
            path: helper,
            verbs: HelperVerbs::Utempter,
        },
        ..PtyConfig::default()
    };
    (config, log)
}

fn session_log(log: &Path) -> Vec<String> {
    fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(|line| line.trim().to_string())
        .collect()
}

/// Wait for the child to record its login
fn wait_for_login(log: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while session_log(log).is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_login_before_exit_logout_after_wait() {
    let dir = tempfile::tempdir().unwrap();
    let (config, log) = accounting_config(dir.path());

    let mut child = ProcessBuilder::new("sleep")
        .unwrap()
        .arg("0.3")
        .unwrap()
        .config(config)
        .use_utmp(true)
        .spawn()
        .unwrap();

    wait_for_login(&log);
    assert_eq!(session_log(&log), ["add"]);
    assert!(child.is_running());

    assert!(child.wait().unwrap().success());
    assert_eq!(session_log(&log), ["add", "del"]);

    // a second wait does not log out again
    child.wait().unwrap();
    assert_eq!(session_log(&log), ["add", "del"]);
}

#[test]
fn test_logout_when_dropped_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let (config, log) = accounting_config(dir.path());

    let child = ProcessBuilder::new("sleep")
        .unwrap()
        .arg("10")
        .unwrap()
        .config(config)
        .use_utmp(true)
        .spawn()
        .unwrap();
    let pid = child.pid();

    wait_for_login(&log);
    assert_eq!(session_log(&log), ["add"]);

    drop(child);
    assert_eq!(session_log(&log), ["add", "del"]);

    let _ = kill(pid, Signal::SIGKILL);
    let _ = waitpid(pid, None);
}

#[test]
fn test_no_records_without_utmp() {
    let dir = tempfile::tempdir().unwrap();
    let (config, log) = accounting_config(dir.path());

    let mut child = ProcessBuilder::shell_command("exit 0")
        .unwrap()
        .config(config)
        .spawn()
        .unwrap();
    child.wait().unwrap();
    assert!(session_log(&log).is_empty());
}
