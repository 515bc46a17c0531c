//! External helper that fixes ownership of legacy slave devices.
//!
//! Invoked as `<helper> --grant <fd>` after allocation and
//! `<helper> --revoke <fd>` on close, with the master inherited at `<fd>`.

use std::os::fd::RawFd;
use std::path::Path;
use std::process::Command;

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GrantOp {
    Grant,
    Revoke,
}

impl GrantOp {
    fn flag(self) -> &'static str {
        match self {
            GrantOp::Grant => "--grant",
            GrantOp::Revoke => "--revoke",
        }
    }
}

/// Run the helper and wait for it. Returns whether it exited successfully.
///
/// The master descriptor must not be close-on-exec at this point.
pub(crate) fn run(helper: Option<&Path>, op: GrantOp, master_fd: RawFd) -> bool {
    let Some(helper) = helper else {
        debug!("no grant helper configured, skipping {}", op.flag());
        return false;
    };

    match Command::new(helper)
        .arg(op.flag())
        .arg(master_fd.to_string())
        .status()
    {
        Ok(status) if status.success() => true,
        Ok(status) => {
            debug!("{:?} {} exited with {}", helper, op.flag(), status);
            false
        }
        Err(e) => {
            warn!("Failed to run grant helper {:?}: {}", helper, e);
            false
        }
    }
}
