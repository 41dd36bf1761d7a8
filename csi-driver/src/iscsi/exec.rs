//! Serialized invoker of external storage CLIs.
//!
//! `iscsiadm` mutates a shared on-disk node database and concurrent
//! invocations corrupt its records; `multipath -f` races with `multipathd`
//! udev handlers. Every external command therefore runs under one
//! process-wide lock, no matter which component issues it.

use std::process::Command;
use std::sync::Mutex;

use tracing::{debug, error};

use super::error::{IscsiError, Result};

static COMMAND_LOCK: Mutex<()> = Mutex::new(());

/// Run `cmd` with `args` as a single shell-interpreted string, so call sites
/// can use pipelines (`| grep`, `| awk`) and redirections. Returns stdout;
/// a nonzero exit becomes an error carrying stderr.
pub fn run(cmd: &str, args: &str) -> Result<String> {
    run_inner(cmd, args, true)
}

/// Like [`run`] but logs neither the argument string nor stdout. Used for
/// commands whose arguments or output carry credentials, and for show
/// commands whose output repeats on every attach.
pub fn run_quietly(cmd: &str, args: &str) -> Result<String> {
    run_inner(cmd, args, false)
}

fn run_inner(cmd: &str, args: &str, log_output: bool) -> Result<String> {
    let _guard = COMMAND_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    let line = format!("{cmd} {args}");
    if log_output {
        debug!(command = %line, "running serialized command");
    } else {
        debug!(command = %cmd, "running serialized command");
    }

    // Errors and failure logs carry only the command name in quiet mode so
    // credential-bearing argument strings never reach logs or messages.
    let reportable = if log_output { line.clone() } else { cmd.to_string() };

    let output = Command::new("sh").arg("-c").arg(&line).output().map_err(|e| {
        error!(command = %reportable, error = %e, "failed to spawn command");
        IscsiError::HostEnvironment(format!("failed to spawn '{reportable}': {e}"))
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        error!(command = %reportable, stderr = %stderr, "command failed");
        return Err(IscsiError::CommandFailed { command: reportable, stderr });
    }

    if log_output {
        debug!(command = %cmd, stdout = %stdout.trim(), "command completed");
    }
    Ok(stdout)
}
