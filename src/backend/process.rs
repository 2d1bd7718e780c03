//! Shell command runner with an output cap and a deadline
//!
//! Shared by the local backend and the in-sandbox server so both report
//! timeouts and truncation the same way.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::ExecOutput;

/// Exit code reported for a command killed at its deadline
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long to keep reading pipes after the shell exits
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct ExecLimits {
    pub timeout: Duration,
    /// Per-stream cap on captured bytes
    pub max_output_bytes: usize,
}

/// Run `command` with `sh -c` in `workdir`
///
/// # Arguments
/// * `command` - Shell command line
/// * `workdir` - Working directory of the shell
/// * `limits` - Deadline and output cap
///
/// # Returns
/// ExecOutput with exit code 124 and `timed_out` set when the deadline
/// fired; output captured up to that point is kept.
pub async fn run_shell(
    command: &str,
    workdir: &Path,
    limits: ExecLimits,
) -> std::io::Result<ExecOutput> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group so the whole pipeline can be killed at the deadline
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id();

    let stdout = tokio::spawn(read_capped(child.stdout.take(), limits.max_output_bytes));
    let stderr = tokio::spawn(read_capped(child.stderr.take(), limits.max_output_bytes));

    let (exit_code, timed_out) = match timeout(limits.timeout, child.wait()).await {
        Ok(status) => (exit_code(status?), false),
        Err(_) => {
            warn!(pid, timeout_secs = limits.timeout.as_secs(), "Command timed out, killing");
            kill_group(pid);
            let _ = child.kill().await;
            (TIMEOUT_EXIT_CODE, true)
        }
    };

    let (stdout, out_truncated) = collect(stdout).await;
    let (stderr, err_truncated) = collect(stderr).await;

    debug!(exit_code, timed_out, stdout_len = stdout.len(), stderr_len = stderr.len(), "Command finished");

    Ok(ExecOutput {
        stdout,
        stderr,
        exit_code,
        truncated: out_truncated || err_truncated,
        timed_out,
    })
}

/// Read everything from `reader`, keeping at most `cap` bytes
///
/// Bytes past the cap are read and discarded so the child never blocks on a
/// full pipe.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> (Vec<u8>, bool) {
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    (kept, truncated)
}

async fn collect(task: tokio::task::JoinHandle<(Vec<u8>, bool)>) -> (String, bool) {
    // A background grandchild may hold the pipe open; stop waiting after a grace period
    match timeout(DRAIN_GRACE, task).await {
        Ok(Ok((bytes, truncated))) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
        _ => (String::new(), false),
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: signalling a process group we created; a stale id only yields ESRCH
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(timeout_ms: u64, cap: usize) -> ExecLimits {
        ExecLimits {
            timeout: Duration::from_millis(timeout_ms),
            max_output_bytes: cap,
        }
    }

    #[tokio::test]
    async fn test_captures_streams_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell("echo out; echo err >&2; exit 3", dir.path(), limits(5000, 1024))
            .await
            .unwrap();
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.exit_code, 3);
        assert!(!out.truncated);
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell("yes x | head -c 100000", dir.path(), limits(5000, 64))
            .await
            .unwrap();
        assert_eq!(out.stdout.len(), 64);
        assert!(out.truncated);
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell("echo started; sleep 30", dir.path(), limits(300, 1024))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(out.stdout, "started\n");
    }

    #[tokio::test]
    async fn test_runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = run_shell("ls", dir.path(), limits(5000, 1024)).await.unwrap();
        assert!(out.stdout.contains("marker.txt"));
    }
}
