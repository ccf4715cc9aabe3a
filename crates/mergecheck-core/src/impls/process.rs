//! Child process execution with a deadline and captured output.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::ports::{ExecResult, ExecStatus};

/// How long to keep draining pipes after a timed-out child was killed.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Spawns `cmd`, feeds it `stdin`, and waits at most `timeout`.
///
/// On timeout the child's whole process group is killed and
/// `ExecStatus::TimedOut` is returned with whatever output was produced.
pub(crate) async fn run(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
) -> std::io::Result<ExecResult> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let started = Instant::now();
    let mut child = cmd.spawn()?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        tokio::spawn(async move {
            // The child may exit without reading everything.
            let _ = pipe.write_all(&input).await;
            let _ = pipe.shutdown().await;
        });
    }

    let stdout = tokio::spawn(read_all(child.stdout.take()));
    let stderr = tokio::spawn(read_all(child.stderr.take()));

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => ExecStatus::Exited(exit_code(status?)),
        Err(_) => {
            kill_group(child.id()).await;
            let _ = child.kill().await;
            ExecStatus::TimedOut
        }
    };

    let stdout = drain(stdout).await;
    let stderr = drain(stderr).await;

    Ok(ExecResult {
        status,
        stdout,
        stderr,
        duration: started.elapsed(),
    })
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn drain(handle: tokio::task::JoinHandle<String>) -> String {
    match tokio::time::timeout(DRAIN_GRACE, handle).await {
        Ok(Ok(output)) => output,
        _ => String::new(),
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
async fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = Command::new("kill")
            .arg("-KILL")
            .arg(format!("-{pid}"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
}

#[cfg(not(unix))]
async fn kill_group(_pid: Option<u32>) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_exit_code_and_streams() {
        let result = run(sh("echo out; echo err >&2; exit 3"), None, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.status, ExecStatus::Exited(3));
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let result = run(sh("cat"), Some(b"hello".to_vec()), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn kills_on_timeout() {
        let started = Instant::now();
        let result = run(sh("echo begin; sleep 30; echo end"), None, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(result.status, ExecStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!result.stdout.contains("end"));
    }
}
