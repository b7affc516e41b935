//! Child process execution with optional timeouts and bounded output.

use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured output of a finished (or killed) child process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes dropped from stdout + stderr because of the output limit.
    pub truncated: usize,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stdout followed by stderr, with notes for truncation and timeouts.
    pub fn combined_log(&self) -> String {
        let mut buf = String::from_utf8_lossy(&self.stdout).into_owned();
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.truncated > 0 {
            buf.push_str(&format!("\n[output truncated {} bytes]\n", self.truncated));
        }
        if self.timed_out {
            buf.push_str("\n[process timed out]\n");
        }
        buf
    }
}

/// Run `cmd` to completion and capture its output.
///
/// Pipes are drained on reader threads while the child runs so a chatty build
/// cannot deadlock. `timeout = None` waits indefinitely; on expiry the child is
/// killed and `timed_out` is set. Bytes past `output_limit_bytes` per stream are
/// discarded.
#[instrument(skip_all, fields(timeout_secs = timeout.map(|t| t.as_secs()), output_limit_bytes))]
pub fn run_captured(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
) -> Result<ProcessOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    let pipes = match take_pipes(&mut child, stdin, output_limit_bytes) {
        Ok(pipes) => pipes,
        Err(err) => {
            reap(&mut child);
            return Err(err);
        }
    };

    let mut timed_out = false;
    let waited = match timeout {
        None => child.wait().context("wait for command"),
        Some(limit) => match child.wait_timeout(limit).context("wait for command") {
            Ok(Some(status)) => Ok(status),
            Ok(None) => {
                warn!(timeout_secs = limit.as_secs(), "command timed out, killing");
                timed_out = true;
                if let Err(err) = child.kill() {
                    debug!(err = %err, "kill after timeout");
                }
                child.wait().context("wait command after kill")
            }
            Err(err) => Err(err),
        },
    };
    let status = match waited {
        Ok(status) => status,
        Err(err) => {
            reap(&mut child);
            return Err(err);
        }
    };

    if let Some(writer) = pipes.stdin {
        if timed_out {
            // Exits on EPIPE once every holder of the pipe is gone.
            drop(writer);
        } else {
            join_writer(writer);
        }
    }
    let (stdout, stdout_truncated) = join_reader(pipes.stdout).context("join stdout")?;
    let (stderr, stderr_truncated) = join_reader(pipes.stderr).context("join stderr")?;
    let truncated = stdout_truncated + stderr_truncated;
    if truncated > 0 {
        warn!(truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        truncated,
        timed_out,
    })
}

type Reader = thread::JoinHandle<Result<(Vec<u8>, usize)>>;

struct Pipes {
    stdin: Option<thread::JoinHandle<std::io::Result<()>>>,
    stdout: Reader,
    stderr: Reader,
}

/// Start the stdin writer and the output drains so the child can never block
/// on a full pipe while we wait on it.
fn take_pipes(child: &mut Child, stdin: Option<&[u8]>, limit: usize) -> Result<Pipes> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdin = match stdin {
        Some(input) => {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            // Dropping `pipe` at the end of the thread closes it so the child sees EOF.
            Some(thread::spawn(move || pipe.write_all(&input)))
        }
        None => None,
    };
    Ok(Pipes {
        stdin,
        stdout: thread::spawn(move || read_limited(stdout, limit)),
        stderr: thread::spawn(move || read_limited(stderr, limit)),
    })
}

/// Best-effort kill and wait so an error path never leaves a running child.
fn reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill after error");
    }
    if let Err(err) = child.wait() {
        debug!(err = %err, "wait after error");
    }
}

/// A child may exit without reading all of its input; that is not an error.
fn join_writer(handle: thread::JoinHandle<std::io::Result<()>>) {
    match handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.kind() == ErrorKind::BrokenPipe => {
            debug!("child closed stdin before reading all input");
        }
        Ok(Err(err)) => warn!(err = %err, "writing stdin failed"),
        Err(_) => warn!("stdin writer thread panicked"),
    }
}

fn join_reader(handle: Reader) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let out = run_captured(sh("echo out; echo err 1>&2; exit 3"), None, None, 1000)
            .expect("run");
        assert_eq!(out.status.code(), Some(3));
        assert!(!out.success());
        let log = out.combined_log();
        assert!(log.contains("out"));
        assert!(log.contains("err"));
    }

    #[test]
    fn feeds_stdin() {
        let out = run_captured(sh("cat"), Some(b"hello"), None, 1000).expect("run");
        assert!(out.success());
        assert_eq!(out.stdout_lossy(), "hello");
    }

    #[test]
    fn truncates_beyond_limit() {
        let out = run_captured(sh("printf 0123456789"), None, None, 4).expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.truncated, 6);
        assert!(out.combined_log().contains("[output truncated 6 bytes]"));
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_captured(sh("exec sleep 5"), None, Some(Duration::from_millis(100)), 1000)
            .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn timeout_holds_while_child_ignores_large_stdin() {
        let input = vec![b'x'; 200_000];
        let started = std::time::Instant::now();
        let out = run_captured(
            sh("exec sleep 5"),
            Some(&input),
            Some(Duration::from_millis(200)),
            1000,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn child_exiting_without_reading_stdin_is_not_an_error() {
        let input = vec![b'x'; 200_000];
        let out = run_captured(sh("echo done"), Some(&input), Some(Duration::from_secs(5)), 1000)
            .expect("run");
        assert!(out.success());
        assert_eq!(out.stdout_lossy(), "done\n");
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_captured(
            Command::new("definitely-not-a-real-binary-fixloop"),
            None,
            None,
            10,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("spawn"));
    }
}
