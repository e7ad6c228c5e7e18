//! Helpers for running child processes with timeouts, bounded output, and
//! cooperative cancellation.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

/// How often a supervised child is checked for exit, cancellation, or deadline.
const SUPERVISE_POLL: Duration = Duration::from_millis(100);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

/// Why a supervised child was killed before exiting on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    Deadline,
}

/// Result of [`run_supervised`].
#[derive(Debug)]
pub struct SupervisedExit {
    pub status: ExitStatus,
    pub stopped: Option<StopReason>,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// On timeout the child's whole process group is killed, so forked helpers holding the pipes
/// cannot keep the readers alive.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = spawn(&mut cmd)?;

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
        // Dropping closes the pipe so scripts reading stdin see EOF.
        drop(child_stdin);
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_tree(&mut child).context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Run a command while pumping its stdout/stderr into the given sinks as
/// bytes arrive.
///
/// The child runs in its own process group, and the whole group is killed
/// when `cancel` fires or `timeout` elapses; the reason is reported in
/// [`SupervisedExit::stopped`]. Sink write failures are logged and
/// the pipe keeps draining so the child never blocks on a full pipe.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_supervised(
    mut cmd: Command,
    stdout_sink: &mut (dyn Write + Send),
    stderr_sink: &mut (dyn Write + Send),
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<SupervisedExit> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = spawn(&mut cmd)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    thread::scope(|scope| {
        let stdout_pump = scope.spawn(move || pump(stdout, stdout_sink, "stdout"));
        let stderr_pump = scope.spawn(move || pump(stderr, stderr_sink, "stderr"));

        let waited = supervise(&mut child, timeout, cancel);
        if waited.is_err() {
            // Make sure the pumps see EOF before the scope joins them.
            let _ = kill_tree(&mut child);
            let _ = child.wait();
        }

        for (label, pump) in [("stdout", stdout_pump), ("stderr", stderr_pump)] {
            match pump.join() {
                Ok(Ok(bytes)) => debug!(stream = label, bytes, "pump finished"),
                Ok(Err(err)) => warn!(stream = label, err = %err, "pump failed"),
                Err(_) => warn!(stream = label, "pump thread panicked"),
            }
        }
        waited
    })
}

fn supervise(child: &mut Child, timeout: Duration, cancel: &CancelToken) -> Result<SupervisedExit> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child
            .wait_timeout(SUPERVISE_POLL)
            .context("wait for supervised command")?
        {
            debug!(exit_code = ?status.code(), "supervised command exited");
            return Ok(SupervisedExit {
                status,
                stopped: None,
            });
        }

        let stopped = if cancel.is_cancelled() {
            Some(StopReason::Cancelled)
        } else if Instant::now() >= deadline {
            Some(StopReason::Deadline)
        } else {
            None
        };
        if let Some(reason) = stopped {
            warn!(?reason, "stopping supervised command");
            kill_tree(child).context("kill supervised command")?;
            let status = child.wait().context("wait supervised command after kill")?;
            return Ok(SupervisedExit {
                status,
                stopped: Some(reason),
            });
        }
    }
}

fn spawn(cmd: &mut Command) -> Result<Child> {
    debug!(program = ?cmd.get_program(), "spawning child process");
    own_process_group(cmd);
    match cmd.spawn() {
        Ok(child) => Ok(child),
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()))
        }
    }
}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

/// Kill the child and every process in its group. Must run before the child
/// is reaped, while its pid still names the group.
fn kill_tree(child: &mut Child) -> std::io::Result<()> {
    kill_group(child.id());
    child.kill()
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pid, err = %err, "kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// Copy `reader` into `sink` chunk by chunk, flushing after each chunk.
fn pump<R: Read>(mut reader: R, sink: &mut (dyn Write + Send), label: &str) -> Result<usize> {
    let mut chunk = [0u8; 8192];
    let mut total = 0usize;
    let mut sink_ok = true;
    loop {
        let n = reader
            .read(&mut chunk)
            .with_context(|| format!("read {label}"))?;
        if n == 0 {
            break;
        }
        total += n;
        if !sink_ok {
            continue;
        }
        if let Err(err) = sink.write_all(&chunk[..n]).and_then(|()| sink.flush()) {
            warn!(stream = label, err = %err, "sink write failed, discarding further output");
            sink_ok = false;
        }
    }
    Ok(total)
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
