//! Test-only fakes: a scripted remote and a shareable output buffer.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::cancel::{CancelCause, CancelToken, TriggerKind};
use crate::io::probes::Probe;
use crate::io::remote::{ExecOutput, ExecRequest, RemoteExec, SessionExit, SessionRequest};

/// Cloneable in-memory `Write` sink; clones share the same bytes.
#[derive(Debug, Clone, Default)]
pub struct SharedBuf {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        let bytes = self.bytes.lock().expect("shared buffer lock");
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes
            .lock()
            .expect("shared buffer lock")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reply to one scripted `exec` call.
#[derive(Debug, Clone)]
pub enum Reply {
    Output(ExecOutput),
    TransportError(String),
}

/// How the scripted session ends once its output has been written.
#[derive(Debug, Clone)]
pub enum SessionEnd {
    Exit(i32),
    /// Block until the cancel token fires or the request timeout elapses.
    HangUntilCancelled,
    TransportError(String),
}

#[derive(Debug, Clone)]
struct SessionPlan {
    stdout: Vec<String>,
    stderr: Vec<String>,
    end: SessionEnd,
}

/// `RemoteExec` fake that answers each probe from a script.
///
/// Probes without a scripted reply succeed with empty output. A reply queue
/// yields its entries in order and then keeps repeating the last one.
#[derive(Debug)]
pub struct ScriptedRemote {
    replies: Mutex<HashMap<Probe, VecDeque<Reply>>>,
    session: SessionPlan,
    log: Mutex<Vec<(Probe, String)>>,
    stdin: Mutex<Vec<(Probe, Vec<u8>)>>,
    timeouts: Mutex<Vec<(Probe, Duration)>>,
}

impl Default for ScriptedRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            session: SessionPlan {
                stdout: Vec::new(),
                stderr: Vec::new(),
                end: SessionEnd::Exit(0),
            },
            log: Mutex::new(Vec::new()),
            stdin: Mutex::new(Vec::new()),
            timeouts: Mutex::new(Vec::new()),
        }
    }

    pub fn on(self, probe: Probe, output: ExecOutput) -> Self {
        self.on_sequence(probe, vec![Reply::Output(output)])
    }

    pub fn on_error(self, probe: Probe, message: &str) -> Self {
        self.on_sequence(probe, vec![Reply::TransportError(message.to_string())])
    }

    pub fn on_sequence(self, probe: Probe, replies: Vec<Reply>) -> Self {
        self.replies
            .lock()
            .expect("replies lock")
            .insert(probe, replies.into());
        self
    }

    /// Lines the session writes to stdout, one write per entry.
    pub fn session_stdout<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.session.stdout = lines.into_iter().map(Into::into).collect();
        self
    }

    pub fn session_stderr<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.session.stderr = lines.into_iter().map(Into::into).collect();
        self
    }

    pub fn session_end(mut self, end: SessionEnd) -> Self {
        self.session.end = end;
        self
    }

    /// Probes in call order, including the session.
    pub fn probes(&self) -> Vec<Probe> {
        self.log
            .lock()
            .expect("log lock")
            .iter()
            .map(|(probe, _)| *probe)
            .collect()
    }

    pub fn count(&self, probe: Probe) -> usize {
        self.probes().into_iter().filter(|p| *p == probe).count()
    }

    /// Scripts sent for `probe`, in call order.
    pub fn scripts(&self, probe: Probe) -> Vec<String> {
        self.log
            .lock()
            .expect("log lock")
            .iter()
            .filter(|(p, _)| *p == probe)
            .map(|(_, script)| script.clone())
            .collect()
    }

    /// Stdin bytes of the last call for `probe`.
    pub fn stdin(&self, probe: Probe) -> Option<String> {
        self.stdin
            .lock()
            .expect("stdin lock")
            .iter()
            .rev()
            .find(|(p, _)| *p == probe)
            .map(|(_, bytes)| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Timeouts requested for `probe`, in call order.
    pub fn timeouts(&self, probe: Probe) -> Vec<Duration> {
        self.timeouts
            .lock()
            .expect("timeouts lock")
            .iter()
            .filter(|(p, _)| *p == probe)
            .map(|(_, timeout)| *timeout)
            .collect()
    }

    fn record(&self, script: &str) -> Result<Probe> {
        let probe =
            Probe::of_script(script).ok_or_else(|| anyhow!("untagged script: {script}"))?;
        self.log
            .lock()
            .expect("log lock")
            .push((probe, script.to_string()));
        Ok(probe)
    }

    fn next_reply(&self, probe: Probe) -> Reply {
        let mut replies = self.replies.lock().expect("replies lock");
        match replies.get_mut(&probe) {
            Some(queue) if queue.len() > 1 => queue.pop_front().expect("non-empty queue"),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Reply::Output(ExecOutput::ok(""))),
            None => Reply::Output(ExecOutput::ok("")),
        }
    }
}

impl RemoteExec for ScriptedRemote {
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        let probe = self.record(&request.script)?;
        self.timeouts
            .lock()
            .expect("timeouts lock")
            .push((probe, request.timeout));
        if let Some(stdin) = &request.stdin {
            self.stdin
                .lock()
                .expect("stdin lock")
                .push((probe, stdin.clone()));
        }
        match self.next_reply(probe) {
            Reply::Output(output) => Ok(output),
            Reply::TransportError(message) => Err(anyhow!(message)),
        }
    }

    fn run_session(
        &self,
        request: &SessionRequest,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
        cancel: &CancelToken,
    ) -> Result<SessionExit> {
        self.record(&request.script)?;
        for line in &self.session.stdout {
            stdout.write_all(line.as_bytes())?;
        }
        for line in &self.session.stderr {
            stderr.write_all(line.as_bytes())?;
        }
        match &self.session.end {
            SessionEnd::Exit(code) => Ok(SessionExit { code: Some(*code) }),
            SessionEnd::HangUntilCancelled => {
                if !cancel.wait_timeout(request.timeout) {
                    cancel.cancel(CancelCause::new(
                        TriggerKind::Timeout,
                        "scripted session timed out",
                    ));
                }
                Ok(SessionExit { code: None })
            }
            SessionEnd::TransportError(message) => Err(anyhow!(message.clone())),
        }
    }
}
