//! Named, persistent shell sessions shared across tutorial commands.
//!
//! Each session is one shell process reading commands from a pipe. Completion
//! of a blocking command is detected with a sentinel line echoed after it,
//! carrying the command's exit status. Sessions live in their own process
//! group so terminating one also reaches anything it launched in the
//! background.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use crate::error::{PipelineError, PipelineResult};
use crate::process::signal_group;
use crate::tutorial::has_background_operator;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const SENTINEL_PREFIX: &str = "__TUTGEN_DONE_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Block until the shell reports the command finished.
    Wait,
    /// Launch in the background and return once the shell has accepted it.
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ShellEvent {
    Started {
        name: String,
        pid: u32,
    },
    Executed {
        name: String,
        command: String,
        mode: ExecMode,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_status: Option<i32>,
    },
    Terminated {
        name: String,
        forced: bool,
    },
}

#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub program: String,
    pub env: BTreeMap<String, String>,
    pub command_timeout: Option<Duration>,
    pub terminate_grace: Duration,
}

impl ShellOptions {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            env: BTreeMap::new(),
            command_timeout: Some(Duration::from_secs(300)),
            terminate_grace: Duration::from_millis(2000),
        }
    }
}

struct ShellSession {
    name: String,
    child: Child,
    stdin: Option<ChildStdin>,
    output: Receiver<String>,
    sequence: u64,
}

pub struct ShellRegistry {
    options: ShellOptions,
    sessions: HashMap<String, ShellSession>,
    history: Vec<ShellEvent>,
}

impl ShellRegistry {
    pub fn new(options: ShellOptions) -> Self {
        Self {
            options,
            sessions: HashMap::new(),
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[ShellEvent] {
        &self.history
    }

    pub fn is_alive(&mut self, name: &str) -> bool {
        self.reap_exited(name);
        self.sessions.contains_key(name)
    }

    pub fn live_names(&self) -> Vec<String> {
        let mut names = self.sessions.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn pid(&self, name: &str) -> Option<u32> {
        self.sessions.get(name).map(|session| session.child.id())
    }

    pub fn start(&mut self, name: &str) -> PipelineResult<()> {
        if self.is_alive(name) {
            return Err(PipelineError::DuplicateShell {
                name: name.to_owned(),
            });
        }

        let mut session = ShellSession::spawn(name, &self.options)?;
        let startup = self
            .options
            .command_timeout
            .map_or(STARTUP_TIMEOUT, |timeout| timeout.min(STARTUP_TIMEOUT));
        if let Err(error) = session.sync(Some(startup)) {
            session.shutdown(Duration::ZERO);
            return Err(error);
        }

        let pid = session.child.id();
        info!(subshell = name, pid, "subshell started");
        self.history.push(ShellEvent::Started {
            name: name.to_owned(),
            pid,
        });
        self.sessions.insert(name.to_owned(), session);
        Ok(())
    }

    /// Sends one command line to a live session.
    ///
    /// `expect` additionally waits (bounded by the command timeout) for the
    /// given text to show up in the session output.
    pub fn execute(
        &mut self,
        name: &str,
        command: &str,
        mode: ExecMode,
        expect: Option<&str>,
    ) -> PipelineResult<Option<i32>> {
        if !self.is_alive(name) {
            return Err(PipelineError::UnknownShell {
                name: name.to_owned(),
            });
        }
        let timeout = self.options.command_timeout;
        let session = self
            .sessions
            .get_mut(name)
            .ok_or_else(|| PipelineError::UnknownShell {
                name: name.to_owned(),
            })?;

        debug!(subshell = name, command, ?mode, "executing");
        let exit_status = match mode {
            ExecMode::Wait => {
                session.send(command)?;
                let (status, transcript) = session.sync(timeout)?;
                if let Some(expected) = expect {
                    if !transcript.contains(expected) {
                        return Err(session.failure(format!(
                            "expected output '{expected}' not seen from '{command}'"
                        )));
                    }
                }
                if let Some(code) = status.filter(|code| *code != 0) {
                    warn!(subshell = name, command, code, "command exited non-zero");
                }
                status
            }
            ExecMode::Detached => {
                session.send(&background(command))?;
                let (_, transcript) = session.sync(timeout)?;
                if let Some(expected) = expect.filter(|expected| !transcript.contains(*expected)) {
                    session.wait_for_text(expected, timeout)?;
                }
                None
            }
        };

        self.history.push(ShellEvent::Executed {
            name: name.to_owned(),
            command: command.to_owned(),
            mode,
            exit_status,
        });
        Ok(exit_status)
    }

    pub fn terminate(&mut self, name: &str) -> PipelineResult<()> {
        if !self.is_alive(name) {
            return Err(PipelineError::UnknownShell {
                name: name.to_owned(),
            });
        }
        let session = self
            .sessions
            .remove(name)
            .ok_or_else(|| PipelineError::UnknownShell {
                name: name.to_owned(),
            })?;
        let forced = session.shutdown(self.options.terminate_grace);
        info!(subshell = name, forced, "subshell terminated");
        self.history.push(ShellEvent::Terminated {
            name: name.to_owned(),
            forced,
        });
        Ok(())
    }

    /// Stops every live session. Used on every exit path of a run.
    pub fn terminate_all(&mut self) -> usize {
        let names = self.live_names();
        let mut stopped = 0;
        for name in names {
            match self.terminate(&name) {
                Ok(()) => stopped += 1,
                Err(error) => warn!(subshell = %name, %error, "teardown could not stop subshell"),
            }
        }
        // Sessions whose process already died are dropped by `is_alive`;
        // anything left here is released unconditionally.
        for (name, session) in self.sessions.drain() {
            warn!(subshell = %name, "releasing subshell left behind by teardown");
            session.shutdown(Duration::ZERO);
        }
        stopped
    }

    fn reap_exited(&mut self, name: &str) {
        let exited = match self.sessions.get_mut(name) {
            Some(session) => !matches!(session.child.try_wait(), Ok(None)),
            None => false,
        };
        if exited {
            warn!(subshell = name, "subshell exited on its own");
            if let Some(session) = self.sessions.remove(name) {
                session.shutdown(Duration::ZERO);
            }
        }
    }
}

impl Drop for ShellRegistry {
    fn drop(&mut self) {
        if !self.sessions.is_empty() {
            self.terminate_all();
        }
    }
}

impl ShellSession {
    fn spawn(name: &str, options: &ShellOptions) -> PipelineResult<Self> {
        let mut command = Command::new(&options.program);
        command
            .arg("-s")
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|error| PipelineError::Shell {
            name: name.to_owned(),
            reason: format!("failed to spawn '{}': {error}", options.program),
        })?;
        let stdin = child.stdin.take();
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PipelineError::Shell {
                name: name.to_owned(),
                reason: String::from("failed to capture shell stdout"),
            });
        };

        let mut session = Self {
            name: name.to_owned(),
            child,
            stdin,
            output: forward_lines(name, stdout),
            sequence: 0,
        };
        // Fold stderr into the pipe we read so failures show up in the log.
        session.send("exec 2>&1")?;
        Ok(session)
    }

    fn failure(&self, reason: impl Into<String>) -> PipelineError {
        PipelineError::Shell {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn send(&mut self, line: &str) -> PipelineResult<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| self_failure(&self.name, "shell input already closed"))?;
        writeln!(stdin, "{line}")
            .and_then(|()| stdin.flush())
            .map_err(|error| self_failure(&self.name, format!("failed to write to shell: {error}")))
    }

    /// Echoes a sentinel and reads output until it comes back. Returns the
    /// exit status of the previous command and everything printed before it.
    fn sync(&mut self, timeout: Option<Duration>) -> PipelineResult<(Option<i32>, String)> {
        self.sequence += 1;
        let marker = format!("{SENTINEL_PREFIX}{}_{}__", self.child.id(), self.sequence);
        self.send(&format!("printf '\\n%s %s\\n' '{marker}' \"$?\""))?;

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut transcript = String::new();
        loop {
            let line = self.next_line(deadline)?;
            if let Some(rest) = line.strip_prefix(marker.as_str()) {
                return Ok((rest.trim().parse().ok(), transcript));
            }
            if line.is_empty() && transcript.is_empty() {
                continue;
            }
            transcript.push_str(&line);
            transcript.push('\n');
        }
    }

    fn wait_for_text(&mut self, expected: &str, timeout: Option<Duration>) -> PipelineResult<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let line = self.next_line(deadline)?;
            if line.contains(expected) {
                return Ok(());
            }
        }
    }

    fn next_line(&mut self, deadline: Option<Instant>) -> PipelineResult<String> {
        let received = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.output.recv_timeout(remaining)
            }
            None => self.output.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(line) => Ok(line),
            Err(RecvTimeoutError::Timeout) => Err(self.failure("timed out waiting for the shell")),
            Err(RecvTimeoutError::Disconnected) => Err(self.failure("shell exited unexpectedly")),
        }
    }

    /// Returns whether the session had to be force-killed.
    fn shutdown(mut self, grace: Duration) -> bool {
        drop(self.stdin.take());
        let pid = self.child.id();
        signal_group(pid, false);

        let exited = matches!(self.child.wait_timeout(grace), Ok(Some(_)));
        if !exited {
            signal_group(pid, true);
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
        // The group may outlive its leader (e.g. a backgrounded server).
        signal_group(pid, true);
        !exited
    }
}

fn self_failure(name: &str, reason: impl Into<String>) -> PipelineError {
    PipelineError::Shell {
        name: name.to_owned(),
        reason: reason.into(),
    }
}

fn forward_lines(name: &str, stdout: ChildStdout) -> Receiver<String> {
    let (sender, receiver) = mpsc::channel();
    let name = name.to_owned();
    let spawned = thread::Builder::new()
        .name(format!("tutgen-shell-{name}"))
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\r', '\n'])
                            .to_owned();
                        if !line.starts_with(SENTINEL_PREFIX) {
                            debug!(subshell = %name, "{line}");
                        }
                        if sender.send(line).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    if let Err(error) = spawned {
        warn!(%error, "failed to spawn subshell output reader");
    }
    receiver
}

/// Makes sure a detached command cannot hold the shell's foreground.
fn background(command: &str) -> String {
    if has_background_operator(command) {
        command.to_owned()
    } else {
        format!("{} &", command.trim_end())
    }
}
