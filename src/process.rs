use std::io::{ErrorKind, Read};
use std::process::{ChildStderr, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;
use wait_timeout::ChildExt;

const STDERR_TAIL_CHARS: usize = 500;

#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
}

/// Runs an external collaborator to completion and fails on a non-zero exit.
///
/// Both pipes are drained on worker threads so a chatty tool cannot stall on a
/// full pipe while we wait on it. The tool runs in its own process group and
/// that group is killed once the tool is done, so helpers it launched (ttyd,
/// a headless browser) never outlive the call.
pub fn run_tool(label: &str, command: &mut Command, timeout: Option<Duration>) -> Result<ToolOutput> {
    let rendered = describe(command);
    debug!(tool = label, command = %rendered, "spawning");

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let mut child = command.spawn().map_err(|error| {
        if error.kind() == ErrorKind::NotFound {
            anyhow!(
                "{label} executable not found (program='{}'). Install it or point the settings file at it.",
                command.get_program().to_string_lossy()
            )
        } else {
            anyhow!("failed to spawn {label} ('{rendered}'): {error}")
        }
    })?;
    let pid = child.id();

    let stdout_handle = child.stdout.take().map(drain_stdout);
    let stderr_handle = child.stderr.take().map(drain_stderr);

    let waited = match timeout {
        Some(timeout) => child.wait_timeout(timeout),
        None => child.wait().map(Some),
    };
    let status = match waited {
        Ok(Some(status)) => status,
        Ok(None) => {
            signal_group(pid, true);
            let _ = child.kill();
            let _ = child.wait();
            bail!(
                "{label} timed out after {:?} ('{rendered}')",
                timeout.unwrap_or_default()
            );
        }
        Err(error) => {
            signal_group(pid, true);
            let _ = child.kill();
            let _ = child.wait();
            return Err(error).with_context(|| format!("failed waiting for {label}"));
        }
    };
    // Leftover group members would also hold our pipes open.
    signal_group(pid, true);

    let stdout = join_reader(stdout_handle);
    let stderr = join_reader(stderr_handle);

    if !status.success() {
        let stderr_tail = last_n_chars(&stderr, STDERR_TAIL_CHARS);
        bail!("{label} failed with status {status} ('{rendered}', stderr_tail='{stderr_tail}')");
    }

    Ok(ToolOutput { stdout })
}

/// Signals the whole process group led by `pid`. A group that is already
/// gone is not an error.
#[cfg(unix)]
pub fn signal_group(pid: u32, force: bool) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(error) = killpg(Pid::from_raw(pid as i32), signal) {
        if error != nix::errno::Errno::ESRCH {
            debug!(pid, %error, "failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _force: bool) {}

pub fn describe(command: &Command) -> String {
    let mut parts = vec![command.get_program().to_string_lossy().into_owned()];
    parts.extend(
        command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned()),
    );
    parts.join(" ")
}

fn drain_stdout(mut pipe: ChildStdout) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn drain_stderr(mut pipe: ChildStderr) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

pub fn last_n_chars(s: &str, max_chars: usize) -> String {
    let mut chars = s.chars().collect::<Vec<_>>();
    if chars.len() > max_chars {
        chars = chars[chars.len().saturating_sub(max_chars)..].to_vec();
    }
    chars.into_iter().collect::<String>().trim().to_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn successful_tool_returns_stdout() {
        let mut command = Command::new("sh");
        command.args(["-c", "printf hello"]);
        let output = run_tool("probe", &mut command, Some(Duration::from_secs(10)))
            .expect("sh should succeed");
        assert_eq!(output.stdout, "hello");
    }

    #[test]
    fn failing_tool_reports_stderr_tail() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo broken pipeline >&2; exit 3"]);
        let error = run_tool("probe", &mut command, None).expect_err("exit 3 should fail");
        let message = error.to_string();
        assert!(message.contains("probe failed"), "{message}");
        assert!(message.contains("broken pipeline"), "{message}");
    }

    #[test]
    fn missing_binary_is_reported_as_not_found() {
        let mut command = Command::new("definitely-not-a-binary-tutgen");
        let error = run_tool("renderer", &mut command, None).expect_err("missing binary");
        assert!(error.to_string().contains("renderer executable not found"));
    }

    #[test]
    fn timeout_kills_the_child() {
        let mut command = Command::new("sleep");
        command.arg("5");
        let started = Instant::now();
        let error = run_tool("sleeper", &mut command, Some(Duration::from_millis(200)))
            .expect_err("should time out");
        assert!(error.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn sub_second_timeouts_are_reported_precisely() {
        let mut command = Command::new("sleep");
        command.arg("5");
        let error = run_tool("sleeper", &mut command, Some(Duration::from_millis(250)))
            .expect_err("should time out");
        assert!(error.to_string().contains("timed out after 250ms"), "{error}");
    }

    /// Zombies count as gone: orphans reparented to a non-reaping init linger.
    fn process_gone(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(text) => text
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .map_or(true, |state| state == "Z" || state == "X"),
            Err(_) if std::path::Path::new("/proc/self").exists() => true,
            Err(_) => nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err(),
        }
    }

    #[test]
    fn timeout_kills_everything_the_tool_started() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pid_file = temp.path().join("helper.pid");
        let mut command = Command::new("sh");
        command.arg("-c").arg(format!(
            "sleep 60 & echo $! > '{}'; wait",
            pid_file.display()
        ));
        run_tool("recorder", &mut command, Some(Duration::from_millis(300)))
            .expect_err("should time out");

        let pid = std::fs::read_to_string(&pid_file)
            .expect("pid file")
            .trim()
            .parse::<i32>()
            .expect("pid");
        let deadline = Instant::now() + Duration::from_secs(3);
        while !process_gone(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(process_gone(pid), "helper {pid} outlived the timed-out tool");
    }

    #[test]
    fn helpers_left_behind_by_a_finished_tool_are_stopped() {
        let mut command = Command::new("sh");
        command.args(["-c", "sleep 60 & echo $!"]);
        let started = Instant::now();
        let output = run_tool("renderer", &mut command, Some(Duration::from_secs(20)))
            .expect("tool exits zero");
        assert!(started.elapsed() < Duration::from_secs(10));
        let pid = output.stdout.trim().parse::<i32>().expect("pid");
        let deadline = Instant::now() + Duration::from_secs(3);
        while !process_gone(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(process_gone(pid), "helper {pid} outlived the tool");
    }

    #[test]
    fn last_n_chars_keeps_the_tail() {
        assert_eq!(last_n_chars("abcdef", 3), "def");
        assert_eq!(last_n_chars(" ab ", 10), "ab");
    }
}
