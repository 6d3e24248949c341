use std::process::Command;
use std::time::Duration;

use crate::pipeline::shell_options;
use crate::process::run_tool;
use crate::settings::{FfmpegMode, Settings};
use crate::shell::ShellRegistry;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoctorReport {
    pub ok: bool,
    pub diagnostics: Vec<String>,
}

/// Checks that every external collaborator the settings point at can run.
pub fn run_doctor(settings: &Settings) -> DoctorReport {
    let mut report = DoctorReport {
        ok: true,
        diagnostics: Vec::new(),
    };

    match &settings.source {
        Some(path) => report.pass(format!("Loaded settings: {}", path.display())),
        None => report.pass(String::from("No settings file found; using defaults.")),
    }

    probe_binary(&mut report, "vhs", &settings.terminal.vhs_binary, "--version");

    match settings.ffmpeg_mode {
        FfmpegMode::Auto | FfmpegMode::System => {
            probe_binary(&mut report, "ffmpeg", &settings.ffmpeg_binary, "-version");
        }
        FfmpegMode::Sidecar => {
            if cfg!(feature = "sidecar_ffmpeg") {
                report.pass(String::from(
                    "ffmpeg sidecar mode: binary is downloaded on first assembly.",
                ));
            } else {
                report.fail(String::from(
                    "ffmpeg sidecar mode requested but this build lacks `sidecar_ffmpeg`.",
                ));
            }
        }
    }

    match settings.browser.command.first() {
        Some(program) => probe_binary(&mut report, "browser recorder", program, "--help"),
        None => report.fail(String::from("browser.command is empty.")),
    }

    let mut registry = ShellRegistry::new(shell_options(settings));
    match registry.start("doctor") {
        Ok(()) => {
            let pid = registry.pid("doctor").unwrap_or_default();
            report.pass(format!(
                "Shell '{}' answers on its command pipe (pid {pid}).",
                settings.shell
            ));
            registry.terminate_all();
        }
        Err(error) => report.fail(format!("Shell '{}' did not start: {error}", settings.shell)),
    }

    report
}

impl DoctorReport {
    fn pass(&mut self, message: String) {
        self.diagnostics.push(format!("[ok] {message}"));
    }

    fn fail(&mut self, message: String) {
        self.ok = false;
        self.diagnostics.push(format!("[error] {message}"));
    }
}

fn probe_binary(report: &mut DoctorReport, label: &str, program: &str, probe_arg: &str) {
    let mut command = Command::new(program);
    command.arg(probe_arg);
    match run_tool(label, &mut command, Some(PROBE_TIMEOUT)) {
        Ok(output) => match output.stdout.lines().map(str::trim).find(|line| !line.is_empty()) {
            Some(version) => report.pass(format!("{label} is executable: {program} ({version})")),
            None => report.pass(format!("{label} is executable: {program}")),
        },
        Err(error) => report.fail(format!("'{program} {probe_arg}' failed: {error:#}")),
    }
}
