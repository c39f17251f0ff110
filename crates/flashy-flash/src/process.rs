//! External commands and other processes
//!
//! Commands run with a hard timeout. Their stdout and stderr are drained on
//! two threads and logged line by line as they arrive, so a chatty command
//! can neither deadlock on a full pipe nor stay silent until it exits.

use flashy_core::{Error, Result};
use log::{debug, info, warn};
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

/// Programs that can write to flash
pub const OTHER_FLASHER_BASE_NAMES: &[&str] = &[
    "autodump.sh",
    "cpld_upgrade.sh",
    "dd",
    "flash_eraseall",
    "flashcp",
    "flashrom",
    "fw-util",
    "fw_setenv",
    "improve_system.py",
    "jbi",
    "psu-update-bel.py",
    "psu-update-delta.py",
    "flashy",
];

/// Result of a command that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; 1 when terminated by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into an error
    pub fn check(self, command: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(Error::Command {
            command: command.to_string(),
            reason: format!("exited with code {}", self.exit_code),
        })
    }
}

/// Runs external commands
pub trait CommandRunner {
    /// Run `argv`, killing it after `timeout`
    ///
    /// Any exit code is returned as output; only failing to start, failing
    /// to wait or timing out is an error.
    fn run_command(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput>;
}

/// Runs commands as child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

/// How long to wait for a drained stream once the child is gone
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn read_lines<R: Read>(pipe: R, prefix: &str) -> String {
    let mut out = String::new();
    for line in BufReader::new(pipe).split(b'\n') {
        let Ok(line) = line else {
            break;
        };
        let line = String::from_utf8_lossy(&line);
        let line = line.strip_suffix('\r').unwrap_or(&line);
        info!("{}{}", prefix, line);
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn drain_lines<R: Read + Send + 'static>(pipe: Option<R>, prefix: &'static str) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let out = pipe.map(|p| read_lines(p, prefix)).unwrap_or_default();
        let _ = tx.send(out);
    });
    rx
}

/// Output of a drain thread
///
/// A grandchild can inherit the pipe and keep it open after the child is
/// gone; the thread is then left behind instead of joined.
fn collect_drained(rx: Receiver<String>, stream: &str, command: &str) -> String {
    match rx.recv_timeout(DRAIN_TIMEOUT) {
        Ok(out) => out,
        Err(_) => {
            warn!(
                "{} of '{}' still open {:?} after exit, not waiting for it",
                stream, command, DRAIN_TIMEOUT
            );
            String::new()
        }
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run_command(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput> {
        let command = argv.join(" ");
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::Command {
                command,
                reason: "empty command line".to_string(),
            });
        };

        info!("Running command '{}' with {:?} timeout", command, timeout);
        let start = Instant::now();
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Command {
                command: command.clone(),
                reason: format!("failed to start: {}", e),
            })?;

        let stdout = drain_lines(child.stdout.take(), "stdout: ");
        let stderr = drain_lines(child.stderr.take(), "stderr: ");

        let status = child.wait_timeout(timeout).map_err(|e| Error::Command {
            command: command.clone(),
            reason: format!("wait failed: {}", e),
        })?;

        let Some(status) = status else {
            let _ = child.kill();
            let _ = child.wait();
            collect_drained(stdout, "stdout", &command);
            collect_drained(stderr, "stderr", &command);
            warn!("Command '{}' timed out after {:?}", command, timeout);
            return Err(Error::Timeout { command, timeout });
        };

        let output = CommandOutput {
            exit_code: status.code().unwrap_or(1),
            stdout: collect_drained(stdout, "stdout", &command),
            stderr: collect_drained(stderr, "stderr", &command),
        };
        info!(
            "Command '{}' exited with code {} after {:?}",
            command,
            output.exit_code,
            start.elapsed()
        );
        Ok(output)
    }
}

/// Run `argv` until it exits 0, at most `max_attempts` times
///
/// Sleeps `interval` between attempts and returns the first success or the
/// last failure.
pub fn run_command_with_retries(
    runner: &dyn CommandRunner,
    argv: &[String],
    timeout: Duration,
    max_attempts: usize,
    interval: Duration,
) -> Result<CommandOutput> {
    let command = argv.join(" ");
    if max_attempts == 0 {
        return Err(Error::Command {
            command,
            reason: "max attempts must be > 0".to_string(),
        });
    }

    let mut attempt = 1;
    loop {
        info!(
            "Attempt {} of {}: running '{}' with timeout {:?}",
            attempt, max_attempts, command, timeout
        );
        match runner
            .run_command(argv, timeout)
            .and_then(|o| o.check(&command))
        {
            Ok(output) => {
                info!("Attempt {} of {} succeeded", attempt, max_attempts);
                return Ok(output);
            }
            Err(e) if attempt >= max_attempts => {
                warn!("Max attempts ({}) reached: {}", max_attempts, e);
                return Err(e);
            }
            Err(e) => {
                warn!("Attempt {} of {} failed: {}", attempt, max_attempts, e);
                thread::sleep(interval);
                attempt += 1;
            }
        }
    }
}

/// Base name of a command line parameter, e.g. `/usr/bin/flashcp` → `flashcp`
fn base_name(param: &str) -> &str {
    Path::new(param)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(param)
}

/// Whether a base name match is a flasher given all of its parameters
fn refine_base_name_match(base_name: &str, params: &[&str]) -> bool {
    match base_name {
        // fw-util only flashes with --update
        "fw-util" => params.contains(&"--update"),
        _ => true,
    }
}

/// Return the first flasher found in a NUL-separated cmdline
fn find_flasher_in_cmdline<'a>(cmdline: &'a str, flashers: &[&str]) -> Option<(&'a str, Vec<&'a str>)> {
    let params: Vec<&str> = cmdline.split('\0').filter(|p| !p.is_empty()).collect();
    let name = params.iter().map(|p| base_name(*p)).find(|name| {
        flashers.contains(name) && refine_base_name_match(name, &params)
    })?;
    Some((name, params))
}

/// Fail if another flashing-capable process is running
///
/// Every `<proc_root>/<pid>/cmdline` except our own is checked, so both
/// `flashcp ...` and `python improve_system.py` are caught. `step_names`
/// catches other flashy instances started under a step name.
pub fn check_other_flasher_running(proc_root: &Path, step_names: &[&str]) -> Result<()> {
    let own_pid = std::process::id().to_string();
    let flashers: Vec<&str> = OTHER_FLASHER_BASE_NAMES
        .iter()
        .chain(step_names)
        .copied()
        .collect();

    let entries = fs::read_dir(proc_root).map_err(|e| Error::io(proc_root, e))?;
    let mut dirs: Vec<_> = entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name();
            name != "self" && name != "thread-self" && name.to_str() != Some(own_pid.as_str())
        })
        .map(|e| e.path())
        .collect();
    dirs.sort();

    for dir in dirs {
        // Processes come and go while we scan
        let Ok(raw) = fs::read(dir.join("cmdline")) else {
            continue;
        };
        let cmdline = String::from_utf8_lossy(&raw);
        if let Some((name, params)) = find_flasher_in_cmdline(&cmdline, &flashers) {
            return Err(Error::ConcurrentFlasherDetected {
                name: name.to_string(),
                cmdline: params.join(" "),
            });
        }
    }

    debug!("No other flasher running");
    Ok(())
}
