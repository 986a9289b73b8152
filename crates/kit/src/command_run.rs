//! Helpers for running external management tools as child processes.

use std::io::{Read, Seek};
use std::process::{Command, ExitStatus};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use color_eyre::eyre::{eyre, Context, Result};

/// Execution options recognized for every child invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Kill the child and fail if it has not exited within this duration.
    pub timeout: Option<Duration>,
    /// Working directory for the child process.
    pub current_dir: Option<Utf8PathBuf>,
    /// Extra environment variables for the child process.
    pub env: Vec<(String, String)>,
}

/// Output captured from a completed child process.
#[derive(Debug)]
pub struct Captured {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// If the child exited abnormally, return an error carrying the tail of
    /// its stderr.
    pub fn check(&self) -> Result<()> {
        if self.success() {
            return Ok(());
        }
        Err(eyre!(
            "subprocess failed: {:?}\n{}",
            self.status,
            stderr_tail(&self.stderr)
        ))
    }
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRun {
    /// Run the child to completion, failing if it exits abnormally.
    fn run_with(&mut self, opts: &ExecOptions) -> Result<()>;

    /// Run the child and capture its stdout as a string, failing if it exits
    /// abnormally.
    fn run_get_string(&mut self, opts: &ExecOptions) -> Result<String>;

    /// Run the child and capture status, stdout, and stderr without treating
    /// a non-zero exit as an error. Callers that classify failures by stderr
    /// content (unknown machine vs. real fault) use this directly.
    fn run_capture(&mut self, opts: &ExecOptions) -> Result<Captured>;
}

impl CommandRun for Command {
    fn run_with(&mut self, opts: &ExecOptions) -> Result<()> {
        self.run_capture(opts)?.check()
    }

    fn run_get_string(&mut self, opts: &ExecOptions) -> Result<String> {
        let captured = self.run_capture(opts)?;
        captured.check()?;
        Ok(captured.stdout)
    }

    fn run_capture(&mut self, opts: &ExecOptions) -> Result<Captured> {
        apply_options(self, opts);
        // Both streams go to unlinked temp files rather than pipes, so a
        // chatty child can never fill a pipe and deadlock against us.
        let mut out_file = tempfile::tempfile()?;
        let mut err_file = tempfile::tempfile()?;
        self.stdout(out_file.try_clone()?);
        self.stderr(err_file.try_clone()?);
        tracing::trace!("exec: {self:?}");
        let status = wait_with_timeout(self, opts.timeout)?;
        Ok(Captured {
            status,
            stdout: read_back(&mut out_file)?,
            stderr: read_back(&mut err_file)?,
        })
    }
}

pub(crate) fn apply_options(cmd: &mut Command, opts: &ExecOptions) {
    if let Some(dir) = &opts.current_dir {
        cmd.current_dir(dir);
    }
    cmd.envs(opts.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
}

/// Rewind a capture file and read its contents back.
pub(crate) fn read_back(file: &mut std::fs::File) -> Result<String> {
    file.seek(std::io::SeekFrom::Start(0)).context("seek")?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).context("read captured output")?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

// Only the trailing bytes go into error messages, to avoid pathological
// reports from tools that dump pages of output before failing.
const MAX_STDERR_BYTES: usize = 1024;

pub(crate) fn stderr_tail(stderr: &str) -> &str {
    let stderr = stderr.trim_end();
    if stderr.len() <= MAX_STDERR_BYTES {
        return stderr;
    }
    let mut start = stderr.len() - MAX_STDERR_BYTES;
    while !stderr.is_char_boundary(start) {
        start += 1;
    }
    &stderr[start..]
}

fn wait_with_timeout(cmd: &mut Command, timeout: Option<Duration>) -> Result<ExitStatus> {
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", cmd.get_program()))?;
    let Some(limit) = timeout else {
        return Ok(child.wait()?);
    };
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if start.elapsed() >= limit {
            let _ = child.kill();
            let _ = child.wait();
            return Err(eyre!("subprocess did not exit within {limit:?}"));
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn captures_stdout_of_successful_child() {
        let out = Command::new("sh")
            .args(["-c", "echo hello"])
            .run_get_string(&ExecOptions::default())
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    #[cfg(unix)]
    fn nonzero_exit_carries_stderr_tail() {
        let err = Command::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .run_get_string(&ExecOptions::default())
            .unwrap_err();
        assert!(format!("{err}").contains("boom"));
    }

    #[test]
    #[cfg(unix)]
    fn capture_does_not_error_on_failure() {
        let captured = Command::new("sh")
            .args(["-c", "echo gone >&2; exit 1"])
            .run_capture(&ExecOptions::default())
            .unwrap();
        assert!(!captured.success());
        assert!(captured.stderr.contains("gone"));
    }

    #[test]
    #[cfg(unix)]
    fn timeout_kills_a_hung_child() {
        let opts = ExecOptions {
            timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let err = Command::new("sh")
            .args(["-c", "sleep 10"])
            .run_with(&opts)
            .unwrap_err();
        assert!(format!("{err}").contains("did not exit"));
    }

    #[test]
    #[cfg(unix)]
    fn env_overrides_reach_the_child() {
        let opts = ExecOptions {
            env: vec![("VBOXKIT_TEST_VAR".to_string(), "42".to_string())],
            ..Default::default()
        };
        let out = Command::new("sh")
            .args(["-c", "echo $VBOXKIT_TEST_VAR"])
            .run_get_string(&opts)
            .unwrap();
        assert_eq!(out.trim(), "42");
    }

    #[test]
    fn stderr_tail_truncates_long_output() {
        let long = "x".repeat(4096);
        assert_eq!(stderr_tail(&long).len(), MAX_STDERR_BYTES);
        assert_eq!(stderr_tail("short"), "short");
    }
}
