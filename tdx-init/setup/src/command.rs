//! Thin wrapper around the external tools this crate drives
//! (`cryptsetup`, `tpm2_*`, `mkfs.ext4`, `mount`).

use anyhow::{Context, Result, bail};
use std::ffi::OsStr;
use std::io::Write;
use std::process::{Command, ExitStatus, Stdio};
use zeroize::Zeroizing;

pub(crate) struct Tool {
    name: &'static str,
    command: Command,
    input: Option<Zeroizing<Vec<u8>>>,
}

#[derive(Debug)]
pub(crate) struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Human-readable failure summary for error messages.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("{}", self.status)
        } else {
            format!("{}: {stderr}", self.status)
        }
    }
}

impl Tool {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            command: Command::new(name),
            input: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.command.arg(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.command.env(key, value);
        self
    }

    /// Feed `data` on stdin. Kept in zeroizing memory since it is usually a
    /// passphrase.
    pub fn stdin(mut self, data: &[u8]) -> Self {
        self.input = Some(Zeroizing::new(data.to_vec()));
        self
    }

    /// Run to completion. Only a failure to spawn is an error here.
    pub fn output(mut self) -> Result<ToolOutput> {
        self.command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = self
            .command
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.name))?;

        // The child may exit before reading all of its input; it still has
        // to be reaped and its stderr kept.
        let written = match (&self.input, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => stdin.write_all(input),
            _ => Ok(()),
        };

        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for {}", self.name))?;
        let output = ToolOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if let Err(e) = written {
            if output.success() {
                return Err(anyhow::Error::new(e).context(format!(
                    "failed to write stdin of {} ({})",
                    self.name,
                    output.diagnostic()
                )));
            }
            log::debug!("{} exited before reading its input: {e}", self.name);
        }
        Ok(output)
    }

    /// Run and fail on a non-zero exit.
    pub fn run(self) -> Result<ToolOutput> {
        let name = self.name;
        let output = self.output()?;
        if !output.success() {
            bail!("{name} failed ({})", output.diagnostic());
        }
        Ok(output)
    }

    /// Run and report only whether it exited zero.
    pub fn succeeds(self) -> bool {
        self.output().is_ok_and(|output| output.success())
    }
}
