//! External process invocation
//!
//! Everything that leaves the process (docker compose, the hosts tool, the
//! trust store, scaffolding tools) goes through [`CommandRunner`], so the
//! orchestration logic can be driven by a recording fake in tests.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Compose project name, also written to the run directory's `.env`
pub const PROJECT_NAME: &str = "portside";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Attach to the terminal
    Inherit,
    /// Collect output and return it
    Capture,
}

/// A command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub mode: OutputMode,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            mode: OutputMode::Inherit,
        }
    }

    /// Build from a prefix such as `["sudo", "hostile"]`. Returns `None` when empty.
    pub fn from_prefix(prefix: &[String]) -> Option<Self> {
        let (program, rest) = prefix.split_first()?;
        Some(Self::new(program.clone()).args(rest.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn capture(mut self) -> Self {
        self.mode = OutputMode::Capture;
        self
    }

    /// Shell-quoted command line for logs and error messages
    pub fn display(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub status: Option<i32>,
    pub success: bool,
    /// Trimmed stdout, or trimmed stderr when stdout is empty. Empty for inherited output.
    pub text: String,
}

impl CommandOutput {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            success: true,
            text: text.into(),
        }
    }

    pub fn failed(status: i32, text: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            success: false,
            text: text.into(),
        }
    }

    fn status_string(&self) -> String {
        self.status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "signal".to_string())
    }

    /// Turn a failed run into [`Error::ExternalTool`]
    pub fn check(self, spec: &CommandSpec) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::ExternalTool {
                command: spec.display(),
                status: self.status_string(),
            })
        }
    }
}

pub trait CommandRunner {
    /// Start the command and wait for it. Exit status is not interpreted.
    fn spawn(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run a command. A non-zero exit is an error in [`OutputMode::Inherit`];
    /// captured runs return the output for the caller to inspect.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec.display(), mode = ?spec.mode, "Running command");
        let output = self.spawn(spec)?;
        match spec.mode {
            OutputMode::Inherit => output.check(spec),
            OutputMode::Capture => Ok(output),
        }
    }

    /// Run a command and fail on any non-zero exit, whatever the output mode
    fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.run(spec)?.check(spec)
    }
}

/// Runs commands with `std::process::Command`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn spawn(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let spawn_error = |source| Error::Spawn {
            command: spec.display(),
            source,
        };

        match spec.mode {
            OutputMode::Inherit => {
                let status = cmd.status().map_err(spawn_error)?;
                Ok(CommandOutput {
                    status: status.code(),
                    success: status.success(),
                    text: String::new(),
                })
            }
            OutputMode::Capture => {
                let output = cmd
                    .stdin(Stdio::null())
                    .output()
                    .map_err(spawn_error)?;
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let text = if stdout.trim().is_empty() {
                    stderr.trim().to_string()
                } else {
                    stdout.trim().to_string()
                };
                Ok(CommandOutput {
                    status: output.status.code(),
                    success: output.status.success(),
                    text,
                })
            }
        }
    }
}

/// Options for `docker compose exec`. The default is a captured, TTY-less probe.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions<'a> {
    /// Allocate a TTY (interactive use)
    pub tty: bool,
    /// Stream output to the terminal instead of capturing it
    pub inherit_output: bool,
    pub user: Option<&'a str>,
    pub workdir: Option<&'a str>,
}

/// `docker compose` bound to the run directory
pub struct Compose<'a> {
    runner: &'a dyn CommandRunner,
    command: &'a [String],
    run_dir: &'a Path,
}

impl<'a> Compose<'a> {
    pub fn new(runner: &'a dyn CommandRunner, command: &'a [String], run_dir: &'a Path) -> Self {
        Self {
            runner,
            command,
            run_dir,
        }
    }

    /// Base invocation with the project pinned and the run directory as cwd
    pub fn command<I, S>(&self, args: I) -> Result<CommandSpec>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::from_prefix(self.command)
            .ok_or_else(|| Error::Config("compose_command must not be empty".into()))?;
        Ok(spec
            .args(["--project-name", PROJECT_NAME])
            .args(args)
            .current_dir(self.run_dir))
    }

    pub fn up(&self) -> Result<()> {
        self.runner.run(&self.command(["up", "-d", "--remove-orphans"])?)?;
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.runner.run(&self.command(["stop"])?)?;
        Ok(())
    }

    pub fn restart(&self, service: Option<&str>) -> Result<()> {
        let spec = self.command(["restart"])?.args(service);
        self.runner.run(&spec)?;
        Ok(())
    }

    pub fn pull(&self) -> Result<()> {
        self.runner.run(&self.command(["pull"])?)?;
        Ok(())
    }

    /// Follow logs, optionally for a single service
    pub fn logs(&self, service: Option<&str>) -> Result<()> {
        let spec = self.command(["logs", "-f", "--tail=10"])?.args(service);
        self.runner.run(&spec)?;
        Ok(())
    }

    /// Build an `exec` invocation
    pub fn exec_spec<I, S>(&self, service: &str, options: &ExecOptions<'_>, cmd: I) -> Result<CommandSpec>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = self.command(["exec"])?;
        if !options.tty {
            spec = spec.arg("-T");
        }
        if let Some(user) = options.user {
            spec = spec.arg(format!("--user={}", user));
        }
        if let Some(dir) = options.workdir {
            spec = spec.arg(format!("--workdir={}", dir));
        }
        spec = spec.arg(service).args(cmd);
        if !options.inherit_output {
            spec = spec.capture();
        }
        Ok(spec)
    }

    /// Run a command in a service container
    pub fn exec<I, S>(&self, service: &str, options: &ExecOptions<'_>, cmd: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = self.exec_spec(service, options, cmd)?;
        self.runner.run(&spec)
    }

    /// Hand arbitrary arguments to docker compose
    pub fn passthrough(&self, args: &[String]) -> Result<()> {
        self.runner.run(&self.command(args.iter().cloned())?)?;
        Ok(())
    }

    pub fn runner(&self) -> &'a dyn CommandRunner {
        self.runner
    }
}
