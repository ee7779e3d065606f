//! Shared fixtures: a temporary home with a sites directory and fakes for
//! every external collaborator.

#![allow(dead_code)]

use portside::certificate::NoTrustStore;
use portside::context::{OperationContext, APP_DIR, CONFIG_FILE};
use portside::exec::{CommandOutput, CommandRunner, CommandSpec};
use portside::hosts::HostsTool;
use portside::Result;
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const BASE_CONFIG: &str = r#"
default_php_version = "7.4"

[database]
max_attempts = 3
interval_ms = 1

[trust_store]
kind = "none"
"#;

pub struct TestEnv {
    pub dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(BASE_CONFIG)
    }

    pub fn with_config(config: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let app_home = dir.path().join(APP_DIR);
        std::fs::create_dir_all(&app_home).unwrap();
        std::fs::write(app_home.join(CONFIG_FILE), config).unwrap();
        Self { dir }
    }

    pub fn home(&self) -> &Path {
        self.dir.path()
    }

    pub fn app_home(&self) -> PathBuf {
        self.home().join(APP_DIR)
    }

    pub fn sites(&self) -> PathBuf {
        self.home().join("Sites")
    }

    /// Create a site directory with an htdocs folder and optional settings
    pub fn site(&self, name: &str, settings: Option<&str>) -> PathBuf {
        let root = self.sites().join(name);
        std::fs::create_dir_all(root.join("htdocs")).unwrap();
        if let Some(settings) = settings {
            std::fs::write(root.join("portside.toml"), settings).unwrap();
        }
        root
    }

    pub fn context(&self) -> OperationContext {
        self.context_in(self.home())
    }

    pub fn context_in(&self, cwd: &Path) -> OperationContext {
        OperationContext::new(self.home().to_path_buf(), self.app_home(), cwd).unwrap()
    }

    pub fn run_file(&self, name: &str) -> String {
        std::fs::read_to_string(self.app_home().join("_run").join(name)).unwrap()
    }
}

fn raw(spec: &CommandSpec) -> String {
    std::iter::once(spec.program.as_str())
        .chain(spec.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Shell words as they appear inside a generated `sh -c` script
pub fn sh(words: &[&str]) -> String {
    shell_words::join(words)
}

/// Records every command and answers the liveness and database probes
pub struct FakeRunner {
    pub seen: RefCell<Vec<CommandSpec>>,
    pub system_up: Cell<bool>,
    pub database_up: Cell<bool>,
    /// Commands whose display contains this fail
    pub fail_on: RefCell<Option<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            seen: RefCell::new(Vec::new()),
            system_up: Cell::new(false),
            database_up: Cell::new(true),
            fail_on: RefCell::new(None),
        }
    }

    pub fn running() -> Self {
        let runner = Self::new();
        runner.system_up.set(true);
        runner
    }

    /// Every command as program and arguments joined by spaces, unquoted
    pub fn commands(&self) -> Vec<String> {
        self.seen.borrow().iter().map(raw).collect()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }

    pub fn position(&self, needle: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(needle))
    }
}

impl CommandRunner for FakeRunner {
    fn spawn(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.seen.borrow_mut().push(spec.clone());
        let display = raw(spec);

        if let Some(needle) = self.fail_on.borrow().as_deref() {
            if display.contains(needle) {
                return Ok(CommandOutput::failed(1, "simulated failure"));
            }
        }
        if display.contains("echo \"Running\"") {
            return Ok(if self.system_up.get() {
                CommandOutput::ok("Running")
            } else {
                CommandOutput::failed(1, "service \"php74\" is not running")
            });
        }
        if display.contains("mysqladmin ping") {
            return Ok(if self.database_up.get() {
                CommandOutput::ok("mysqld is alive")
            } else {
                CommandOutput::failed(1, "connect to server at 'mysql' failed")
            });
        }
        if spec.program == "git" && spec.args.first().map(String::as_str) == Some("clone") {
            if let (Some(cwd), Some(target)) = (&spec.cwd, spec.args.get(2)) {
                std::fs::create_dir_all(cwd.join(target)).unwrap();
            }
        }
        if display.contains(" up -d") {
            self.system_up.set(true);
        }
        if display.contains(" stop") {
            self.system_up.set(false);
        }
        Ok(CommandOutput::ok(""))
    }
}

#[derive(Default)]
pub struct FakeHosts {
    pub calls: RefCell<Vec<String>>,
}

impl FakeHosts {
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl HostsTool for FakeHosts {
    fn load(&self, file: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(file).unwrap_or_default();
        self.calls.borrow_mut().push(format!("load {}", contents.trim()));
        Ok(())
    }

    fn unload(&self, file: &Path) -> Result<()> {
        self.calls.borrow_mut().push(format!("unload {}", file.display()));
        Ok(())
    }

    fn set(&self, host: &str) -> Result<()> {
        self.calls.borrow_mut().push(format!("set {}", host));
        Ok(())
    }

    fn remove(&self, host: &str) -> Result<()> {
        self.calls.borrow_mut().push(format!("remove {}", host));
        Ok(())
    }
}

pub fn trust() -> NoTrustStore {
    NoTrustStore
}
