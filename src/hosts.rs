//! Hostname aggregation and the system hosts file

use crate::error::{Error, Result};
use crate::exec::{CommandRunner, CommandSpec};
use crate::sites::Site;
use std::collections::HashMap;
use std::path::Path;

pub const LOOPBACK: &str = "127.0.0.1";

/// Every site hostname in registry order.
///
/// A hostname claimed by two sites is a configuration error.
pub fn collect_hostnames(sites: &[Site]) -> Result<Vec<String>> {
    let mut owners: HashMap<&str, &str> = HashMap::new();
    let mut hosts = Vec::new();

    for site in sites {
        for host in &site.hosts {
            if let Some(first) = owners.insert(host.as_str(), site.name.as_str()) {
                return Err(Error::DuplicateHost {
                    host: host.clone(),
                    first: first.to_string(),
                    second: site.name.clone(),
                });
            }
            hosts.push(host.clone());
        }
    }

    Ok(hosts)
}

/// Contents of the hosts list: the database host, then one line per hostname
pub fn render_hosts_file(database_host: &str, hostnames: &[String]) -> String {
    std::iter::once(database_host)
        .chain(hostnames.iter().map(String::as_str))
        .map(|host| format!("{} {}\n", LOOPBACK, host))
        .collect()
}

/// Additive edits to the system hosts file
pub trait HostsTool {
    /// Add every entry of a hosts list file
    fn load(&self, file: &Path) -> Result<()>;
    /// Remove every entry of a hosts list file
    fn unload(&self, file: &Path) -> Result<()>;
    fn set(&self, host: &str) -> Result<()>;
    fn remove(&self, host: &str) -> Result<()>;
}

/// `hostile` command line tool, usually behind `sudo`
pub struct HostileCli<'a> {
    runner: &'a dyn CommandRunner,
    command: &'a [String],
}

impl<'a> HostileCli<'a> {
    pub fn new(runner: &'a dyn CommandRunner, command: &'a [String]) -> Self {
        Self { runner, command }
    }

    fn invoke(&self, args: &[&str]) -> Result<()> {
        let spec = CommandSpec::from_prefix(self.command)
            .ok_or_else(|| Error::Config("hosts.command must not be empty".into()))?
            .args(args.iter().copied())
            .capture();
        self.runner.run_checked(&spec)?;
        Ok(())
    }
}

impl HostsTool for HostileCli<'_> {
    fn load(&self, file: &Path) -> Result<()> {
        self.invoke(&["load", &file.to_string_lossy()])
    }

    fn unload(&self, file: &Path) -> Result<()> {
        self.invoke(&["unload", &file.to_string_lossy()])
    }

    fn set(&self, host: &str) -> Result<()> {
        self.invoke(&["set", LOOPBACK, host])
    }

    fn remove(&self, host: &str) -> Result<()> {
        self.invoke(&["remove", host])
    }
}
