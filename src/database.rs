//! MySQL access through the default PHP container

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::exec::{CommandOutput, Compose, ExecOptions};
use std::thread;
use tracing::{debug, info};

const ALIVE: &str = "mysqld is alive";

pub struct Database<'a> {
    compose: &'a Compose<'a>,
    /// Container the client tools run in
    client_service: String,
    config: &'a DatabaseConfig,
}

impl<'a> Database<'a> {
    pub fn new(compose: &'a Compose<'a>, client_service: impl Into<String>, config: &'a DatabaseConfig) -> Self {
        Self {
            compose,
            client_service: client_service.into(),
            config,
        }
    }

    fn credentials(&self) -> [String; 3] {
        [
            format!("--host={}", self.config.service),
            "--user=root".to_string(),
            format!("--password={}", self.config.root_password),
        ]
    }

    /// One liveness probe
    pub fn ping(&self) -> Result<bool> {
        let command = shell_words::join(
            ["mysqladmin", "ping", "--no-beep"]
                .into_iter()
                .map(str::to_string)
                .chain(self.credentials()),
        );
        let output = self.compose.exec(
            &self.client_service,
            &ExecOptions::default(),
            ["/bin/sh", "-c", command.as_str()],
        )?;
        Ok(output.text == ALIVE)
    }

    /// Probe until the server answers or the attempt budget runs out
    pub fn wait_until_ready(&self) -> Result<()> {
        let max = self.config.max_attempts;
        for attempt in 1..=max {
            if self.ping()? {
                if attempt > 3 {
                    info!("MySQL is ready");
                }
                return Ok(());
            }
            if attempt == 3 {
                info!("Waiting for MySQL...");
            }
            debug!(attempt, max, "MySQL not ready");
            if attempt < max {
                thread::sleep(self.config.interval);
            }
        }
        Err(Error::Timeout {
            what: "MySQL".to_string(),
            attempts: max,
        })
    }

    /// Run SQL, optionally against a specific database. Output is captured.
    pub fn execute(&self, sql: &str, database: Option<&str>) -> Result<CommandOutput> {
        let spec = self.compose.exec_spec(
            &self.client_service,
            &ExecOptions::default(),
            self.client_args(sql, database),
        )?;
        self.compose.runner().run_checked(&spec)
    }

    /// Run SQL with output attached to the terminal
    pub fn execute_interactive(&self, sql: &str, database: Option<&str>) -> Result<()> {
        let options = ExecOptions {
            tty: true,
            inherit_output: true,
            ..Default::default()
        };
        self.compose
            .exec(&self.client_service, &options, self.client_args(sql, database))?;
        Ok(())
    }

    /// Interactive client session
    pub fn open_client(&self, database: Option<&str>) -> Result<()> {
        let options = ExecOptions {
            tty: true,
            inherit_output: true,
            ..Default::default()
        };
        let mut args = vec!["mysql".to_string()];
        args.extend(self.credentials());
        args.extend(database.map(|db| format!("--database={}", db)));
        self.compose.exec(&self.client_service, &options, args)?;
        Ok(())
    }

    fn client_args(&self, sql: &str, database: Option<&str>) -> Vec<String> {
        let mut args = vec!["mysql".to_string()];
        args.extend(self.credentials());
        if let Some(db) = database {
            args.push(format!("--database={}", db));
        }
        args.push("-e".to_string());
        args.push(sql.to_string());
        args
    }

    /// Create the application account if missing
    pub fn ensure_app_user(&self) -> Result<()> {
        let user = quote_string(&self.config.app_user);
        let sql = format!(
            "CREATE USER IF NOT EXISTS {user}@'%' IDENTIFIED BY {password}; \
             GRANT ALL PRIVILEGES ON *.* TO {user}@'%'; FLUSH PRIVILEGES;",
            user = user,
            password = quote_string(&self.config.app_password),
        );
        self.execute(&sql, None)?;
        Ok(())
    }

    pub fn create_database(&self, name: &str) -> Result<()> {
        self.execute(&format!("CREATE DATABASE IF NOT EXISTS {};", quote_identifier(name)), None)?;
        info!(database = name, "Created database");
        Ok(())
    }

    pub fn drop_database(&self, name: &str) -> Result<()> {
        self.execute(&format!("DROP DATABASE IF EXISTS {};", quote_identifier(name)), None)?;
        info!(database = name, "Dropped database");
        Ok(())
    }
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn quote_string(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}
