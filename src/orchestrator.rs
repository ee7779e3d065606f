//! Materialization: run directory generation and system lifecycle
//!
//! `up` walks `Idle -> BuildingRunFiles -> ApplyingHosts -> StartingTopology
//! -> WaitingForDatabase -> Ready`; `down` leads to `Down`. Any failure aborts
//! the operation and leaves the phase where it failed.

use crate::certificate::{
    CertificateManager, CertificateStatus, Keychain, NoTrustStore, ReissuePolicy, TrustStore,
};
use crate::config::{TrustStoreConfig, TrustStoreKind};
use crate::context::OperationContext;
use crate::database::Database;
use crate::error::{Error, IoResultExt, Result};
use crate::exec::{CommandRunner, Compose, ExecOptions};
use crate::hosts::{collect_hostnames, render_hosts_file, HostsTool};
use crate::routing::RoutingRules;
use crate::site_config::SiteConfigCompiler;
use crate::templates::{self, populate_template};
use crate::topology::{self, ImageSource};
use crate::versions::{resolve_enabled_versions, EnabledVersions};
use std::path::Path;
use tracing::{debug, info, warn};

pub const README_FILE: &str = "readme.txt";
pub const ENV_FILE: &str = ".env";
pub const COMPOSE_FILE: &str = "docker-compose.yml";
pub const UPSTREAMS_FILE: &str = "nginx-php-upstreams.conf";
pub const COMPILED_SITES_FILE: &str = "nginx-compiled-sites.conf";
pub const DEFAULT_SITE_DIR: &str = "nginx-default-site";

const README: &str = "All files in this directory are generated on `portside up` and `portside reload`. \
Do not edit them by hand; your changes will be overwritten.\n";

/// Output the liveness probe expects from the default backend
const LIVENESS_SENTINEL: &str = "Running";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    BuildingRunFiles,
    ApplyingHosts,
    StartingTopology,
    WaitingForDatabase,
    Ready,
    Down,
}

/// Generated run directory contents, before they are written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub enabled: EnabledVersions,
    pub hostnames: Vec<String>,
    /// nginx routing maps and upstreams
    pub routing: String,
    /// nginx server blocks of every site
    pub sites_config: String,
    pub compose: String,
    pub hosts_file: String,
}

/// Snapshot reported by `portside status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemStatus {
    pub running: bool,
    /// Site name with its hosts
    pub sites: Vec<(String, Vec<String>)>,
    pub versions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpOutcome {
    Started,
    AlreadyRunning,
}

/// Variables substituted into the compose base template
fn compose_variables(ctx: &OperationContext) -> Vec<(&'static str, String)> {
    fn path(p: &Path) -> String {
        p.to_string_lossy().into_owned()
    }
    let run = &ctx.run_dir;
    vec![
        ("HTTPS_CERTIFICATE_CERT", path(&ctx.cert_path())),
        ("HTTPS_CERTIFICATE_KEY", path(&ctx.key_path())),
        ("MYSQL_CONFIG_FILE", path(&ctx.service_config_path("mysql.conf"))),
        ("MYSQL_ROOT_PASSWORD", ctx.config.database.root_password.clone()),
        ("NGINX_COMPILED_SITES_CONFIG_FILE", path(&run.join(COMPILED_SITES_FILE))),
        ("NGINX_CONFIG_FILE", path(&ctx.service_config_path("nginx.conf"))),
        ("NGINX_DEFAULT_SITE_DIRECTORY", path(&run.join(DEFAULT_SITE_DIR))),
        ("NGINX_PHP_UPSTREAMS_FILE", path(&run.join(UPSTREAMS_FILE))),
        ("PHP_CONFIG_FILE", path(&ctx.service_config_path("php.ini"))),
        ("PHP_FPM_CONFIG_FILE", path(&ctx.service_config_path("php-fpm.conf"))),
        ("PHP_XDEBUG_CONFIG_FILE", path(&ctx.service_config_path("xdebug.ini"))),
        ("SITES_DIRECTORY", path(&ctx.config.sites_directory)),
        ("SSMTP_CONFIG_FILE", path(&ctx.service_config_path("ssmtp.conf"))),
    ]
}

/// Compute every generated artifact from the registry and configuration.
///
/// Reads the sites directory and the app home; writes nothing.
pub fn generate_artifacts(ctx: &OperationContext) -> Result<Artifacts> {
    let sites = ctx.registry().load_all()?;
    let enabled = resolve_enabled_versions(&ctx.config, &sites)?;
    let hostnames = collect_hostnames(&sites)?;

    let routing = RoutingRules::compile(&enabled).render();

    let default_backend = ctx.config.default_php_version.backend_id();
    let sites_config =
        SiteConfigCompiler::new(&ctx.templates, &default_backend).compile_all(&sites)?;

    let variables = compose_variables(ctx);
    let variables: Vec<(&str, &str)> = variables.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let base = populate_template(&ctx.templates.get(templates::COMPOSE_BASE)?, &variables);

    let override_path = ctx.compose_override_path();
    let override_doc = if override_path.is_file() {
        debug!(path = %override_path.display(), "Merging compose override");
        Some(std::fs::read_to_string(&override_path).at(&override_path)?)
    } else {
        None
    };

    let images = match &ctx.config.php_images_local_path {
        Some(root) => ImageSource::LocalBuild { root: root.clone() },
        None => ImageSource::Registry {
            template: ctx.config.php_image.clone(),
        },
    };
    let descriptor = topology::assemble(
        &base,
        &enabled,
        &hostnames,
        &images,
        override_doc.as_deref(),
    )?;
    let compose = topology::render(&descriptor)?;

    let hosts_file = render_hosts_file(&ctx.config.database.service, &hostnames);

    Ok(Artifacts {
        enabled,
        hostnames,
        routing,
        sites_config,
        compose,
        hosts_file,
    })
}

/// Whether the topology is running, judged by the default backend answering
pub fn is_system_up(ctx: &OperationContext, compose: &Compose<'_>) -> Result<bool> {
    let output = compose.exec(
        &ctx.config.default_php_version.backend_id().service(),
        &ExecOptions::default(),
        ["/bin/sh", "-c", "echo \"Running\""],
    )?;
    Ok(output.text == LIVENESS_SENTINEL)
}

pub fn require_system_up(ctx: &OperationContext, compose: &Compose<'_>) -> Result<()> {
    if is_system_up(ctx, compose)? {
        Ok(())
    } else {
        Err(Error::Precondition(
            "portside is not running; start it with `portside up` first".into(),
        ))
    }
}

/// Trust store selected by configuration
pub fn trust_store<'a>(
    config: &TrustStoreConfig,
    runner: &'a dyn CommandRunner,
) -> Box<dyn TrustStore + 'a> {
    match config.kind {
        TrustStoreKind::Keychain => Box::new(Keychain::new(runner, config.keychain.clone())),
        TrustStoreKind::None => Box::new(NoTrustStore),
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).at(parent)?;
    }
    std::fs::write(path, contents).at(path)?;
    debug!(path = %path.display(), bytes = contents.len(), "Wrote run file");
    Ok(())
}

/// Drives the environment through its lifecycle
pub struct Materializer<'a> {
    ctx: &'a OperationContext,
    runner: &'a dyn CommandRunner,
    hosts: &'a dyn HostsTool,
    trust: &'a dyn TrustStore,
    phase: Phase,
}

impl<'a> Materializer<'a> {
    pub fn new(
        ctx: &'a OperationContext,
        runner: &'a dyn CommandRunner,
        hosts: &'a dyn HostsTool,
        trust: &'a dyn TrustStore,
    ) -> Self {
        Self {
            ctx,
            runner,
            hosts,
            trust,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        info!(from = ?self.phase, to = ?phase, "Phase transition");
        self.phase = phase;
    }

    pub fn compose(&self) -> Compose<'a> {
        Compose::new(self.runner, &self.ctx.config.compose_command, &self.ctx.run_dir)
    }

    /// Compose service of the global default backend
    pub fn default_service(&self) -> String {
        self.ctx.config.default_php_version.backend_id().service()
    }

    pub fn is_system_up(&self) -> Result<bool> {
        is_system_up(self.ctx, &self.compose())
    }

    pub fn require_system_up(&self) -> Result<()> {
        require_system_up(self.ctx, &self.compose())
    }

    pub fn status(&self) -> Result<SystemStatus> {
        let sites = self.ctx.registry().load_all()?;
        let enabled = resolve_enabled_versions(&self.ctx.config, &sites)?;
        Ok(SystemStatus {
            running: self.is_system_up()?,
            versions: enabled.versions().into_iter().map(str::to_string).collect(),
            sites: sites.into_iter().map(|s| (s.name, s.hosts)).collect(),
        })
    }

    /// Regenerate the run directory from scratch and make sure the certificate matches
    pub fn build_run_files(&mut self, policy: ReissuePolicy) -> Result<Artifacts> {
        self.enter(Phase::BuildingRunFiles);
        let ctx = self.ctx;
        let run = &ctx.run_dir;

        let artifacts = generate_artifacts(ctx)?;

        std::fs::create_dir_all(&ctx.app_home).at(&ctx.app_home)?;
        if run.exists() {
            std::fs::remove_dir_all(run).at(run)?;
        }
        std::fs::create_dir_all(run).at(run)?;

        write_file(&run.join(README_FILE), README)?;
        write_file(&run.join(ENV_FILE), &ctx.templates.get(templates::COMPOSE_ENV)?)?;
        ctx.templates.write_service_configs(&run.join("config"))?;
        write_file(&run.join(UPSTREAMS_FILE), &artifacts.routing)?;
        write_file(&run.join(COMPILED_SITES_FILE), &artifacts.sites_config)?;
        write_file(&run.join(COMPOSE_FILE), &artifacts.compose)?;
        write_file(
            &run.join(DEFAULT_SITE_DIR).join("index.html"),
            &ctx.templates.get(templates::DEFAULT_SITE_INDEX)?,
        )?;
        write_file(&ctx.hosts_file_path(), &artifacts.hosts_file)?;

        let cert_path = ctx.cert_path();
        let key_path = ctx.key_path();
        let status = CertificateManager::new(&cert_path, &key_path, self.trust)
            .ensure(&artifacts.hostnames, policy)?;
        if status == CertificateStatus::Reused {
            debug!("Kept existing certificate");
        }

        info!(
            sites = artifacts.hostnames.len(),
            versions = ?artifacts.enabled.versions(),
            path = %run.display(),
            "Run files built"
        );
        Ok(artifacts)
    }

    fn start(&mut self) -> Result<()> {
        self.enter(Phase::ApplyingHosts);
        self.hosts.load(&self.ctx.hosts_file_path())?;

        self.enter(Phase::StartingTopology);
        let compose = self.compose();
        compose.up()?;
        self.update_ca_certificates();

        self.enter(Phase::WaitingForDatabase);
        let db = Database::new(&compose, self.default_service(), &self.ctx.config.database);
        db.wait_until_ready()?;
        db.ensure_app_user()?;

        self.enter(Phase::Ready);
        Ok(())
    }

    /// Full rebuild and start
    pub fn up(&mut self) -> Result<UpOutcome> {
        if self.is_system_up()? {
            self.enter(Phase::Ready);
            return Ok(UpOutcome::AlreadyRunning);
        }
        self.build_run_files(ReissuePolicy::Always)?;
        self.start()?;
        Ok(UpOutcome::Started)
    }

    /// Pick up new sites or configuration changes
    pub fn reload(&mut self) -> Result<()> {
        self.build_run_files(ReissuePolicy::IfMissingOrChanged)?;
        self.start()
    }

    /// Stop containers and remove host entries
    pub fn down(&mut self) -> Result<()> {
        self.compose().stop()?;
        let hosts_file = self.ctx.hosts_file_path();
        if hosts_file.is_file() {
            self.hosts.unload(&hosts_file)?;
        } else {
            debug!(path = %hosts_file.display(), "No hosts list to unload");
        }
        self.enter(Phase::Down);
        Ok(())
    }

    /// Restart one service, or the whole system
    pub fn restart(&mut self, service: Option<&str>) -> Result<()> {
        match service {
            Some(service) => self.compose().restart(Some(service)),
            None => {
                self.down()?;
                self.up().map(|_| ())
            }
        }
    }

    /// Pull newer images, restarting around it if the system was running
    pub fn update_containers(&mut self) -> Result<()> {
        let was_up = self.is_system_up()?;
        if was_up {
            self.down()?;
        }
        self.build_run_files(ReissuePolicy::IfMissingOrChanged)?;
        self.compose().pull()?;
        if was_up {
            self.up()?;
        }
        Ok(())
    }

    /// Refresh the CA bundle in the default backend. Failure only warns.
    pub fn update_ca_certificates(&self) {
        let result = self.compose().exec(
            &self.default_service(),
            &ExecOptions::default(),
            ["/bin/sh", "-c", "update-ca-certificates > /dev/null 2>&1"],
        );
        match result {
            Ok(output) if output.success => debug!("Updated CA certificates"),
            Ok(output) => warn!(status = ?output.status, "update-ca-certificates failed"),
            Err(e) => warn!(error = %e, "Could not run update-ca-certificates"),
        }
    }
}
