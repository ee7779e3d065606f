//! Creating and deleting sites
//!
//! Both operations require the system to be up: databases are created and
//! scaffolding tools run inside the containers.

use crate::context::OperationContext;
use crate::database::Database;
use crate::error::{Error, IoResultExt, Result};
use crate::exec::{CommandRunner, CommandSpec, Compose};
use crate::hosts::HostsTool;
use crate::orchestrator;
use crate::sites::{
    default_domain, is_valid_hostname, is_valid_site_name, SiteSettings, SiteType, DOCUMENT_ROOT,
};
use crate::templates::{self, populate_template};
use crate::tools::{BackendChoice, Tools};
use crate::versions::PhpVersion;
use anyhow::Context as _;
use regex::{NoExpand, Regex};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Redis object cache drop-in for WordPress
pub const OBJECT_CACHE_URL: &str =
    "https://raw.githubusercontent.com/pantheon-systems/wp-redis/master/object-cache.php";

const WP_CONFIG_MARKER: &str = "\n\n/* That's all";
const WP_CLI_CONFIG_FILE: &str = "wp-cli.yml";
const LARAVEL_SKELETON: &str = "laravel/laravel";

/// A site to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSite {
    pub name: String,
    pub site_type: SiteType,
    /// Defaults to `<name>.dev`
    pub domain: Option<String>,
    /// Defaults to the global default version; ignored for proxy sites
    pub php_version: Option<PhpVersion>,
    /// Required for proxy sites
    pub proxy_port: Option<u16>,
    /// Create a database for a plain PHP site
    pub create_database: bool,
    /// Laravel: repository cloned as the document root.
    /// WordPress: repository cloned as `wp-content`.
    pub repo_url: Option<String>,
    pub uploads_proxy_url: Option<String>,
    pub storage_proxy_url: Option<String>,
    pub object_cache: bool,
}

impl NewSite {
    pub fn new(name: impl Into<String>, site_type: SiteType) -> Self {
        Self {
            name: name.into(),
            site_type,
            domain: None,
            php_version: None,
            proxy_port: None,
            create_database: false,
            repo_url: None,
            uploads_proxy_url: None,
            storage_proxy_url: None,
            object_cache: false,
        }
    }

    pub fn domain(&self) -> String {
        self.domain
            .clone()
            .unwrap_or_else(|| default_domain(&self.name))
    }

    fn needs_database(&self) -> bool {
        self.site_type.needs_database() || self.create_database
    }
}

#[derive(Serialize)]
struct WpCliConfig<'a> {
    path: &'a str,
}

/// Replace `KEY=...` lines in a dotenv file; keys not present are appended
pub fn rewrite_env_directives(content: &str, directives: &[(&str, String)]) -> Result<String> {
    let mut out = content.to_string();
    for (key, value) in directives {
        let line = format!("{}={}", key, value);
        let pattern = Regex::new(&format!(r"(?m)^{}=.*$", regex::escape(key)))
            .map_err(|e| Error::Config(format!("bad directive name {}: {}", key, e)))?;
        if pattern.is_match(&out) {
            out = pattern.replace(&out, NoExpand(&line)).into_owned();
        } else {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&line);
            out.push('\n');
        }
    }
    Ok(out)
}

/// Insert extra directives ahead of the "stop editing" line of `wp-config.php`
pub fn insert_wp_config_additions(config: &str, additions: &str) -> Option<String> {
    let at = config.find(WP_CONFIG_MARKER)?;
    let mut out = String::with_capacity(config.len() + additions.len());
    out.push_str(&config[..at]);
    out.push('\n');
    out.push_str(additions.trim());
    out.push_str(&config[at..]);
    Some(out)
}

fn download(url: &str, dest: &Path) -> anyhow::Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to create HTTP client")?;
    let body = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("GET {}", url))?
        .text()
        .context("Failed to read response body")?;
    std::fs::write(dest, body).with_context(|| format!("Failed to write {}", dest.display()))?;
    Ok(())
}

pub struct Provisioner<'a> {
    ctx: &'a OperationContext,
    runner: &'a dyn CommandRunner,
    hosts: &'a dyn HostsTool,
    object_cache_url: String,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        ctx: &'a OperationContext,
        runner: &'a dyn CommandRunner,
        hosts: &'a dyn HostsTool,
    ) -> Self {
        Self {
            ctx,
            runner,
            hosts,
            object_cache_url: OBJECT_CACHE_URL.to_string(),
        }
    }

    /// Fetch the object cache drop-in from somewhere else
    pub fn with_object_cache_url(mut self, url: impl Into<String>) -> Self {
        self.object_cache_url = url.into();
        self
    }

    fn compose(&self) -> Compose<'a> {
        Compose::new(self.runner, &self.ctx.config.compose_command, &self.ctx.run_dir)
    }

    fn run(&self, spec: &CommandSpec) -> Result<()> {
        self.runner.run(spec)?;
        Ok(())
    }

    fn database<'c>(&self, compose: &'c Compose<'c>) -> Database<'c>
    where
        'a: 'c,
    {
        let service = self.ctx.config.default_php_version.backend_id().service();
        Database::new(compose, service, &self.ctx.config.database)
    }

    fn validate(&self, new: &NewSite) -> Result<String> {
        if !is_valid_site_name(&new.name) {
            return Err(Error::Config(format!(
                "'{}' is not a valid site name (lowercase letters, digits, '-', '_' and '.' only)",
                new.name
            )));
        }
        let domain = new.domain();
        if !is_valid_hostname(&domain) {
            return Err(Error::Config(format!("'{}' is not a valid domain", domain)));
        }
        if new.site_type == SiteType::Proxy && matches!(new.proxy_port, None | Some(0)) {
            return Err(Error::Config(
                "proxy sites need a proxy port between 1 and 65535".into(),
            ));
        }

        let registry = self.ctx.registry();
        if registry.site_root(&new.name).exists() {
            return Err(Error::Precondition(format!(
                "site directory {} already exists",
                registry.site_root(&new.name).display()
            )));
        }
        for site in registry.load_all()? {
            if site.hosts.iter().any(|h| h.eq_ignore_ascii_case(&domain)) {
                return Err(Error::DuplicateHost {
                    host: domain,
                    first: site.name,
                    second: new.name.clone(),
                });
            }
        }
        Ok(domain)
    }

    fn settings_for(&self, new: &NewSite, domain: String) -> SiteSettings {
        let mut settings = SiteSettings {
            site_type: Some(new.site_type),
            hosts: Some(vec![domain]),
            uploads_proxy_url: new.uploads_proxy_url.clone(),
            storage_proxy_url: new.storage_proxy_url.clone(),
            ..Default::default()
        };
        match new.site_type {
            SiteType::Proxy => settings.proxy_port = new.proxy_port,
            _ => {
                settings.default_php_version = Some(
                    new.php_version
                        .clone()
                        .unwrap_or_else(|| self.ctx.config.default_php_version.clone()),
                )
            }
        }
        if new.site_type == SiteType::WordPress && new.object_cache {
            settings.object_cache_enabled = Some(true);
        }
        settings
    }

    /// Create a site directory, its database and scaffolding, then save its settings.
    ///
    /// A failure part way leaves the half-created site in place for inspection.
    pub fn create_site(&self, new: &NewSite) -> Result<PathBuf> {
        let compose = self.compose();
        orchestrator::require_system_up(self.ctx, &compose)?;
        let domain = self.validate(new)?;

        let registry = self.ctx.registry();
        let root = registry.site_root(&new.name);
        let docroot = root.join(DOCUMENT_ROOT);
        std::fs::create_dir_all(&docroot).at(&docroot)?;
        info!(site = %new.name, domain = %domain, kind = %new.site_type, "Creating site");

        if new.needs_database() {
            self.database(&compose).create_database(&new.name)?;
        }

        match new.site_type {
            SiteType::Laravel => self.scaffold_laravel(new, &root, &domain)?,
            SiteType::WordPress => self.scaffold_wordpress(new, &root, &domain)?,
            SiteType::Php | SiteType::Proxy => {}
        }

        registry.save_settings(&new.name, &self.settings_for(new, domain.clone()))?;
        info!(site = %new.name, domain = %domain, "Site created");
        Ok(root)
    }

    fn scaffold_laravel(&self, new: &NewSite, root: &Path, domain: &str) -> Result<()> {
        let docroot = root.join(DOCUMENT_ROOT);
        let in_docroot = self.ctx.for_site(&new.name, DOCUMENT_ROOT);
        let tools = Tools::new(&in_docroot, self.runner);
        let choice = BackendChoice::default();
        let env_path = docroot.join(".env");

        match &new.repo_url {
            Some(url) => {
                std::fs::remove_dir_all(&docroot).at(&docroot)?;
                self.run(
                    &CommandSpec::new("git")
                        .args(["clone", url.as_str(), DOCUMENT_ROOT])
                        .current_dir(root),
                )?;
                let example = docroot.join(".env.example");
                if !env_path.exists() && example.is_file() {
                    std::fs::copy(&example, &env_path).at(&env_path)?;
                }
                self.run(&tools.composer_spec(&["install".to_string()], &choice)?)?;
                self.run(&tools.artisan_spec(&["key:generate".to_string()], &choice)?)?;
            }
            None => {
                let at_root = self.ctx.for_site(&new.name, "");
                let args = ["create-project", "--prefer-dist", LARAVEL_SKELETON, DOCUMENT_ROOT]
                    .map(str::to_string);
                self.run(&Tools::new(&at_root, self.runner).composer_spec(&args, &choice)?)?;
            }
        }

        let db = &self.ctx.config.database;
        let directives = [
            ("APP_URL", format!("https://{}", domain)),
            ("DB_HOST", db.service.clone()),
            ("DB_DATABASE", new.name.clone()),
            ("DB_USERNAME", db.app_user.clone()),
            ("DB_PASSWORD", db.app_password.clone()),
            ("MAIL_HOST", "mailcatcher".to_string()),
            ("MAIL_PORT", "1025".to_string()),
            ("REDIS_HOST", "redis".to_string()),
        ];
        let content = if env_path.is_file() {
            std::fs::read_to_string(&env_path).at(&env_path)?
        } else {
            String::new()
        };
        std::fs::write(&env_path, rewrite_env_directives(&content, &directives)?).at(&env_path)?;
        debug!(path = %env_path.display(), "Rewrote .env");
        Ok(())
    }

    fn scaffold_wordpress(&self, new: &NewSite, root: &Path, domain: &str) -> Result<()> {
        let docroot = root.join(DOCUMENT_ROOT);
        let in_docroot = self.ctx.for_site(&new.name, DOCUMENT_ROOT);
        let tools = Tools::new(&in_docroot, self.runner);
        let choice = BackendChoice::default();
        let config = &self.ctx.config;
        let wp = |args: Vec<String>| -> Result<()> { self.run(&tools.wp_spec(&args, &choice)?) };

        wp(vec!["core".into(), "download".into()])?;
        wp(vec![
            "config".into(),
            "create".into(),
            format!("--dbhost={}", config.database.service),
            format!("--dbname={}", new.name),
            format!("--dbuser={}", config.database.app_user),
            format!("--dbpass={}", config.database.app_password),
        ])?;
        wp(vec![
            "core".into(),
            "install".into(),
            format!("--url={}", domain),
            format!("--title={}", new.name),
            format!("--admin_user={}", config.wordpress.admin_user),
            format!("--admin_password={}", config.wordpress.admin_password),
            format!("--admin_email={}@{}", config.wordpress.admin_user, domain),
            "--skip-email".into(),
        ])?;

        if let Some(url) = &new.repo_url {
            self.clone_wp_content(url, &docroot)?;
        }

        if new.object_cache {
            let dest = docroot.join("wp-content/object-cache.php");
            match download(&self.object_cache_url, &dest) {
                Ok(()) => info!(site = %new.name, "Installed object cache drop-in"),
                Err(e) => warn!(site = %new.name, error = %format!("{:#}", e), "Could not install object cache drop-in"),
            }
        }

        let wp_config = docroot.join("wp-config.php");
        if wp_config.is_file() {
            let additions = populate_template(
                &self.ctx.templates.get(templates::WP_CONFIG_ADDITIONS)?,
                &[("site_name", new.name.as_str())],
            );
            let content = std::fs::read_to_string(&wp_config).at(&wp_config)?;
            match insert_wp_config_additions(&content, &additions) {
                Some(updated) => std::fs::write(&wp_config, updated).at(&wp_config)?,
                None => warn!(path = %wp_config.display(), "No insertion point in wp-config.php, leaving it unchanged"),
            }
        }

        let cli_config = serde_yaml::to_string(&WpCliConfig { path: DOCUMENT_ROOT })
            .map_err(|e| Error::Config(format!("cannot serialize wp-cli config: {}", e)))?;
        let cli_path = root.join(WP_CLI_CONFIG_FILE);
        std::fs::write(&cli_path, cli_config).at(&cli_path)?;
        Ok(())
    }

    fn clone_wp_content(&self, url: &str, docroot: &Path) -> Result<()> {
        let tmp = docroot.join("wp-content.tmp");
        self.run(
            &CommandSpec::new("git")
                .args(["clone", url, "wp-content.tmp"])
                .current_dir(docroot),
        )?;
        if !tmp.is_dir() {
            warn!(url, "Clone produced no wp-content directory");
            return Ok(());
        }
        let content = docroot.join("wp-content");
        if content.exists() {
            std::fs::remove_dir_all(&content).at(&content)?;
        }
        std::fs::rename(&tmp, &content).at(&content)?;
        Ok(())
    }

    /// Remove a site's host entries, database and directory
    pub fn delete_site(&self, name: &str) -> Result<()> {
        let compose = self.compose();
        orchestrator::require_system_up(self.ctx, &compose)?;

        let registry = self.ctx.registry();
        if !registry.is_site(name) {
            return Err(Error::Precondition(format!("there is no site named '{}'", name)));
        }
        let site = registry.read(name)?;

        for host in &site.hosts {
            self.hosts.remove(host)?;
        }
        self.database(&compose).drop_database(name)?;

        std::fs::remove_dir_all(&site.root).at(&site.root)?;
        info!(site = name, "Site deleted");
        Ok(())
    }
}
