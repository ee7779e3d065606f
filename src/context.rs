//! Per-invocation context: resolved paths, configuration, current site

use crate::config::Config;
use crate::error::{Error, Result};
use crate::sites::{SiteRegistry, DOCUMENT_ROOT};
use crate::templates::Templates;
use std::path::{Path, PathBuf};
use tracing::debug;

/// App home directory name under the user's home
pub const APP_DIR: &str = ".portside";
pub const CONFIG_FILE: &str = "config.toml";
pub const RUN_DIR: &str = "_run";
pub const COMPOSE_OVERRIDE_FILE: &str = "docker-compose.custom.yml";
pub const CERT_FILE: &str = "https-certificate.cert";
pub const KEY_FILE: &str = "https-certificate.key";
pub const TEMPLATES_DIR: &str = "templates";

/// The site the working directory is inside of
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentSite {
    pub name: String,
    pub root: PathBuf,
    /// Working directory relative to the site root
    pub path_in_site: PathBuf,
}

/// Everything an operation needs to know about its environment.
///
/// Built once at startup and passed by reference; nested operations that
/// need a different current site derive a new value with [`OperationContext::for_site`].
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub home: PathBuf,
    pub app_home: PathBuf,
    pub run_dir: PathBuf,
    pub config: Config,
    pub templates: Templates,
    pub current_site: Option<CurrentSite>,
}

impl OperationContext {
    /// Resolve the environment from the user's home directory and the working directory
    pub fn discover(app_home: Option<PathBuf>, cwd: &Path) -> Result<Self> {
        let home = dirs_next::home_dir()
            .ok_or_else(|| Error::Config("cannot determine the home directory".into()))?;
        let app_home = app_home.unwrap_or_else(|| home.join(APP_DIR));
        Self::new(home, app_home, cwd)
    }

    pub fn new(home: PathBuf, app_home: PathBuf, cwd: &Path) -> Result<Self> {
        let config = Config::load(&app_home.join(CONFIG_FILE), &home)?;

        if std::fs::create_dir_all(&config.sites_directory).is_err()
            || !config.sites_directory.is_dir()
        {
            return Err(Error::MissingSitesDirectory(config.sites_directory.clone()));
        }

        let current_site = find_current_site(cwd);
        if let Some(site) = &current_site {
            debug!(site = %site.name, path = %site.path_in_site.display(), "Inside site");
        }

        Ok(Self {
            run_dir: app_home.join(RUN_DIR),
            templates: Templates::with_overrides(app_home.join(TEMPLATES_DIR)),
            home,
            app_home,
            config,
            current_site,
        })
    }

    /// A copy of this context positioned at `path_in_site` inside `name`
    pub fn for_site(&self, name: &str, path_in_site: impl Into<PathBuf>) -> Self {
        let mut ctx = self.clone();
        ctx.current_site = Some(CurrentSite {
            name: name.to_string(),
            root: self.config.sites_directory.join(name),
            path_in_site: path_in_site.into(),
        });
        ctx
    }

    pub fn registry(&self) -> SiteRegistry {
        SiteRegistry::new(
            &self.config.sites_directory,
            self.config.default_php_version.clone(),
        )
    }

    pub fn cert_path(&self) -> PathBuf {
        self.app_home.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.app_home.join(KEY_FILE)
    }

    pub fn compose_override_path(&self) -> PathBuf {
        self.app_home.join(COMPOSE_OVERRIDE_FILE)
    }

    pub fn hosts_file_path(&self) -> PathBuf {
        self.run_dir.join("hosts.txt")
    }

    /// Path of a service config file: the app home copy if present, else the bundled one
    pub fn service_config_path(&self, file: &str) -> PathBuf {
        let custom = self.app_home.join(file);
        if custom.is_file() {
            custom
        } else {
            self.run_dir.join("config").join(file)
        }
    }

    /// Name of the current site, or a precondition error
    pub fn require_site(&self) -> Result<&CurrentSite> {
        self.current_site.as_ref().ok_or_else(|| {
            Error::Precondition("this command must be run from within a site directory".into())
        })
    }
}

/// Walk up from `cwd` to the nearest directory containing `htdocs`
pub fn find_current_site(cwd: &Path) -> Option<CurrentSite> {
    let root = cwd
        .ancestors()
        .find(|dir| dir.join(DOCUMENT_ROOT).is_dir())?;
    let name = root.file_name()?.to_str()?.to_string();
    let path_in_site = cwd.strip_prefix(root).ok()?.to_path_buf();

    Some(CurrentSite {
        name,
        root: root.to_path_buf(),
        path_in_site,
    })
}
