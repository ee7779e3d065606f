//! Site registry: discovery, settings files and type inference

use crate::error::{Error, IoResultExt, Result};
use crate::versions::PhpVersion;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Subdirectory every site must contain
pub const DOCUMENT_ROOT: &str = "htdocs";
pub const SETTINGS_FILE: &str = "portside.toml";
/// Older YAML settings file, read when `portside.toml` is absent
pub const LEGACY_SETTINGS_FILE: &str = "config.yml";
/// Hand-written nginx fragment that replaces the generated one
pub const NGINX_OVERRIDE_FILE: &str = "nginx.conf";

const DEFAULT_TLD: &str = "dev";
const DEFAULT_PROXY_PORT: u16 = 80;
const DEFAULT_UPLOADS_PATH: &str = "wp-content/uploads";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteType {
    Php,
    #[serde(alias = "wp")]
    WordPress,
    Laravel,
    Proxy,
}

impl SiteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteType::Php => "php",
            SiteType::WordPress => "wordpress",
            SiteType::Laravel => "laravel",
            SiteType::Proxy => "proxy",
        }
    }

    /// Whether sites of this type get a database on creation
    pub fn needs_database(&self) -> bool {
        matches!(self, SiteType::WordPress | SiteType::Laravel)
    }
}

impl fmt::Display for SiteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SiteType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "php" => Ok(SiteType::Php),
            "wordpress" | "wp" => Ok(SiteType::WordPress),
            "laravel" => Ok(SiteType::Laravel),
            "proxy" => Ok(SiteType::Proxy),
            other => Err(Error::Config(format!(
                "unknown site type '{}' (expected php, wordpress, laravel or proxy)",
                other
            ))),
        }
    }
}

/// On-disk settings of one site. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteSettings {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub site_type: Option<SiteType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_php_version: Option<PhpVersion>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,

    /// Remote site to fetch missing uploads from
    #[serde(alias = "wp_uploads_proxy_url", skip_serializing_if = "Option::is_none")]
    pub uploads_proxy_url: Option<String>,

    #[serde(alias = "wp_uploads_proxy_path", skip_serializing_if = "Option::is_none")]
    pub uploads_proxy_path: Option<String>,

    /// Remote site to fetch missing storage files from
    #[serde(alias = "laravel_storage_proxy_url", skip_serializing_if = "Option::is_none")]
    pub storage_proxy_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_cache_enabled: Option<bool>,
}

/// What a site runs, with the data only that kind carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteKind {
    Php { version: PhpVersion },
    WordPress { version: PhpVersion },
    Laravel { version: PhpVersion },
    Proxy { port: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadsProxy {
    pub url: String,
    /// Path below the document root, unescaped
    pub path: String,
}

/// A fully resolved site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub name: String,
    pub root: PathBuf,
    pub kind: SiteKind,
    pub hosts: Vec<String>,
    pub uploads_proxy: Option<UploadsProxy>,
    pub storage_proxy_url: Option<String>,
    pub object_cache_enabled: bool,
}

impl Site {
    /// Runtime version for non-proxy sites
    pub fn php_version(&self) -> Option<&PhpVersion> {
        match &self.kind {
            SiteKind::Php { version }
            | SiteKind::WordPress { version }
            | SiteKind::Laravel { version } => Some(version),
            SiteKind::Proxy { .. } => None,
        }
    }

    pub fn site_type(&self) -> SiteType {
        match self.kind {
            SiteKind::Php { .. } => SiteType::Php,
            SiteKind::WordPress { .. } => SiteType::WordPress,
            SiteKind::Laravel { .. } => SiteType::Laravel,
            SiteKind::Proxy { .. } => SiteType::Proxy,
        }
    }

    pub fn document_root(&self) -> PathBuf {
        self.root.join(DOCUMENT_ROOT)
    }

    pub fn nginx_override_path(&self) -> PathBuf {
        self.root.join(NGINX_OVERRIDE_FILE)
    }
}

/// Suggested hostname for a new site: lowercase, `_` replaced by `-`, `.dev` appended
pub fn default_domain(name: &str) -> String {
    format!("{}.{}", name.to_lowercase().replace('_', "-"), DEFAULT_TLD)
}

/// Site names are limited to `[a-z0-9-_.]`
pub fn is_valid_site_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"-_.".contains(&b))
}

/// RFC 1123 style hostname check (underscores tolerated inside labels)
pub fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        let bytes = label.as_bytes();
        !bytes.is_empty()
            && bytes.len() <= 63
            && bytes[0].is_ascii_alphanumeric()
            && bytes[bytes.len() - 1].is_ascii_alphanumeric()
            && bytes
                .iter()
                .all(|b| b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_')
    })
}

/// Reads sites out of the sites directory
#[derive(Debug, Clone)]
pub struct SiteRegistry {
    root: PathBuf,
    default_php_version: PhpVersion,
}

impl SiteRegistry {
    pub fn new(root: impl Into<PathBuf>, default_php_version: PhpVersion) -> Self {
        Self {
            root: root.into(),
            default_php_version,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn site_root(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Whether the entry `name` in the sites directory qualifies as a site
    pub fn is_site(&self, name: &str) -> bool {
        if !is_valid_site_name(name) {
            return false;
        }
        let path = self.root.join(name);
        // symlinked directories are not sites
        let is_dir = std::fs::symlink_metadata(&path)
            .map(|m| m.is_dir())
            .unwrap_or(false);
        is_dir && path.join(DOCUMENT_ROOT).is_dir()
    }

    /// Names of all sites, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.root).at(&self.root)?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.at(&self.root)?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if self.is_site(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Read and resolve one site
    pub fn read(&self, name: &str) -> Result<Site> {
        let root = self.site_root(name);
        let settings = self.read_settings(name)?;
        resolve_site(name, root, settings, &self.default_php_version)
    }

    /// Every site in registry order
    pub fn load_all(&self) -> Result<Vec<Site>> {
        self.list()?.iter().map(|name| self.read(name)).collect()
    }

    /// Raw settings of a site, `portside.toml` first, then the legacy YAML file
    pub fn read_settings(&self, name: &str) -> Result<SiteSettings> {
        let root = self.site_root(name);
        let primary = root.join(SETTINGS_FILE);
        let legacy = root.join(LEGACY_SETTINGS_FILE);

        if primary.is_file() {
            let Some(content) = read_optional(&primary) else {
                return Ok(SiteSettings::default());
            };
            return toml::from_str(&content).map_err(|e| Error::MalformedSettings {
                path: primary,
                message: e.to_string(),
            });
        }

        if legacy.is_file() {
            let Some(content) = read_optional(&legacy) else {
                return Ok(SiteSettings::default());
            };
            if content.trim().is_empty() {
                return Ok(SiteSettings::default());
            }
            return serde_yaml::from_str(&content).map_err(|e| Error::MalformedSettings {
                path: legacy,
                message: e.to_string(),
            });
        }

        Ok(SiteSettings::default())
    }

    /// Write `portside.toml` for a site
    pub fn save_settings(&self, name: &str, settings: &SiteSettings) -> Result<()> {
        let path = self.site_root(name).join(SETTINGS_FILE);
        let content = toml::to_string(settings)
            .map_err(|e| Error::Config(format!("cannot serialize settings for {}: {}", name, e)))?;
        std::fs::write(&path, content).at(&path)?;
        debug!(site = name, path = %path.display(), "Saved site settings");
        Ok(())
    }
}

fn read_optional(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Settings file unreadable, using defaults");
            None
        }
    }
}

fn infer_type(root: &Path) -> SiteType {
    let docroot = root.join(DOCUMENT_ROOT);
    if docroot.join("artisan").exists() {
        SiteType::Laravel
    } else if docroot.join("wp-config.php").exists() {
        SiteType::WordPress
    } else {
        SiteType::Php
    }
}

/// Layer defaults under raw settings and check the result
fn resolve_site(
    name: &str,
    root: PathBuf,
    settings: SiteSettings,
    default_version: &PhpVersion,
) -> Result<Site> {
    let settings_path = root.join(SETTINGS_FILE);
    let malformed = |message: String| Error::MalformedSettings {
        path: settings_path.clone(),
        message,
    };

    let site_type = settings.site_type.unwrap_or_else(|| infer_type(&root));
    let version = settings
        .default_php_version
        .unwrap_or_else(|| default_version.clone());

    let kind = match site_type {
        SiteType::Php => SiteKind::Php { version },
        SiteType::WordPress => SiteKind::WordPress { version },
        SiteType::Laravel => SiteKind::Laravel { version },
        SiteType::Proxy => {
            let port = settings.proxy_port.unwrap_or(DEFAULT_PROXY_PORT);
            if port == 0 {
                return Err(malformed("proxy_port must be a positive port number".into()));
            }
            SiteKind::Proxy { port }
        }
    };

    // Only hosts written in the settings file are validated; the derived one is
    // used as is, whatever the directory is called.
    let hosts: Vec<String> = match settings.hosts {
        Some(hosts) => {
            let hosts: Vec<String> = hosts.iter().map(|h| h.trim().to_lowercase()).collect();
            if hosts.is_empty() {
                return Err(malformed("at least one host is required".into()));
            }
            if let Some(bad) = hosts.iter().find(|h| !is_valid_hostname(h)) {
                return Err(malformed(format!("'{}' is not a valid hostname", bad)));
            }
            hosts
        }
        None => vec![format!("{}.{}", name, DEFAULT_TLD)],
    };
    let listed = hosts.len();
    let hosts = dedup_preserving_order(hosts);
    if hosts.len() != listed {
        warn!(site = name, "Duplicate hosts listed in site settings; keeping the first of each");
    }

    let uploads_proxy = settings.uploads_proxy_url.map(|url| UploadsProxy {
        url: url.trim_end_matches('/').to_string(),
        path: settings
            .uploads_proxy_path
            .map(|p| p.trim_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_UPLOADS_PATH.to_string()),
    });

    Ok(Site {
        name: name.to_string(),
        root,
        kind,
        hosts,
        uploads_proxy,
        storage_proxy_url: settings
            .storage_proxy_url
            .map(|u| u.trim_end_matches('/').to_string()),
        object_cache_enabled: settings.object_cache_enabled.unwrap_or(false),
    })
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|i| seen.insert(i.clone())).collect()
}
