//! Bundled templates and `{{placeholder}}` substitution
//!
//! Every template ships inside the binary. A file with the same relative name
//! under `<app_home>/templates/` replaces the bundled copy.

use crate::error::{Error, IoResultExt, Result};
use regex::{NoExpand, RegexBuilder};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const COMPOSE_BASE: &str = "run/docker-compose.yml";
pub const COMPOSE_ENV: &str = "run/env";
pub const DEFAULT_SITE: &str = "nginx/default-site.conf";
pub const DEFAULT_SITE_INDEX: &str = "nginx-default-site/index.html";
pub const WP_UPLOADS_PROXY: &str = "nginx/wp-uploads-proxy.conf";
pub const LARAVEL_STORAGE_PROXY: &str = "nginx/laravel-storage-proxy.conf";
/// Directives inserted into a new WordPress site's `wp-config.php`
pub const WP_CONFIG_ADDITIONS: &str = "wordpress/wp-config-additions.php";

/// Service configuration files copied into the run directory and mounted by the topology
pub const SERVICE_CONFIG_FILES: [&str; 6] = [
    "nginx.conf",
    "php.ini",
    "php-fpm.conf",
    "xdebug.ini",
    "mysql.conf",
    "ssmtp.conf",
];

const BUILTIN: &[(&str, &str)] = &[
    (COMPOSE_BASE, include_str!("../templates/run/docker-compose.yml")),
    (COMPOSE_ENV, include_str!("../templates/run/env")),
    ("nginx/php-site.conf", include_str!("../templates/nginx/php-site.conf")),
    (
        "nginx/wordpress-site.conf",
        include_str!("../templates/nginx/wordpress-site.conf"),
    ),
    (
        "nginx/laravel-site.conf",
        include_str!("../templates/nginx/laravel-site.conf"),
    ),
    ("nginx/proxy-site.conf", include_str!("../templates/nginx/proxy-site.conf")),
    (WP_UPLOADS_PROXY, include_str!("../templates/nginx/wp-uploads-proxy.conf")),
    (
        LARAVEL_STORAGE_PROXY,
        include_str!("../templates/nginx/laravel-storage-proxy.conf"),
    ),
    (DEFAULT_SITE, include_str!("../templates/nginx/default-site.conf")),
    (
        DEFAULT_SITE_INDEX,
        include_str!("../templates/nginx-default-site/index.html"),
    ),
    (
        WP_CONFIG_ADDITIONS,
        include_str!("../templates/wordpress/wp-config-additions.php"),
    ),
    ("config/nginx.conf", include_str!("../templates/config/nginx.conf")),
    ("config/php.ini", include_str!("../templates/config/php.ini")),
    ("config/php-fpm.conf", include_str!("../templates/config/php-fpm.conf")),
    ("config/xdebug.ini", include_str!("../templates/config/xdebug.ini")),
    ("config/mysql.conf", include_str!("../templates/config/mysql.conf")),
    ("config/ssmtp.conf", include_str!("../templates/config/ssmtp.conf")),
];

/// Template lookup with an optional override directory
#[derive(Debug, Clone)]
pub struct Templates {
    override_dir: Option<PathBuf>,
}

impl Templates {
    /// Bundled templates only
    pub fn builtin() -> Self {
        Self { override_dir: None }
    }

    /// Bundled templates, shadowed by files under `dir`
    pub fn with_overrides(dir: impl Into<PathBuf>) -> Self {
        Self {
            override_dir: Some(dir.into()),
        }
    }

    /// Fetch a template by relative name
    pub fn get(&self, name: &str) -> Result<Cow<'static, str>> {
        if let Some(dir) = &self.override_dir {
            let path = dir.join(name);
            if path.is_file() {
                debug!(template = name, path = %path.display(), "Using template override");
                return std::fs::read_to_string(&path).at(path).map(Cow::Owned);
            }
        }

        BUILTIN
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, text)| Cow::Borrowed(*text))
            .ok_or_else(|| Error::TemplateMissing(name.to_string()))
    }

    /// nginx template for a site type, e.g. `php` -> `nginx/php-site.conf`
    pub fn site(&self, type_name: &str) -> Result<Cow<'static, str>> {
        self.get(&format!("nginx/{}-site.conf", type_name))
    }

    /// Bundled content of a service configuration file
    pub fn service_config(&self, file: &str) -> Result<Cow<'static, str>> {
        self.get(&format!("config/{}", file))
    }

    /// Write every service configuration file into `dir`
    pub fn write_service_configs(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).at(dir)?;
        for file in SERVICE_CONFIG_FILES {
            let path = dir.join(file);
            std::fs::write(&path, self.service_config(file)?.as_bytes()).at(&path)?;
        }
        Ok(())
    }
}

/// Replace `{{name}}` placeholders with their values.
///
/// Names match case-insensitively. Placeholders without a value are left as-is.
pub fn populate_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        let pattern = format!(r"\{{\{{{}\}}\}}", regex::escape(name));
        let re = match RegexBuilder::new(&pattern).case_insensitive(true).build() {
            Ok(re) => re,
            Err(_) => continue,
        };
        out = re.replace_all(&out, NoExpand(value)).into_owned();
    }
    out
}
