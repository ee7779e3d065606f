use crate::error::{Error, IoResultExt, Result};
use crate::versions::PhpVersion;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Global configuration as written in `config.toml`.
///
/// Every field is optional; [`ConfigFile::apply_defaults`] turns it into a [`Config`].
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// PHP version used by sites without their own setting
    pub default_php_version: Option<PhpVersion>,

    /// Versions to run even when no site references them
    #[serde(default)]
    pub additional_php_versions: Vec<PhpVersion>,

    /// Directory holding one subdirectory per site (default: ~/Sites)
    pub sites_directory: Option<PathBuf>,

    /// Image naming scheme for PHP backends; `{version}` is substituted
    pub php_image: Option<String>,

    /// Build PHP images from `<path>/<version>` instead of pulling them
    pub php_images_local_path: Option<PathBuf>,

    /// Command used to drive docker compose (default: ["docker", "compose"])
    pub compose_command: Option<Vec<String>>,

    /// Admin account for new WordPress installs
    pub wp_default_username: Option<String>,
    pub wp_default_password: Option<String>,

    #[serde(default)]
    pub database: DatabaseFile,

    #[serde(default)]
    pub hosts: HostsFile,

    #[serde(default)]
    pub trust_store: TrustStoreFile,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct DatabaseFile {
    pub service: Option<String>,
    pub root_password: Option<String>,
    pub app_user: Option<String>,
    pub app_password: Option<String>,
    pub max_attempts: Option<u32>,
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct HostsFile {
    /// Command prefix for the hosts-file tool (default: ["sudo", "hostile"])
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct TrustStoreFile {
    pub kind: Option<TrustStoreKind>,
    pub keychain: Option<PathBuf>,
}

/// Where the generated certificate gets trusted
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrustStoreKind {
    /// macOS system keychain via `security`
    Keychain,
    /// Do not touch any trust store
    None,
}

impl Default for TrustStoreKind {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            TrustStoreKind::Keychain
        } else {
            TrustStoreKind::None
        }
    }
}

/// Resolved global configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub default_php_version: PhpVersion,
    pub additional_php_versions: Vec<PhpVersion>,
    pub sites_directory: PathBuf,
    pub php_image: String,
    pub php_images_local_path: Option<PathBuf>,
    pub compose_command: Vec<String>,
    pub wordpress: WordPressDefaults,
    pub database: DatabaseConfig,
    pub hosts_command: Vec<String>,
    pub trust_store: TrustStoreConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WordPressDefaults {
    pub admin_user: String,
    pub admin_password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// Compose service (and network host name) of the database
    pub service: String,
    pub root_password: String,
    pub app_user: String,
    pub app_password: String,
    pub max_attempts: u32,
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrustStoreConfig {
    pub kind: TrustStoreKind,
    pub keychain: PathBuf,
}

// Default value functions
fn default_php_image() -> String {
    "portside/php:{version}-dev".to_string()
}

fn default_compose_command() -> Vec<String> {
    vec!["docker".to_string(), "compose".to_string()]
}

fn default_hosts_command() -> Vec<String> {
    vec!["sudo".to_string(), "hostile".to_string()]
}

fn default_keychain() -> PathBuf {
    PathBuf::from("/Library/Keychains/System.keychain")
}

fn default_db_max_attempts() -> u32 {
    30
}

fn default_db_interval_ms() -> u64 {
    1000
}

impl ConfigFile {
    /// Layer defaults under the loaded values. `home` is the user's home directory.
    pub fn apply_defaults(self, home: &Path) -> Config {
        let db = self.database;
        Config {
            default_php_version: self.default_php_version.unwrap_or_default(),
            additional_php_versions: self.additional_php_versions,
            sites_directory: self
                .sites_directory
                .map(|p| expand_home(&p, home))
                .unwrap_or_else(|| home.join("Sites")),
            php_image: self.php_image.unwrap_or_else(default_php_image),
            php_images_local_path: self.php_images_local_path.map(|p| expand_home(&p, home)),
            compose_command: self.compose_command.unwrap_or_else(default_compose_command),
            wordpress: WordPressDefaults {
                admin_user: self.wp_default_username.unwrap_or_else(|| "admin".to_string()),
                admin_password: self.wp_default_password.unwrap_or_else(|| "password".to_string()),
            },
            database: DatabaseConfig {
                service: db.service.unwrap_or_else(|| "mysql".to_string()),
                root_password: db.root_password.unwrap_or_else(|| "root".to_string()),
                app_user: db.app_user.unwrap_or_else(|| "portside".to_string()),
                app_password: db.app_password.unwrap_or_else(|| "portside".to_string()),
                max_attempts: db.max_attempts.unwrap_or_else(default_db_max_attempts),
                interval: Duration::from_millis(db.interval_ms.unwrap_or_else(default_db_interval_ms)),
            },
            hosts_command: self.hosts.command.unwrap_or_else(default_hosts_command),
            trust_store: TrustStoreConfig {
                kind: self.trust_store.kind.unwrap_or_default(),
                keychain: self.trust_store.keychain.unwrap_or_else(default_keychain),
            },
        }
    }
}

impl Config {
    /// Load `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path, home: &Path) -> Result<Self> {
        let file = if path.exists() {
            let content = std::fs::read_to_string(path).at(path)?;
            toml::from_str::<ConfigFile>(&content).map_err(|e| Error::MalformedSettings {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            debug!(path = %path.display(), "No configuration file, using defaults");
            ConfigFile::default()
        };

        let config = file.apply_defaults(home);
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if !self.php_image.contains("{version}") {
            errors.push(format!(
                "php_image '{}' must contain a {{version}} placeholder",
                self.php_image
            ));
        }

        if let Some(path) = &self.php_images_local_path {
            if !path.is_dir() {
                errors.push(format!(
                    "the PHP images local path {} does not exist",
                    path.display()
                ));
            }
        }

        if self.compose_command.is_empty() {
            errors.push("compose_command must not be empty".to_string());
        }

        if self.hosts_command.is_empty() {
            errors.push("hosts.command must not be empty".to_string());
        }

        if self.database.max_attempts == 0 {
            errors.push("database.max_attempts must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(Error::Config(format!(
                "Configuration errors:\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(())
    }
}

fn expand_home(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}
