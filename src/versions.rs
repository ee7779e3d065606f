//! PHP versions and the backend identifiers derived from them
//!
//! The enabled version set is computed once per run by [`resolve_enabled_versions`]
//! and handed to every consumer (routing rules, compose topology, tool commands).

use crate::config::Config;
use crate::error::{Error, Result};
use crate::sites::Site;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Suffix for the debug-instrumented variant of a backend service
pub const DEBUG_SUFFIX: &str = "-xdebug";

/// A PHP version, always kept in its textual form ("7.10" is not "7.1")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PhpVersion(String);

impl PhpVersion {
    /// Parse and normalize a version string.
    ///
    /// A bare major version gets a `.0` minor ("7" becomes "7.0").
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let valid = !raw.is_empty()
            && raw
                .split('.')
                .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()));
        if !valid {
            return Err(Error::Config(format!(
                "'{}' is not a valid PHP version (expected something like \"7.4\")",
                raw
            )));
        }

        if raw.contains('.') {
            Ok(Self(raw.to_string()))
        } else {
            Ok(Self(format!("{}.0", raw)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Backend identifier for this version: the separators are dropped, digits kept.
    pub fn backend_id(&self) -> BackendId {
        BackendId(format!("php{}", self.0.replace('.', "")))
    }
}

impl Default for PhpVersion {
    fn default() -> Self {
        Self("7.4".to_string())
    }
}

impl fmt::Display for PhpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PhpVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for PhpVersion {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Integer(u64),
            Float(f64),
        }

        let text = match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s,
            Raw::Integer(n) => n.to_string(),
            Raw::Float(f) => {
                // Unquoted versions arrive as floats; "7.10" has already become 7.1 here.
                warn!(version = f, "PHP version written as a number; quote it to keep it exact");
                f.to_string()
            }
        };

        PhpVersion::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Service identifier of a runtime backend, e.g. `php74`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(String);

impl BackendId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compose service name of the plain variant
    pub fn service(&self) -> String {
        self.0.clone()
    }

    /// Compose service name of the debug variant
    pub fn debug_service(&self) -> String {
        format!("{}{}", self.0, DEBUG_SUFFIX)
    }

    /// nginx variable holding this backend's per-request selection, with the
    /// "site default" sentinel resolved to this backend
    pub fn selector_variable(&self) -> String {
        format!("$backend_{}_default", self.0)
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One enabled runtime backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub version: PhpVersion,
    pub id: BackendId,
}

/// Ordered, duplicate-free set of enabled backends with collision-free identifiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnabledVersions {
    backends: Vec<Backend>,
}

impl EnabledVersions {
    /// Build the set from versions in priority order.
    ///
    /// Repeated versions keep their first position. Two distinct versions that
    /// derive the same backend identifier are a configuration error.
    pub fn from_versions<I>(versions: I) -> Result<Self>
    where
        I: IntoIterator<Item = PhpVersion>,
    {
        let mut backends: Vec<Backend> = Vec::new();

        for version in versions {
            if backends.iter().any(|b| b.version == version) {
                continue;
            }

            let id = version.backend_id();
            if let Some(existing) = backends.iter().find(|b| b.id == id) {
                return Err(Error::BackendCollision {
                    first: existing.version.to_string(),
                    second: version.to_string(),
                    id: id.to_string(),
                });
            }

            backends.push(Backend { version, id });
        }

        Ok(Self { backends })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Backend> {
        self.backends.iter()
    }

    pub fn versions(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.version.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn contains(&self, version: &PhpVersion) -> bool {
        self.backends.iter().any(|b| &b.version == version)
    }

    /// The first backend, which is always the global default
    pub fn default_backend(&self) -> Option<&Backend> {
        self.backends.first()
    }
}

/// Compute every backend that must exist for this run.
///
/// Order: global default, configured extras in listed order, then each site's
/// version in registry order.
pub fn resolve_enabled_versions(config: &Config, sites: &[Site]) -> Result<EnabledVersions> {
    let versions = std::iter::once(config.default_php_version.clone())
        .chain(config.additional_php_versions.iter().cloned())
        .chain(sites.iter().filter_map(|s| s.php_version().cloned()));

    let enabled = EnabledVersions::from_versions(versions)?;
    debug!(versions = ?enabled.versions(), "Resolved enabled PHP versions");
    Ok(enabled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> PhpVersion {
        PhpVersion::parse(s).unwrap()
    }

    #[test]
    fn test_bare_major_is_expanded() {
        assert_eq!(v("7").as_str(), "7.0");
        assert_eq!(v(" 8 ").as_str(), "8.0");
        assert_eq!(v("7.4").as_str(), "7.4");
    }

    #[test]
    fn test_invalid_versions_rejected() {
        assert!(PhpVersion::parse("").is_err());
        assert!(PhpVersion::parse("7.").is_err());
        assert!(PhpVersion::parse("seven").is_err());
        assert!(PhpVersion::parse("7.4-xdebug").is_err());
    }

    #[test]
    fn test_backend_ids_keep_all_digits() {
        assert_eq!(v("7.1").backend_id().as_str(), "php71");
        assert_eq!(v("7.10").backend_id().as_str(), "php710");
        assert_ne!(v("7.1").backend_id(), v("7.10").backend_id());
        assert_eq!(v("5.6").backend_id().debug_service(), "php56-xdebug");
        assert_eq!(
            v("7.4").backend_id().selector_variable(),
            "$backend_php74_default"
        );
    }

    #[test]
    fn test_enabled_versions_deduplicate_in_order() {
        let enabled =
            EnabledVersions::from_versions(vec![v("7.4"), v("5.6"), v("7.4"), v("8.1")]).unwrap();
        assert_eq!(enabled.versions(), vec!["7.4", "5.6", "8.1"]);
        assert_eq!(enabled.default_backend().unwrap().id.as_str(), "php74");
    }

    #[test]
    fn test_colliding_identifiers_are_fatal() {
        let err = EnabledVersions::from_versions(vec![v("7.10"), v("71.0")]).unwrap_err();
        assert!(matches!(err, Error::BackendCollision { .. }));
        assert!(err.to_string().contains("php710"));
    }

    #[test]
    fn test_deserialize_accepts_strings_and_numbers() {
        #[derive(Deserialize)]
        struct Doc {
            a: PhpVersion,
            b: PhpVersion,
            c: PhpVersion,
        }

        let doc: Doc = toml::from_str("a = \"7.10\"\nb = 7\nc = 5.6\n").unwrap();
        assert_eq!(doc.a.as_str(), "7.10");
        assert_eq!(doc.b.as_str(), "7.0");
        assert_eq!(doc.c.as_str(), "5.6");
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        #[derive(Debug, Deserialize)]
        struct Doc {
            #[allow(dead_code)]
            a: PhpVersion,
        }

        assert!(toml::from_str::<Doc>("a = \"latest\"\n").is_err());
    }
}
