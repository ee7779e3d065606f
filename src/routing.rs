//! Backend routing rules for nginx
//!
//! A request picks its PHP backend through a chain of nginx `map` blocks:
//! `?php=` query parameter, then the `php` cookie, then the site's own default.
//! A second, independent chain picks the debug variant (`?xdebug=`, cookie, off).
//!
//! nginx has no per-site data at map evaluation time, so the "use the site's
//! default" case is carried as the [`SITE_DEFAULT`] sentinel and resolved by one
//! map per backend (`$backend_php74_default`). Each site's `fastcgi_pass` names
//! the map of its own default backend.
//!
//! The rules are kept as data so they can be rendered and also evaluated
//! in-process with [`RoutingRules::resolve`].

use crate::versions::{BackendId, EnabledVersions};
use std::collections::HashMap;
use std::fmt::Write;

/// Chain value meaning "no override, use the site's default backend"
pub const SITE_DEFAULT: &str = "sitedefault";
pub const NO_DEBUG: &str = "noxdebug";
pub const DEBUG: &str = "xdebug";

/// Cookie and query parameter that override the backend version
pub const VERSION_PARAM: &str = "php";
/// Cookie and query parameter that toggle the debug variant
pub const DEBUG_PARAM: &str = "xdebug";

const COOKIE_VERSION_VAR: &str = "$cookie_backend_version";
const VERSION_VAR: &str = "$backend_version";
const COOKIE_DEBUG_VAR: &str = "$xdebug_suffix_cookie";
const DEBUG_VAR: &str = "$xdebug_suffix";

/// One nginx `map` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NginxMap {
    pub source: String,
    pub target: String,
    pub default: String,
    pub entries: Vec<(String, String)>,
}

impl NginxMap {
    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "map {} {} {{", self.source, self.target);
        let _ = writeln!(out, "\tdefault {};", self.default);
        for (key, value) in &self.entries {
            let _ = writeln!(out, "\t{:<7} {};", key, value);
        }
        out.push_str("}\n");
    }

    /// nginx compares map strings case-insensitively
    fn lookup(&self, input: &str) -> &str {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(input))
            .map(|(_, value)| value.as_str())
            .unwrap_or(&self.default)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub name: String,
    pub server: String,
}

/// Request-scoped inputs the routing chain reads
#[derive(Debug, Clone, Default)]
pub struct RequestSignals<'a> {
    pub query_version: Option<&'a str>,
    pub cookie_version: Option<&'a str>,
    pub query_debug: Option<&'a str>,
    pub cookie_debug: Option<&'a str>,
}

/// Outcome of evaluating the chain for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub backend: String,
    pub debug: bool,
}

impl Resolution {
    /// Name of the upstream block nginx passes the request to
    pub fn upstream(&self) -> String {
        format!("{}-{}", self.backend, if self.debug { DEBUG } else { NO_DEBUG })
    }
}

/// Compiled routing rules for an enabled backend set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRules {
    maps: Vec<NginxMap>,
    upstreams: Vec<Upstream>,
}

impl RoutingRules {
    pub fn compile(enabled: &EnabledVersions) -> Self {
        let version_entries: Vec<(String, String)> = enabled
            .iter()
            .map(|b| (b.version.to_string(), b.id.to_string()))
            .collect();

        let mut maps = vec![
            NginxMap {
                source: format!("$cookie_{}", VERSION_PARAM),
                target: COOKIE_VERSION_VAR.to_string(),
                default: SITE_DEFAULT.to_string(),
                entries: version_entries.clone(),
            },
            NginxMap {
                source: format!("$arg_{}", VERSION_PARAM),
                target: VERSION_VAR.to_string(),
                default: COOKIE_VERSION_VAR.to_string(),
                entries: version_entries,
            },
        ];

        maps.extend(enabled.iter().map(|b| NginxMap {
            source: VERSION_VAR.to_string(),
            target: b.id.selector_variable(),
            default: VERSION_VAR.to_string(),
            entries: vec![(SITE_DEFAULT.to_string(), b.id.to_string())],
        }));

        let debug_entries = vec![
            ("off".to_string(), NO_DEBUG.to_string()),
            ("on".to_string(), DEBUG.to_string()),
        ];
        maps.push(NginxMap {
            source: format!("$cookie_{}", DEBUG_PARAM),
            target: COOKIE_DEBUG_VAR.to_string(),
            default: NO_DEBUG.to_string(),
            entries: debug_entries.clone(),
        });
        maps.push(NginxMap {
            source: format!("$arg_{}", DEBUG_PARAM),
            target: DEBUG_VAR.to_string(),
            default: COOKIE_DEBUG_VAR.to_string(),
            entries: debug_entries,
        });

        let upstreams = enabled
            .iter()
            .flat_map(|b| {
                [
                    Upstream {
                        name: format!("{}-{}", b.id, NO_DEBUG),
                        server: format!("{}:9000", b.id.service()),
                    },
                    Upstream {
                        name: format!("{}-{}", b.id, DEBUG),
                        server: format!("{}:9000", b.id.debug_service()),
                    },
                ]
            })
            .collect();

        Self { maps, upstreams }
    }

    pub fn maps(&self) -> &[NginxMap] {
        &self.maps
    }

    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }

    /// Render the nginx include file
    pub fn render(&self) -> String {
        let mut out = String::new();
        for map in &self.maps {
            map.render(&mut out);
            out.push('\n');
        }
        for upstream in &self.upstreams {
            let _ = writeln!(
                out,
                "upstream {} {{server {};}}",
                upstream.name, upstream.server
            );
        }
        out
    }

    /// Evaluate the chain the way nginx would for a site whose default backend is `site_backend`.
    ///
    /// Returns `None` only when the rules reference a variable they never define.
    pub fn resolve(&self, request: &RequestSignals<'_>, site_backend: &BackendId) -> Option<Resolution> {
        // absent variables evaluate to the empty string in nginx
        let inputs: HashMap<String, &str> = [
            (format!("$arg_{}", VERSION_PARAM), request.query_version),
            (format!("$cookie_{}", VERSION_PARAM), request.cookie_version),
            (format!("$arg_{}", DEBUG_PARAM), request.query_debug),
            (format!("$cookie_{}", DEBUG_PARAM), request.cookie_debug),
        ]
        .into_iter()
        .map(|(name, value)| (name, value.unwrap_or("")))
        .collect();

        let backend = self.eval(&site_backend.selector_variable(), &inputs, 0)?;
        let debug = self.eval(DEBUG_VAR, &inputs, 0)?;
        let resolution = Resolution {
            backend,
            debug: debug == DEBUG,
        };

        let name = resolution.upstream();
        self.upstreams
            .iter()
            .any(|u| u.name == name)
            .then_some(resolution)
    }

    fn eval(&self, value: &str, inputs: &HashMap<String, &str>, depth: usize) -> Option<String> {
        if !value.starts_with('$') {
            return Some(value.to_string());
        }
        if depth > self.maps.len() {
            return None;
        }
        if let Some(input) = inputs.get(value) {
            return Some(input.to_string());
        }
        let map = self.maps.iter().find(|m| m.target == value)?;
        let input = self.eval(&map.source, inputs, depth + 1)?;
        self.eval(map.lookup(&input), inputs, depth + 1)
    }
}
