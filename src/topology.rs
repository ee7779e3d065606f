//! docker compose topology assembly
//!
//! The base template declares one placeholder `php` service. It is replaced,
//! at its original position, by a plain and a debug service per enabled backend.

use crate::error::{Error, Result};
use crate::versions::{Backend, EnabledVersions, DEBUG_SUFFIX};
use serde_yaml::{Mapping, Value};
use std::path::PathBuf;

/// Name of the placeholder backend service in the base template
pub const PLACEHOLDER_SERVICE: &str = "php";
/// Service carrying the hostname aliases
pub const PROXY_SERVICE: &str = "nginx";
pub const NETWORK: &str = "main";

/// Where backend images come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Pull `template` with `{version}` substituted
    Registry { template: String },
    /// Build from `<root>/<version>` and `<root>/<version>/xdebug`
    LocalBuild { root: PathBuf },
}

impl ImageSource {
    fn entry(&self, backend: &Backend, debug: bool) -> (Value, Value) {
        let version = backend.version.as_str();
        match self {
            ImageSource::Registry { template } => {
                let tag = if debug {
                    format!("{}{}", version, DEBUG_SUFFIX)
                } else {
                    version.to_string()
                };
                (
                    Value::from("image"),
                    Value::from(template.replace("{version}", &tag)),
                )
            }
            ImageSource::LocalBuild { root } => {
                let mut path = root.join(version);
                if debug {
                    path = path.join(DEBUG_SUFFIX.trim_start_matches('-'));
                }
                (
                    Value::from("build"),
                    Value::from(path.to_string_lossy().into_owned()),
                )
            }
        }
    }
}

/// Build the topology descriptor.
///
/// `base` is the populated base template; `override_doc` is the user's
/// compose override, deep-merged last.
pub fn assemble(
    base: &str,
    enabled: &EnabledVersions,
    hostnames: &[String],
    images: &ImageSource,
    override_doc: Option<&str>,
) -> Result<Value> {
    let mut doc: Value = serde_yaml::from_str(base)
        .map_err(|e| Error::Topology(format!("cannot parse base template: {}", e)))?;

    let services = doc
        .get_mut("services")
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| Error::Topology("no services mapping".into()))?;

    expand_backends(services, enabled, images)?;
    rewrite_dependencies(services, enabled);
    attach_aliases(services, hostnames)?;

    if let Some(text) = override_doc {
        let overlay: Value = serde_yaml::from_str(text)
            .map_err(|e| Error::Topology(format!("cannot parse compose override: {}", e)))?;
        deep_merge(&mut doc, overlay);
    }

    Ok(doc)
}

/// Serialize a descriptor
pub fn render(doc: &Value) -> Result<String> {
    serde_yaml::to_string(doc).map_err(|e| Error::Topology(e.to_string()))
}

fn backend_services(enabled: &EnabledVersions) -> Vec<String> {
    enabled
        .iter()
        .flat_map(|b| [b.id.service(), b.id.debug_service()])
        .collect()
}

fn expand_backends(
    services: &mut Mapping,
    enabled: &EnabledVersions,
    images: &ImageSource,
) -> Result<()> {
    let placeholder = services
        .get(PLACEHOLDER_SERVICE)
        .and_then(Value::as_mapping)
        .cloned()
        .ok_or_else(|| {
            Error::Topology(format!(
                "base template has no '{}' service",
                PLACEHOLDER_SERVICE
            ))
        })?;

    let mut rebuilt = Mapping::new();
    for (name, service) in std::mem::take(services) {
        if name.as_str() != Some(PLACEHOLDER_SERVICE) {
            rebuilt.insert(name, service);
            continue;
        }
        for backend in enabled.iter() {
            for (service_name, debug) in [
                (backend.id.service(), false),
                (backend.id.debug_service(), true),
            ] {
                rebuilt.insert(
                    Value::from(service_name),
                    Value::Mapping(backend_service(&placeholder, images.entry(backend, debug))),
                );
            }
        }
    }
    *services = rebuilt;
    Ok(())
}

/// Clone of the placeholder with the image reference first
fn backend_service(placeholder: &Mapping, (key, value): (Value, Value)) -> Mapping {
    let mut service = Mapping::new();
    service.insert(key, value);
    for (k, v) in placeholder {
        if k.as_str() == Some("image") || k.as_str() == Some("build") {
            continue;
        }
        service.insert(k.clone(), v.clone());
    }
    service
}

/// Point dependencies on the placeholder at every backend service
fn rewrite_dependencies(services: &mut Mapping, enabled: &EnabledVersions) {
    let replacements = backend_services(enabled);

    for (_, service) in services.iter_mut() {
        let Some(depends_on) = service.get_mut("depends_on") else {
            continue;
        };
        match depends_on {
            Value::Sequence(items) => {
                if !items.iter().any(|v| v.as_str() == Some(PLACEHOLDER_SERVICE)) {
                    continue;
                }
                let mut rewritten = Vec::new();
                for item in items.drain(..) {
                    if item.as_str() == Some(PLACEHOLDER_SERVICE) {
                        rewritten.extend(replacements.iter().cloned().map(Value::from));
                    } else {
                        rewritten.push(item);
                    }
                }
                *items = rewritten;
            }
            Value::Mapping(map) => {
                let Some(condition) = map.remove(PLACEHOLDER_SERVICE) else {
                    continue;
                };
                for name in &replacements {
                    map.insert(Value::from(name.clone()), condition.clone());
                }
            }
            _ => {}
        }
    }
}

fn attach_aliases(services: &mut Mapping, hostnames: &[String]) -> Result<()> {
    let proxy = services
        .get_mut(PROXY_SERVICE)
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| Error::Topology(format!("no '{}' service", PROXY_SERVICE)))?;

    let networks = proxy
        .get_mut("networks")
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| {
            Error::Topology(format!("'{}' must declare networks as a mapping", PROXY_SERVICE))
        })?;

    let network = networks
        .entry(Value::from(NETWORK))
        .or_insert(Value::Null);
    if network.is_null() {
        *network = Value::Mapping(Mapping::new());
    }
    let network = network
        .as_mapping_mut()
        .ok_or_else(|| Error::Topology(format!("network '{}' must be a mapping", NETWORK)))?;

    network.insert(
        Value::from("aliases"),
        Value::Sequence(hostnames.iter().cloned().map(Value::from).collect()),
    );
    Ok(())
}

/// Overlay `overlay` onto `base`: mappings merge key by key, anything else replaces
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
