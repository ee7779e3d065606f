//! Per-site nginx server blocks

use crate::error::{IoResultExt, Result};
use crate::sites::{Site, SiteKind};
use crate::templates::{self, populate_template, Templates};
use crate::versions::BackendId;
use tracing::debug;

const NO_UPLOADS_PROXY: &str = "\t# Uploads proxy not configured for site";
const NO_STORAGE_PROXY: &str = "\t# Storage proxy not configured for site";

/// Renders nginx configuration for sites
pub struct SiteConfigCompiler<'a> {
    templates: &'a Templates,
    default_backend: &'a BackendId,
}

impl<'a> SiteConfigCompiler<'a> {
    pub fn new(templates: &'a Templates, default_backend: &'a BackendId) -> Self {
        Self {
            templates,
            default_backend,
        }
    }

    /// Server block for one site.
    ///
    /// A `nginx.conf` in the site directory is returned unchanged.
    pub fn compile(&self, site: &Site) -> Result<String> {
        let override_path = site.nginx_override_path();
        if override_path.is_file() {
            debug!(site = %site.name, "Using site nginx.conf override");
            return std::fs::read_to_string(&override_path).at(override_path);
        }

        let (template, backend, port) = match &site.kind {
            SiteKind::Php { version } => ("php", Some(version.backend_id()), None),
            SiteKind::WordPress { version } => ("wordpress", Some(version.backend_id()), None),
            SiteKind::Laravel { version } => ("laravel", Some(version.backend_id()), None),
            SiteKind::Proxy { port } => ("proxy", None, Some(*port)),
        };
        let template = self.templates.site(template)?;

        let backend = backend.unwrap_or_else(|| self.default_backend.clone());
        let php_backend = backend.selector_variable();
        let server_name = site.hosts.join(" ");
        let proxy_port = port.map(|p| p.to_string()).unwrap_or_default();

        let uploads_proxy = match &site.uploads_proxy {
            Some(uploads) => {
                let path = regex::escape(&uploads.path);
                populate_template(
                    &self.templates.get(templates::WP_UPLOADS_PROXY)?,
                    &[
                        ("wp_uploads_proxy_path", path.as_str()),
                        ("wp_uploads_proxy_url", uploads.url.as_str()),
                    ],
                )
            }
            None => NO_UPLOADS_PROXY.to_string(),
        };

        let storage_proxy = match &site.storage_proxy_url {
            Some(url) => populate_template(
                &self.templates.get(templates::LARAVEL_STORAGE_PROXY)?,
                &[("laravel_storage_proxy_url", url.as_str())],
            ),
            None => NO_STORAGE_PROXY.to_string(),
        };

        Ok(populate_template(
            &template,
            &[
                ("server_name", server_name.as_str()),
                ("site_name", site.name.as_str()),
                ("php_backend", php_backend.as_str()),
                ("proxy_port", proxy_port.as_str()),
                ("wp_uploads_proxy_config", uploads_proxy.as_str()),
                ("laravel_storage_proxy_config", storage_proxy.as_str()),
            ],
        ))
    }

    /// Catch-all server for unknown hostnames, served by the global default backend
    pub fn compile_default_site(&self) -> Result<String> {
        let php_backend = self.default_backend.selector_variable();
        Ok(populate_template(
            &self.templates.get(templates::DEFAULT_SITE)?,
            &[("php_backend", php_backend.as_str())],
        ))
    }

    /// The aggregate file: default server followed by every site
    pub fn compile_all(&self, sites: &[Site]) -> Result<String> {
        let mut out = self.compile_default_site()?;
        for site in sites {
            out.push_str(&self.compile(site)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sites::UploadsProxy;
    use crate::versions::PhpVersion;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn version(v: &str) -> PhpVersion {
        PhpVersion::parse(v).unwrap()
    }

    fn site(root: PathBuf, kind: SiteKind) -> Site {
        Site {
            name: "blog".to_string(),
            root,
            kind,
            hosts: vec!["blog.dev".into(), "www.blog.dev".into()],
            uploads_proxy: None,
            storage_proxy_url: None,
            object_cache_enabled: false,
        }
    }

    #[test]
    fn test_php_site_uses_own_backend() {
        let templates = Templates::builtin();
        let default = version("7.4").backend_id();
        let compiler = SiteConfigCompiler::new(&templates, &default);

        let out = compiler
            .compile(&site(PathBuf::from("/nowhere/blog"), SiteKind::Php { version: version("5.6") }))
            .unwrap();
        assert!(out.contains("server_name blog.dev www.blog.dev;"));
        assert!(out.contains("/var/www/html/blog/htdocs"));
        assert!(out.contains("fastcgi_pass $backend_php56_default-$xdebug_suffix;"));
        assert!(!out.contains("{{"));
    }

    #[test]
    fn test_proxy_site_uses_port() {
        let templates = Templates::builtin();
        let default = version("7.4").backend_id();
        let compiler = SiteConfigCompiler::new(&templates, &default);

        let out = compiler
            .compile(&site(PathBuf::from("/nowhere/blog"), SiteKind::Proxy { port: 3000 }))
            .unwrap();
        assert!(out.contains(":3000;"));
        assert!(!out.contains("fastcgi_pass"));
    }

    #[test]
    fn test_uploads_proxy_block() {
        let templates = Templates::builtin();
        let default = version("7.4").backend_id();
        let compiler = SiteConfigCompiler::new(&templates, &default);

        let mut wp = site(PathBuf::from("/nowhere/blog"), SiteKind::WordPress { version: version("7.4") });
        let without = compiler.compile(&wp).unwrap();
        assert!(without.contains(NO_UPLOADS_PROXY));

        wp.uploads_proxy = Some(UploadsProxy {
            url: "https://blog.example.com".into(),
            path: "wp-content/uploads".into(),
        });
        let with = compiler.compile(&wp).unwrap();
        assert!(with.contains(r"location ~ ^/wp\-content/uploads/(.*)$"));
        assert!(with.contains("proxy_pass https://blog.example.com/$1;"));
    }

    #[test]
    fn test_uploads_path_is_regex_escaped() {
        let templates = Templates::builtin();
        let default = version("7.4").backend_id();
        let compiler = SiteConfigCompiler::new(&templates, &default);

        let mut wp = site(PathBuf::from("/nowhere/blog"), SiteKind::WordPress { version: version("7.4") });
        wp.uploads_proxy = Some(UploadsProxy {
            url: "https://blog.example.com".into(),
            path: "files.v2/uploads".into(),
        });
        assert!(compiler.compile(&wp).unwrap().contains(r"^/files\.v2/uploads/"));
    }

    #[test]
    fn test_storage_proxy_block() {
        let templates = Templates::builtin();
        let default = version("7.4").backend_id();
        let compiler = SiteConfigCompiler::new(&templates, &default);

        let mut app = site(PathBuf::from("/nowhere/blog"), SiteKind::Laravel { version: version("8.1") });
        assert!(compiler.compile(&app).unwrap().contains(NO_STORAGE_PROXY));

        app.storage_proxy_url = Some("https://cdn.example.com".into());
        let out = compiler.compile(&app).unwrap();
        assert!(out.contains("proxy_pass https://cdn.example.com/$1;"));
        assert!(out.contains("/htdocs/public"));
    }

    #[test]
    fn test_override_file_used_verbatim() {
        let dir = TempDir::new().unwrap();
        let custom = "server { server_name {{server_name}}; }\n";
        std::fs::write(dir.path().join("nginx.conf"), custom).unwrap();

        let templates = Templates::builtin();
        let default = version("7.4").backend_id();
        let compiler = SiteConfigCompiler::new(&templates, &default);

        let out = compiler
            .compile(&site(dir.path().to_path_buf(), SiteKind::Php { version: version("7.4") }))
            .unwrap();
        assert_eq!(out, custom);
    }

    #[test]
    fn test_compile_all_starts_with_default_site() {
        let templates = Templates::builtin();
        let default = version("7.4").backend_id();
        let compiler = SiteConfigCompiler::new(&templates, &default);

        let sites = vec![site(PathBuf::from("/nowhere/blog"), SiteKind::Php { version: version("7.4") })];
        let out = compiler.compile_all(&sites).unwrap();
        assert!(out.starts_with("server {\n\tlisten 80 default_server;"));
        assert!(out.contains("fastcgi_pass $backend_php74_default-$xdebug_suffix;"));
        assert!(out.contains("server_name blog.dev www.blog.dev;"));
        assert!(out.ends_with("}\n\n"));
    }
}
