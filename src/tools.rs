//! Developer tool passthroughs into the running containers
//!
//! `wp`, `composer` and `artisan` run as the web user inside a PHP backend,
//! starting from the container path that mirrors the current working directory.

use crate::context::{CurrentSite, OperationContext};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, CommandSpec, Compose, ExecOptions};
use crate::orchestrator;
use crate::sites::DOCUMENT_ROOT;
use crate::versions::{resolve_enabled_versions, PhpVersion};
use tracing::debug;

/// Where the sites directory is mounted inside the PHP and nginx containers
pub const CONTAINER_SITES_ROOT: &str = "/var/www/html";

const CONTAINER_USER: &str = "www-data";

/// Which PHP backend a tool runs in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendChoice {
    /// Explicit version, otherwise the current site's, otherwise the global default
    pub php: Option<PhpVersion>,
    pub xdebug: bool,
}

/// Container path of the site's working directory
pub fn container_dir(site: &CurrentSite) -> String {
    let mut dir = format!("{}/{}", CONTAINER_SITES_ROOT, site.name);
    for part in site.path_in_site.components() {
        if let Some(part) = part.as_os_str().to_str() {
            dir.push('/');
            dir.push_str(part);
        }
    }
    dir
}

fn container_document_root(site: &str) -> String {
    format!("{}/{}/{}", CONTAINER_SITES_ROOT, site, DOCUMENT_ROOT)
}

/// `cd <dir> && <words...>`, quoted for `/bin/sh -c`
fn cd_and_run(dir: &str, words: &[String]) -> String {
    format!("cd {} && {}", shell_words::quote(dir), shell_words::join(words))
}

pub struct Tools<'a> {
    ctx: &'a OperationContext,
    compose: Compose<'a>,
    interactive: bool,
}

impl<'a> Tools<'a> {
    pub fn new(ctx: &'a OperationContext, runner: &'a dyn CommandRunner) -> Self {
        Self {
            ctx,
            compose: Compose::new(runner, &ctx.config.compose_command, &ctx.run_dir),
            interactive: false,
        }
    }

    /// Allocate a TTY for container commands
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn compose(&self) -> &Compose<'a> {
        &self.compose
    }

    /// Compose service a tool should run in
    pub fn backend_service(&self, choice: &BackendChoice) -> Result<String> {
        let version = match &choice.php {
            Some(version) => {
                self.require_enabled(version)?;
                version.clone()
            }
            None => self.current_version()?,
        };
        let id = version.backend_id();
        Ok(if choice.xdebug {
            id.debug_service()
        } else {
            id.service()
        })
    }

    fn current_version(&self) -> Result<PhpVersion> {
        let default = &self.ctx.config.default_php_version;
        let Some(site) = &self.ctx.current_site else {
            return Ok(default.clone());
        };
        let site = self.ctx.registry().read(&site.name)?;
        Ok(site.php_version().unwrap_or(default).clone())
    }

    fn require_enabled(&self, version: &PhpVersion) -> Result<()> {
        let sites = self.ctx.registry().load_all()?;
        let enabled = resolve_enabled_versions(&self.ctx.config, &sites)?;
        if enabled.contains(version) {
            Ok(())
        } else {
            Err(Error::Precondition(format!(
                "PHP {} is not enabled; add it to additional_php_versions and run `portside reload`",
                version
            )))
        }
    }

    /// `/bin/sh -c <script>` as the web user in a backend
    pub fn script_spec(&self, service: &str, script: &str) -> Result<CommandSpec> {
        let options = ExecOptions {
            tty: self.interactive,
            inherit_output: true,
            user: Some(CONTAINER_USER),
            workdir: None,
        };
        self.compose
            .exec_spec(service, &options, ["/bin/sh", "-c", script])
    }

    pub fn wp_spec(&self, args: &[String], choice: &BackendChoice) -> Result<CommandSpec> {
        let script = match &self.ctx.current_site {
            Some(site) => {
                let mut words = vec![
                    "wp".to_string(),
                    format!("--path={}", container_document_root(&site.name)),
                ];
                words.extend(args.iter().cloned());
                cd_and_run(&container_dir(site), &words)
            }
            None if args == ["--info"] => {
                cd_and_run(CONTAINER_SITES_ROOT, &["wp".to_string(), "--info".to_string()])
            }
            None => {
                return Err(Error::Precondition(
                    "wp must be run from within a site directory".into(),
                ))
            }
        };
        self.script_spec(&self.backend_service(choice)?, &script)
    }

    pub fn composer_spec(&self, args: &[String], choice: &BackendChoice) -> Result<CommandSpec> {
        let dir = self
            .ctx
            .current_site
            .as_ref()
            .map(container_dir)
            .unwrap_or_else(|| CONTAINER_SITES_ROOT.to_string());
        let mut words = vec!["composer".to_string()];
        words.extend(args.iter().cloned());
        self.script_spec(&self.backend_service(choice)?, &cd_and_run(&dir, &words))
    }

    pub fn artisan_spec(&self, args: &[String], choice: &BackendChoice) -> Result<CommandSpec> {
        let site = self.ctx.require_site()?;
        let mut words = vec!["php".to_string(), "artisan".to_string()];
        words.extend(args.iter().cloned());
        let script = cd_and_run(&container_document_root(&site.name), &words);
        self.script_spec(&self.backend_service(choice)?, &script)
    }

    fn run_in_backend(&self, spec: Result<CommandSpec>) -> Result<()> {
        orchestrator::require_system_up(self.ctx, &self.compose)?;
        let spec = spec?;
        debug!(command = %spec.display(), "Running tool in container");
        self.compose.runner().run(&spec)?;
        Ok(())
    }

    pub fn wp(&self, args: &[String], choice: &BackendChoice) -> Result<()> {
        self.run_in_backend(self.wp_spec(args, choice))
    }

    pub fn composer(&self, args: &[String], choice: &BackendChoice) -> Result<()> {
        self.run_in_backend(self.composer_spec(args, choice))
    }

    pub fn artisan(&self, args: &[String], choice: &BackendChoice) -> Result<()> {
        self.run_in_backend(self.artisan_spec(args, choice))
    }

    /// Run SQL, or open a client session when `sql` is `None`. Inside a site its
    /// database is selected.
    pub fn mysql(&self, sql: Option<&str>) -> Result<()> {
        orchestrator::require_system_up(self.ctx, &self.compose)?;
        let service = self.ctx.config.default_php_version.backend_id().service();
        let db = Database::new(&self.compose, service, &self.ctx.config.database);
        let database = self.ctx.current_site.as_ref().map(|s| s.name.as_str());
        match sql {
            Some(sql) => db.execute_interactive(sql, database),
            None => db.open_client(database),
        }
    }

    /// Interactive shell in a service, the default backend when none is given
    pub fn shell(&self, service: Option<&str>) -> Result<()> {
        orchestrator::require_system_up(self.ctx, &self.compose)?;
        let service = match service {
            Some(s) => s.to_string(),
            None => self.ctx.config.default_php_version.backend_id().service(),
        };
        let program = if service.contains("mysql") || service.contains("php") {
            "bash"
        } else {
            "sh"
        };
        let options = ExecOptions {
            tty: self.interactive,
            inherit_output: true,
            ..Default::default()
        };
        self.compose.exec(&service, &options, [program])?;
        Ok(())
    }

    pub fn logs(&self, service: Option<&str>) -> Result<()> {
        orchestrator::require_system_up(self.ctx, &self.compose)?;
        self.compose.logs(service)
    }

    pub fn compose_passthrough(&self, args: &[String]) -> Result<()> {
        self.compose.passthrough(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::APP_DIR;
    use crate::exec::CommandOutput;
    use std::cell::RefCell;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct AlwaysUp {
        seen: RefCell<Vec<CommandSpec>>,
    }

    impl CommandRunner for AlwaysUp {
        fn spawn(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.seen.borrow_mut().push(spec.clone());
            Ok(CommandOutput::ok("Running"))
        }
    }

    fn runner() -> AlwaysUp {
        AlwaysUp {
            seen: RefCell::new(Vec::new()),
        }
    }

    fn context(dir: &TempDir, cwd: &std::path::Path) -> OperationContext {
        OperationContext::new(dir.path().to_path_buf(), dir.path().join(APP_DIR), cwd).unwrap()
    }

    fn site(dir: &TempDir, name: &str, settings: &str) -> PathBuf {
        let root = dir.path().join("Sites").join(name);
        std::fs::create_dir_all(root.join("htdocs/wp-content")).unwrap();
        std::fs::write(root.join("portside.toml"), settings).unwrap();
        root
    }

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn script(spec: &CommandSpec) -> &str {
        spec.args.last().map(String::as_str).unwrap_or_default()
    }

    #[test]
    fn test_container_dir() {
        let site = CurrentSite {
            name: "blog".into(),
            root: PathBuf::from("/home/me/Sites/blog"),
            path_in_site: PathBuf::from("htdocs/wp-content"),
        };
        assert_eq!(container_dir(&site), "/var/www/html/blog/htdocs/wp-content");
    }

    #[test]
    fn test_wp_runs_in_site_version() {
        let dir = TempDir::new().unwrap();
        let root = site(&dir, "legacy", "type = \"wordpress\"\ndefault_php_version = \"5.6\"\n");
        let ctx = context(&dir, &root.join("htdocs/wp-content"));
        let runner = runner();
        let tools = Tools::new(&ctx, &runner);

        let spec = tools
            .wp_spec(&args(&["plugin", "list", "--status=active"]), &BackendChoice::default())
            .unwrap();
        assert!(spec.args.contains(&"php56".to_string()));
        assert!(spec.args.contains(&"--user=www-data".to_string()));
        let expected = format!(
            "cd /var/www/html/legacy/htdocs/wp-content && {}",
            shell_words::join([
                "wp",
                "--path=/var/www/html/legacy/htdocs",
                "plugin",
                "list",
                "--status=active"
            ])
        );
        assert_eq!(script(&spec), expected);
    }

    #[test]
    fn test_wp_outside_site_only_allows_info() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, dir.path());
        let runner = runner();
        let tools = Tools::new(&ctx, &runner);

        let spec = tools
            .wp_spec(&args(&["--info"]), &BackendChoice::default())
            .unwrap();
        assert_eq!(script(&spec), "cd /var/www/html && wp --info");

        let err = tools
            .wp_spec(&args(&["plugin", "list"]), &BackendChoice::default())
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn test_artisan_requires_site_and_honours_xdebug() {
        let dir = TempDir::new().unwrap();
        let outside = context(&dir, dir.path());
        let runner = runner();
        assert!(Tools::new(&outside, &runner)
            .artisan_spec(&args(&["migrate"]), &BackendChoice::default())
            .is_err());

        let root = site(&dir, "api", "type = \"laravel\"\n");
        let ctx = context(&dir, &root);
        let choice = BackendChoice {
            php: None,
            xdebug: true,
        };
        let spec = Tools::new(&ctx, &runner)
            .artisan_spec(&args(&["tinker"]), &choice)
            .unwrap();
        assert!(spec.args.contains(&"php74-xdebug".to_string()));
        assert_eq!(script(&spec), "cd /var/www/html/api/htdocs && php artisan tinker");
    }

    #[test]
    fn test_explicit_version_must_be_enabled() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, dir.path());
        let runner = runner();
        let tools = Tools::new(&ctx, &runner);

        let choice = BackendChoice {
            php: Some(PhpVersion::parse("8.1").unwrap()),
            xdebug: false,
        };
        let err = tools.composer_spec(&args(&["install"]), &choice).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        site(&dir, "shop", "default_php_version = \"8.1\"\n");
        let spec = tools.composer_spec(&args(&["install"]), &choice).unwrap();
        assert!(spec.args.contains(&"php81".to_string()));
        assert_eq!(script(&spec), "cd /var/www/html && composer install");
    }

    #[test]
    fn test_arguments_are_quoted() {
        let dir = TempDir::new().unwrap();
        let root = site(&dir, "blog", "type = \"wordpress\"\n");
        let ctx = context(&dir, &root);
        let runner = runner();

        let spec = Tools::new(&ctx, &runner)
            .wp_spec(&args(&["post", "create", "--post_title=Hello world"]), &BackendChoice::default())
            .unwrap();
        assert!(script(&spec).ends_with("post create '--post_title=Hello world'"));
    }

    #[test]
    fn test_shell_program_by_service() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, dir.path());
        let runner = runner();
        let tools = Tools::new(&ctx, &runner).interactive(true);

        tools.shell(Some("mysql")).unwrap();
        tools.shell(Some("nginx")).unwrap();

        let seen = runner.seen.borrow();
        // Each shell call is preceded by a liveness probe
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[1].args.last().map(String::as_str), Some("bash"));
        assert_eq!(seen[3].args.last().map(String::as_str), Some("sh"));
        assert!(!seen[3].args.contains(&"-T".to_string()));
    }
}
