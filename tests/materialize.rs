//! End-to-end materialization against a temporary home directory

mod common;

use common::{trust, FakeHosts, FakeRunner, TestEnv};
use portside::certificate::existing_names;
use portside::orchestrator::{generate_artifacts, Materializer, Phase, UpOutcome};
use portside::routing::{RequestSignals, RoutingRules};
use portside::versions::{resolve_enabled_versions, PhpVersion};
use portside::Error;
use serde_yaml::Value;
use std::collections::BTreeSet;

fn service_names(compose: &str) -> Vec<String> {
    let doc: Value = serde_yaml::from_str(compose).unwrap();
    doc["services"]
        .as_mapping()
        .unwrap()
        .keys()
        .map(|k| k.as_str().unwrap().to_string())
        .collect()
}

fn names(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_blog_and_api_scenario() {
    let env = TestEnv::new();
    env.site("blog", Some("type = \"wordpress\"\nhosts = [\"blog.dev\"]\n"));
    env.site("api", Some("type = \"php\"\nhosts = [\"api.dev\"]\n"));
    let ctx = env.context();
    let runner = FakeRunner::new();
    let hosts = FakeHosts::default();
    let trust = trust();

    let mut materializer = Materializer::new(&ctx, &runner, &hosts, &trust);
    assert_eq!(materializer.up().unwrap(), UpOutcome::Started);
    assert_eq!(materializer.phase(), Phase::Ready);

    // Registry order is alphabetical
    assert_eq!(
        env.run_file("hosts.txt"),
        "127.0.0.1 mysql\n127.0.0.1 api.dev\n127.0.0.1 blog.dev\n"
    );
    assert_eq!(
        existing_names(&ctx.cert_path()),
        Some(names(&["localhost", "blog.dev", "api.dev"]))
    );

    let services = service_names(&env.run_file("docker-compose.yml"));
    assert!(services.contains(&"php74".to_string()));
    assert!(services.contains(&"php74-xdebug".to_string()));
    assert!(!services.iter().any(|s| s.starts_with("php") && s != "php74" && s != "php74-xdebug"));

    for file in ["readme.txt", ".env", "nginx-php-upstreams.conf", "nginx-compiled-sites.conf"] {
        assert!(ctx.run_dir.join(file).is_file(), "{} missing", file);
    }
    assert!(ctx.run_dir.join("config/php.ini").is_file());
    assert!(ctx.run_dir.join("nginx-default-site/index.html").is_file());
}

#[test]
fn test_legacy_site_adds_backend_pair() {
    let env = TestEnv::new();
    env.site("legacy", Some("default_php_version = \"5.6\"\n"));
    let ctx = env.context();

    let artifacts = generate_artifacts(&ctx).unwrap();
    assert_eq!(artifacts.enabled.versions(), vec!["7.4", "5.6"]);

    let services = service_names(&artifacts.compose);
    for name in ["php74", "php74-xdebug", "php56", "php56-xdebug"] {
        assert!(services.contains(&name.to_string()), "{} missing", name);
    }
    assert!(!services.contains(&"php".to_string()));
}

#[test]
fn test_request_override_chain() {
    let env = TestEnv::new();
    env.site("legacy", Some("default_php_version = \"5.6\"\n"));
    env.site("plain", None);
    let ctx = env.context();
    let sites = ctx.registry().load_all().unwrap();
    let enabled = resolve_enabled_versions(&ctx.config, &sites).unwrap();
    let rules = RoutingRules::compile(&enabled);
    let site_default = PhpVersion::parse("7.4").unwrap().backend_id();

    let cookie = RequestSignals {
        cookie_version: Some("5.6"),
        ..Default::default()
    };
    assert_eq!(rules.resolve(&cookie, &site_default).unwrap().backend, "php56");

    let bogus_query = RequestSignals {
        query_version: Some("bogus"),
        cookie_version: Some("5.6"),
        ..Default::default()
    };
    assert_eq!(rules.resolve(&bogus_query, &site_default).unwrap().backend, "php56");

    let bogus_only = RequestSignals {
        query_version: Some("bogus"),
        ..Default::default()
    };
    assert_eq!(rules.resolve(&bogus_only, &site_default).unwrap().backend, "php74");
}

#[test]
fn test_routing_is_total() {
    let env = TestEnv::with_config(
        "default_php_version = \"7.4\"\nadditional_php_versions = [\"5.6\", \"8.1\"]\n[trust_store]\nkind = \"none\"\n",
    );
    let ctx = env.context();
    let enabled = resolve_enabled_versions(&ctx.config, &[]).unwrap();
    let rules = RoutingRules::compile(&enabled);

    let values = [Some("5.6"), Some("8.1"), Some("bogus"), Some(""), None];
    let debug = [Some("1"), Some("bogus"), None];
    for backend in enabled.iter() {
        for query in values {
            for cookie in values {
                for flag in debug {
                    let request = RequestSignals {
                        query_version: query,
                        cookie_version: cookie,
                        query_debug: flag,
                        cookie_debug: None,
                    };
                    let resolved = rules.resolve(&request, &backend.id);
                    assert!(
                        resolved.is_some(),
                        "no backend for {:?} on {}",
                        request,
                        backend.id
                    );
                }
            }
        }
    }
}

#[test]
fn test_similar_versions_get_distinct_backends() {
    let env = TestEnv::with_config(
        "default_php_version = \"7.1\"\nadditional_php_versions = [\"7.10\"]\n[trust_store]\nkind = \"none\"\n",
    );
    let artifacts = generate_artifacts(&env.context()).unwrap();
    let services = service_names(&artifacts.compose);
    assert!(services.contains(&"php71".to_string()));
    assert!(services.contains(&"php710".to_string()));
    assert!(artifacts.routing.contains("php710-noxdebug"));
}

#[test]
fn test_sites_without_settings_use_their_directory_name() {
    let env = TestEnv::new();
    env.site("blog", None);
    env.site("_scratch", None);

    let artifacts = generate_artifacts(&env.context()).unwrap();
    assert_eq!(artifacts.hostnames, vec!["_scratch.dev", "blog.dev"]);
    assert!(artifacts.hosts_file.contains("127.0.0.1 _scratch.dev\n"));
}

#[test]
fn test_generation_is_deterministic() {
    let env = TestEnv::new();
    env.site("blog", Some("type = \"wordpress\"\ndefault_php_version = \"8.1\"\n"));
    env.site("api", Some("hosts = [\"api.dev\", \"www.api.dev\"]\n"));
    let ctx = env.context();

    let first = generate_artifacts(&ctx).unwrap();
    let second = generate_artifacts(&ctx).unwrap();
    assert_eq!(first, second);

    let runner = FakeRunner::new();
    let hosts = FakeHosts::default();
    let trust = trust();
    let mut materializer = Materializer::new(&ctx, &runner, &hosts, &trust);
    materializer.reload().unwrap();
    let compose = env.run_file("docker-compose.yml");
    let routing = env.run_file("nginx-php-upstreams.conf");
    materializer.reload().unwrap();
    assert_eq!(env.run_file("docker-compose.yml"), compose);
    assert_eq!(env.run_file("nginx-php-upstreams.conf"), routing);
}

#[test]
fn test_rebuild_after_deleting_site_drops_its_hosts() {
    let env = TestEnv::new();
    env.site("blog", None);
    let shop = env.site("shop", None);
    let ctx = env.context();
    let runner = FakeRunner::new();
    let hosts = FakeHosts::default();
    let trust = trust();

    let mut materializer = Materializer::new(&ctx, &runner, &hosts, &trust);
    materializer.up().unwrap();
    assert!(env.run_file("hosts.txt").contains("shop.dev"));

    std::fs::remove_dir_all(shop).unwrap();
    materializer.reload().unwrap();

    assert_eq!(env.run_file("hosts.txt"), "127.0.0.1 mysql\n127.0.0.1 blog.dev\n");
    assert_eq!(
        existing_names(&ctx.cert_path()),
        Some(names(&["localhost", "blog.dev"]))
    );
    assert!(!env.run_file("nginx-compiled-sites.conf").contains("shop"));
}

#[test]
fn test_site_nginx_override_is_used_verbatim() {
    let env = TestEnv::new();
    let root = env.site("custom", Some("type = \"wordpress\"\n"));
    std::fs::write(root.join("nginx.conf"), "server { # hand written\n}\n").unwrap();
    env.site("other", None);

    let artifacts = generate_artifacts(&env.context()).unwrap();
    assert!(artifacts.sites_config.contains("server { # hand written\n}\n"));
    assert!(!artifacts
        .sites_config
        .contains("root /var/www/html/custom/htdocs;"));
    assert!(artifacts
        .sites_config
        .contains("root /var/www/html/other/htdocs;"));
}

#[test]
fn test_up_order_and_database_bootstrap() {
    let env = TestEnv::new();
    env.site("blog", None);
    let ctx = env.context();
    let runner = FakeRunner::new();
    let hosts = FakeHosts::default();
    let trust = trust();

    Materializer::new(&ctx, &runner, &hosts, &trust).up().unwrap();

    assert_eq!(hosts.calls(), vec!["load 127.0.0.1 mysql\n127.0.0.1 blog.dev"]);
    let up = runner.position(" up -d --remove-orphans").unwrap();
    let ping = runner.position("mysqladmin ping").unwrap();
    let user = runner.position("CREATE USER IF NOT EXISTS").unwrap();
    assert!(up < ping && ping < user);
    assert_eq!(runner.count_matching("update-ca-certificates"), 1);
}

#[test]
fn test_up_when_running_does_nothing() {
    let env = TestEnv::new();
    let ctx = env.context();
    let runner = FakeRunner::running();
    let hosts = FakeHosts::default();
    let trust = trust();

    let outcome = Materializer::new(&ctx, &runner, &hosts, &trust).up().unwrap();
    assert_eq!(outcome, UpOutcome::AlreadyRunning);
    assert_eq!(runner.count_matching(" up -d"), 0);
    assert!(!ctx.run_dir.exists());
}

#[test]
fn test_database_timeout_aborts_up() {
    let env = TestEnv::new();
    let ctx = env.context();
    let runner = FakeRunner::new();
    runner.database_up.set(false);
    let hosts = FakeHosts::default();
    let trust = trust();

    let mut materializer = Materializer::new(&ctx, &runner, &hosts, &trust);
    let err = materializer.up().unwrap_err();
    assert!(matches!(err, Error::Timeout { attempts: 3, .. }));
    assert_eq!(materializer.phase(), Phase::WaitingForDatabase);
    assert_eq!(runner.count_matching("mysqladmin ping"), 3);
    assert_eq!(runner.count_matching("CREATE USER"), 0);
}

#[test]
fn test_failed_compose_up_is_fatal() {
    let env = TestEnv::new();
    let ctx = env.context();
    let runner = FakeRunner::new();
    *runner.fail_on.borrow_mut() = Some(" up -d".to_string());
    let hosts = FakeHosts::default();
    let trust = trust();

    let mut materializer = Materializer::new(&ctx, &runner, &hosts, &trust);
    assert!(matches!(materializer.up(), Err(Error::ExternalTool { .. })));
    assert_eq!(materializer.phase(), Phase::StartingTopology);
}

#[test]
fn test_down_stops_and_unloads_hosts() {
    let env = TestEnv::new();
    env.site("blog", None);
    let ctx = env.context();
    let runner = FakeRunner::new();
    let hosts = FakeHosts::default();
    let trust = trust();

    let mut materializer = Materializer::new(&ctx, &runner, &hosts, &trust);
    materializer.up().unwrap();
    materializer.down().unwrap();

    assert_eq!(materializer.phase(), Phase::Down);
    assert_eq!(runner.count_matching("portside stop"), 1);
    assert_eq!(
        hosts.calls().last().unwrap(),
        &format!("unload {}", ctx.hosts_file_path().display())
    );
    assert!(!materializer.is_system_up().unwrap());
}

#[test]
fn test_compose_override_is_merged() {
    let env = TestEnv::new();
    std::fs::write(
        env.app_home().join("docker-compose.custom.yml"),
        "services:\n  nginx:\n    ports:\n      - \"8443:443\"\n  adminer:\n    image: adminer\n",
    )
    .unwrap();

    let artifacts = generate_artifacts(&env.context()).unwrap();
    let doc: Value = serde_yaml::from_str(&artifacts.compose).unwrap();
    assert_eq!(doc["services"]["adminer"]["image"].as_str(), Some("adminer"));
    assert_eq!(doc["services"]["nginx"]["ports"][0].as_str(), Some("8443:443"));
    // Keys the override does not mention survive
    assert!(doc["services"]["nginx"]["volumes"].is_sequence());
}

#[test]
fn test_status_reports_sites_and_versions() {
    let env = TestEnv::new();
    env.site("legacy", Some("default_php_version = \"5.6\"\nhosts = [\"old.dev\"]\n"));
    let ctx = env.context();
    let runner = FakeRunner::running();
    let hosts = FakeHosts::default();
    let trust = trust();

    let status = Materializer::new(&ctx, &runner, &hosts, &trust).status().unwrap();
    assert!(status.running);
    assert_eq!(status.versions, vec!["7.4", "5.6"]);
    assert_eq!(status.sites, vec![("legacy".to_string(), vec!["old.dev".to_string()])]);
}

#[test]
fn test_malformed_site_settings_abort_generation() {
    let env = TestEnv::new();
    env.site("broken", Some("hosts = \"not a list\"\n"));
    let err = generate_artifacts(&env.context()).unwrap_err();
    assert!(matches!(err, Error::MalformedSettings { .. }));
}
