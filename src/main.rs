//! Portside command line
//!
//! Usage:
//!   portside up                    Build the run directory and start everything
//!   portside reload                Pick up new sites and configuration changes
//!   portside down                  Stop containers and remove hosts entries
//!   portside create <site>         Create a new site
//!   portside wp plugin list        Run WP-CLI for the current site

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use portside::exec::SystemRunner;
use portside::hosts::HostileCli;
use portside::orchestrator::{self, Materializer, SystemStatus, UpOutcome};
use portside::provision::{NewSite, Provisioner};
use portside::sites::SiteType;
use portside::tools::{BackendChoice, Tools};
use portside::versions::PhpVersion;
use portside::{Error, OperationContext};
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "portside", version, about = "Local PHP development environments on docker compose", long_about = None)]
struct Cli {
    /// App home holding config.toml and generated files
    #[arg(long, global = true, env = "PORTSIDE_HOME")]
    home: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct BackendArgs {
    /// Run with this PHP version instead of the site's
    #[arg(long)]
    php: Option<PhpVersion>,

    /// Run in the Xdebug-enabled backend
    #[arg(long)]
    xdebug: bool,
}

impl BackendArgs {
    fn choice(self) -> BackendChoice {
        BackendChoice {
            php: self.php,
            xdebug: self.xdebug,
        }
    }
}

#[derive(Args)]
struct CreateArgs {
    /// Site directory name
    name: String,

    /// php, wordpress, laravel or proxy
    #[arg(long = "type", short, default_value = "php")]
    site_type: SiteType,

    /// Primary host name, `<name>.dev` by default
    #[arg(long)]
    domain: Option<String>,

    #[arg(long)]
    php: Option<PhpVersion>,

    /// Local port a proxy site forwards to
    #[arg(long)]
    proxy_port: Option<u16>,

    /// Create a database for a plain PHP site
    #[arg(long)]
    database: bool,

    /// Git repository for the Laravel app or the WordPress wp-content directory
    #[arg(long)]
    repo: Option<String>,

    /// Fetch missing WordPress uploads from this site
    #[arg(long)]
    uploads_proxy: Option<String>,

    /// Fetch missing Laravel storage files from this site
    #[arg(long)]
    storage_proxy: Option<String>,

    /// Install the Redis object cache drop-in (WordPress)
    #[arg(long)]
    object_cache: bool,
}

impl From<CreateArgs> for NewSite {
    fn from(args: CreateArgs) -> Self {
        let mut site = NewSite::new(args.name, args.site_type);
        site.domain = args.domain;
        site.php_version = args.php;
        site.proxy_port = args.proxy_port;
        site.create_database = args.database;
        site.repo_url = args.repo;
        site.uploads_proxy_url = args.uploads_proxy;
        site.storage_proxy_url = args.storage_proxy;
        site.object_cache = args.object_cache;
        site
    }
}

#[derive(Subcommand)]
enum Command {
    /// Build the run directory and start the environment
    Up,
    /// Rebuild generated files and apply them
    Reload,
    /// Stop the environment and remove hosts entries
    Down,
    /// Restart one service, or everything
    Restart { service: Option<String> },
    /// Pull newer container images
    UpdateContainers,
    /// Show whether the environment is running and which sites it serves
    Status,
    /// Create a new site
    Create(CreateArgs),
    /// Delete a site with its database and hosts entries
    Delete { name: String },
    /// Run WP-CLI in the current site
    Wp {
        #[command(flatten)]
        backend: BackendArgs,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run Composer in the current directory
    Composer {
        #[command(flatten)]
        backend: BackendArgs,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run Artisan in the current Laravel site
    Artisan {
        #[command(flatten)]
        backend: BackendArgs,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run SQL, or open a MySQL client, against the current site's database
    Mysql { sql: Option<String> },
    /// Open a shell in a container
    Shell { service: Option<String> },
    /// Follow container logs
    Logs { service: Option<String> },
    /// Pass arguments through to docker compose
    Compose {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn init_logging(verbose: bool) {
    let directive = if verbose { "portside=debug" } else { "portside=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_status(status: &SystemStatus) {
    if status.running {
        println!("Portside is {}.", "running".green());
    } else {
        println!("Portside is {}.", "stopped".yellow());
    }
    println!("PHP versions: {}", status.versions.join(", "));
    if status.sites.is_empty() {
        println!("No sites.");
        return;
    }
    println!("Sites:");
    for (name, hosts) in &status.sites {
        println!("  {:<20} https://{}", name, hosts.join(", https://"));
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let cwd = std::env::current_dir().context("Cannot read the working directory")?;
    let ctx = OperationContext::discover(cli.home, &cwd)?;

    let runner = SystemRunner;
    let hosts = HostileCli::new(&runner, &ctx.config.hosts_command);
    let trust = orchestrator::trust_store(&ctx.config.trust_store, &runner);
    let mut materializer = Materializer::new(&ctx, &runner, &hosts, trust.as_ref());
    let interactive = std::io::stdin().is_terminal() && std::io::stdout().is_terminal();
    let tools = Tools::new(&ctx, &runner).interactive(interactive);

    match cli.command {
        Command::Up => match materializer.up()? {
            UpOutcome::Started => println!("{}", "Portside is up.".green()),
            UpOutcome::AlreadyRunning => println!("Portside is already running."),
        },
        Command::Reload => {
            materializer.reload()?;
            println!("{}", "Portside reloaded.".green());
        }
        Command::Down => {
            materializer.down()?;
            println!("{}", "Portside is down.".green());
        }
        Command::Restart { service } => materializer.restart(service.as_deref())?,
        Command::UpdateContainers => materializer.update_containers()?,
        Command::Status => print_status(&materializer.status()?),
        Command::Create(args) => {
            let new = NewSite::from(args);
            let domain = new.domain();
            Provisioner::new(&ctx, &runner, &hosts).create_site(&new)?;
            materializer.reload()?;
            println!(
                "{}",
                format!("Site {} is ready at https://{}", new.name, domain).green()
            );
        }
        Command::Delete { name } => {
            Provisioner::new(&ctx, &runner, &hosts).delete_site(&name)?;
            materializer.reload()?;
            println!("{}", format!("Site {} deleted.", name).green());
        }
        Command::Wp { backend, args } => tools.wp(&args, &backend.choice())?,
        Command::Composer { backend, args } => tools.composer(&args, &backend.choice())?,
        Command::Artisan { backend, args } => tools.artisan(&args, &backend.choice())?,
        Command::Mysql { sql } => tools.mysql(sql.as_deref())?,
        Command::Shell { service } => tools.shell(service.as_deref())?,
        Command::Logs { service } => tools.logs(service.as_deref())?,
        Command::Compose { args } => tools.compose_passthrough(&args)?,
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        let (label, code) = match e.downcast_ref::<Error>() {
            Some(err) => (err.class().label(), err.class().exit_code()),
            None => ("error", 1),
        };
        eprintln!("{} {:#}", format!("{}:", label).red().bold(), e);
        std::process::exit(code);
    }
}
