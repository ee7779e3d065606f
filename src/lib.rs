//! Portside - local development environments for PHP sites on docker compose
//!
//! This library turns a directory of sites into a running environment:
//! - Reads per-site settings and resolves the set of PHP versions to run
//! - Compiles nginx routing maps that pick a PHP backend per request
//!   (`?php=` query, `php` cookie, site default, global default)
//! - Renders one nginx server block per site from bundled templates
//! - Assembles the docker compose topology with one service pair per version
//! - Maintains hosts file entries and a self-signed certificate for all sites
//! - Runs developer tools (wp, composer, artisan, mysql) inside the containers

pub mod certificate;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod exec;
pub mod hosts;
pub mod orchestrator;
pub mod provision;
pub mod routing;
pub mod site_config;
pub mod sites;
pub mod templates;
pub mod tools;
pub mod topology;
pub mod versions;

pub use context::OperationContext;
pub use error::{Error, ErrorClass, Result};

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
