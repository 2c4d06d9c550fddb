//! The maintenance page: a static file in `shared/system` that the web tier
//! serves instead of the app while it exists.

use crate::config::ConfigStore;
use crate::error::{DeployError, Result};
use crate::fleet::ServerFleet;
use crate::paths::ReleasePaths;
use crate::server::Role;
use crate::transport::{shell_quote, CommandSpec};
use std::fmt;
use std::path::PathBuf;
use tracing::info;

pub const DEFAULT_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>Down for maintenance</title></head>\n<body>\n<h1>We'll be right back.</h1>\n<p>This site is down for scheduled maintenance.</p>\n</body>\n</html>\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceStatus {
    Up,
    Down,
}

impl fmt::Display for MaintenanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaintenanceStatus::Up => f.write_str("up"),
            MaintenanceStatus::Down => f.write_str("down"),
        }
    }
}

/// Whether this deploy puts the page up: migrations with
/// `maintenance_on_migrate`, or `maintenance_on_restart`.
pub fn using_maintenance_page(config: &ConfigStore) -> bool {
    (config.is_migrate() && config.maintenance_on_migrate()) || config.maintenance_on_restart()
}

pub struct Maintenance<'a> {
    paths: &'a ReleasePaths,
    fleet: &'a ServerFleet,
}

impl<'a> Maintenance<'a> {
    pub fn new(paths: &'a ReleasePaths, fleet: &'a ServerFleet) -> Self {
        Self { paths, fleet }
    }

    /// Judged from the orchestrator's own copy of `shared/system`.
    pub fn status(&self) -> MaintenanceStatus {
        if self.paths.maintenance_page().exists() {
            MaintenanceStatus::Up
        } else {
            MaintenanceStatus::Down
        }
    }

    fn deployed(&self) -> bool {
        self.paths.current().exists()
    }

    /// The app's own page if it ships one, first match wins.
    fn page_candidates(&self) -> Vec<PathBuf> {
        let public = self.paths.public();
        vec![
            public.join("maintenance.html.custom"),
            public.join("maintenance.html.tmp"),
            public.join("maintenance.html"),
            public.join("system").join("maintenance.html.default"),
        ]
    }

    fn app_servers(&self) -> ServerFleet {
        self.fleet.select(&Role::app_roles())
    }

    pub fn enable(&self) -> Result<()> {
        if !self.deployed() {
            return Err(DeployError::NotDeployed(format!(
                "Cannot enable maintenance page. Application {} has never been deployed.",
                self.paths.app_name()
            )));
        }
        self.put_up()
    }

    fn put_up(&self) -> Result<()> {
        let page = self.paths.maintenance_page();
        let dest = shell_quote(&page.to_string_lossy());
        let system = shell_quote(&self.paths.shared_system().to_string_lossy());
        let write = match crate::io::first_existing(&self.page_candidates()) {
            Some(src) => {
                info!("Enabling maintenance page using {}.", src.display());
                format!("cp {} {dest}", shell_quote(&src.to_string_lossy()))
            }
            None => {
                info!("Enabling default maintenance page.");
                format!("printf '%s' {} > {dest}", shell_quote(DEFAULT_PAGE))
            }
        };
        self.app_servers()
            .run(CommandSpec::new(format!("mkdir -p {system} && {write}")))?;
        Ok(())
    }

    pub fn disable(&self) -> Result<()> {
        info!("Removing maintenance page.");
        let page = shell_quote(&self.paths.maintenance_page().to_string_lossy());
        self.app_servers()
            .run(CommandSpec::new(format!("rm -f {page}")))?;
        Ok(())
    }

    /// Put the page up if this deploy calls for it. A first deploy has
    /// nothing serving traffic, so there is nothing to cover.
    pub fn conditionally_enable(&self, config: &ConfigStore) -> Result<()> {
        if !using_maintenance_page(config) {
            return Ok(());
        }
        if !self.deployed() {
            info!("Skipping maintenance page. (No current release to cover.)");
            return Ok(());
        }
        self.put_up()
    }

    pub fn conditionally_disable(&self, config: &ConfigStore) -> Result<()> {
        if using_maintenance_page(config) {
            self.disable()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::source_from;
    use crate::fleet::tests::standard_servers;
    use crate::transport::testing::RecordingTransport;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn deployed_paths(dir: &TempDir) -> ReleasePaths {
        let paths = ReleasePaths::for_release("shop", dir.path(), "1");
        std::fs::create_dir_all(paths.active_release()).unwrap();
        std::fs::create_dir_all(paths.current()).unwrap();
        paths
    }

    fn config(value: serde_json::Value) -> ConfigStore {
        ConfigStore::from_source(source_from(value))
    }

    #[test]
    fn predicate() {
        assert!(using_maintenance_page(&config(json!({}))));
        assert!(!using_maintenance_page(&config(json!({"stack": "nginx_passenger"}))));
        assert!(using_maintenance_page(&config(json!({"stack": "nginx_passenger", "migrate": "rake db:migrate"}))));
        assert!(!using_maintenance_page(&config(json!({
            "stack": "nginx_passenger",
            "migrate": "rake db:migrate",
            "maintenance_on_migrate": false,
        }))));
    }

    #[test]
    fn enable_runs_on_app_servers_only() {
        let dir = TempDir::new().unwrap();
        let paths = deployed_paths(&dir);
        let transport = Arc::new(RecordingTransport::new());
        let fleet = ServerFleet::new(standard_servers(), transport.clone(), 4).unwrap();
        Maintenance::new(&paths, &fleet).enable().unwrap();
        assert_eq!(transport.calls().len(), 3);
        assert!(transport.commands_on("db").is_empty());
        assert!(transport.commands()[0].contains("shared/system/maintenance.html"));
    }

    #[test]
    fn prefers_app_page() {
        let dir = TempDir::new().unwrap();
        let paths = deployed_paths(&dir);
        std::fs::create_dir_all(paths.public()).unwrap();
        std::fs::write(paths.public().join("maintenance.html"), "custom").unwrap();
        let transport = Arc::new(RecordingTransport::new());
        let fleet = ServerFleet::new(standard_servers(), transport.clone(), 4).unwrap();
        Maintenance::new(&paths, &fleet).enable().unwrap();
        assert!(transport.commands()[0].contains("public/maintenance.html "));
    }

    #[test]
    fn enable_requires_a_deploy() {
        let dir = TempDir::new().unwrap();
        let paths = ReleasePaths::for_release("shop", dir.path(), "1");
        let transport = Arc::new(RecordingTransport::new());
        let fleet = ServerFleet::new(standard_servers(), transport, 4).unwrap();
        let err = Maintenance::new(&paths, &fleet).enable().unwrap_err();
        assert!(err.to_string().contains("has never been deployed"));
    }

    #[test]
    fn conditional_skips_first_deploy_and_unneeded() {
        let dir = TempDir::new().unwrap();
        let paths = ReleasePaths::for_release("shop", dir.path(), "1");
        let transport = Arc::new(RecordingTransport::new());
        let fleet = ServerFleet::new(standard_servers(), transport.clone(), 4).unwrap();
        let maintenance = Maintenance::new(&paths, &fleet);
        maintenance.conditionally_enable(&config(json!({}))).unwrap();
        maintenance
            .conditionally_enable(&config(json!({"stack": "nginx_passenger"})))
            .unwrap();
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn status_reads_local_page() {
        let dir = TempDir::new().unwrap();
        let paths = deployed_paths(&dir);
        let transport = Arc::new(RecordingTransport::new());
        let fleet = ServerFleet::new(standard_servers(), transport, 4).unwrap();
        let maintenance = Maintenance::new(&paths, &fleet);
        assert_eq!(maintenance.status(), MaintenanceStatus::Down);
        std::fs::create_dir_all(paths.shared_system()).unwrap();
        std::fs::write(paths.maintenance_page(), "x").unwrap();
        assert_eq!(maintenance.status(), MaintenanceStatus::Up);
        assert_eq!(maintenance.status().to_string(), "up");
    }
}
