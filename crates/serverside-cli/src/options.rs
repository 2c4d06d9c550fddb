use anyhow::Context;
use clap::Args;
use serde_json::Value;
use serverside_core::config::{ConfigStore, Source};
use serverside_core::fleet::ServerFleet;
use serverside_core::server::{servers_from_instances, Server};
use serverside_core::transport::ShellTransport;
use std::path::PathBuf;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Shared flags
// ---------------------------------------------------------------------------

/// Flags every command takes: who the app is and where it runs.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Application name
    #[arg(long)]
    pub app: String,

    /// Environment name
    #[arg(long)]
    pub environment_name: String,

    /// Account name
    #[arg(long)]
    pub account_name: String,

    /// Framework environment (RAILS_ENV, RACK_ENV, ...)
    #[arg(long)]
    pub framework_env: String,

    /// Hostnames of every server in the environment
    #[arg(long, num_args = 1..)]
    pub instances: Vec<String>,

    /// Roles per instance
    #[arg(long, num_args = 1.., value_name = "HOST:ROLE,ROLE")]
    pub instance_roles: Vec<String>,

    /// Names per instance
    #[arg(long, num_args = 1.., value_name = "HOST:NAME")]
    pub instance_names: Vec<String>,

    /// Additional configuration, as a JSON object
    #[arg(long, value_name = "JSON")]
    pub config: Option<String>,

    /// Log commands and their output
    #[arg(long)]
    pub verbose: bool,

    /// Web stack (nginx_passenger, nginx_unicorn, ...)
    #[arg(long)]
    pub stack: Option<String>,
}

/// Flags selecting what gets deployed.
#[derive(Args, Debug, Clone, Default)]
pub struct SourceArgs {
    /// Git ref to deploy
    #[arg(long, visible_aliases = ["ref", "tag"])]
    pub branch: Option<String>,

    /// Git repository URI
    #[arg(long)]
    pub git: Option<String>,

    /// Deprecated alias for --git
    #[arg(long, hide = true)]
    pub repo: Option<String>,

    /// Archive URI to deploy instead of a git repository
    #[arg(long)]
    pub archive: Option<String>,

    /// Discard cached dependencies before installing
    #[arg(long)]
    pub clean: bool,

    /// Migration command
    #[arg(long)]
    pub migrate: Option<String>,

    /// Release directory to deploy into
    #[arg(long)]
    pub release_path: Option<PathBuf>,
}

fn insert_opt(source: &mut Source, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        source.insert(key.to_string(), Value::String(v.to_string()));
    }
}

impl CommonArgs {
    /// Command-line options as the highest-priority configuration source.
    /// Unset flags are left out so lower layers can supply them.
    pub fn source(&self) -> Source {
        let mut source = Source::new();
        for (key, value) in [
            ("app", &self.app),
            ("environment_name", &self.environment_name),
            ("account_name", &self.account_name),
            ("framework_env", &self.framework_env),
        ] {
            source.insert(key.to_string(), Value::String(value.clone()));
        }
        if self.verbose {
            source.insert("verbose".to_string(), Value::Bool(true));
        }
        insert_opt(&mut source, "stack", self.stack.as_deref());
        source
    }

    pub fn config_store(&self, source: Source) -> anyhow::Result<ConfigStore> {
        ConfigStore::new(source, self.config.as_deref()).context("invalid configuration")
    }

    pub fn fleet(&self, config: &ConfigStore) -> anyhow::Result<ServerFleet> {
        let servers = servers_from_instances(
            &self.instances,
            &self.instance_roles,
            &self.instance_names,
            &config.user(),
        )?;
        local_fleet(servers, config)
    }
}

impl SourceArgs {
    pub fn extend(&self, source: &mut Source) {
        insert_opt(source, "branch", self.branch.as_deref());
        insert_opt(source, "git", self.git.as_deref());
        insert_opt(source, "repo", self.repo.as_deref());
        insert_opt(source, "archive", self.archive.as_deref());
        insert_opt(source, "migrate", self.migrate.as_deref());
        let release_path = self.release_path.as_ref().map(|p| p.to_string_lossy());
        insert_opt(source, "release_path", release_path.as_deref());
        if self.clean {
            source.insert("clean".to_string(), Value::Bool(true));
        }
    }
}

/// A fleet reached through real processes and ssh.
pub fn local_fleet(servers: Vec<Server>, config: &ConfigStore) -> anyhow::Result<ServerFleet> {
    let transport = Arc::new(ShellTransport::default());
    Ok(ServerFleet::new(servers, transport, config.max_connections()?)?)
}
